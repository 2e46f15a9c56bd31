use super::{Context, State, StateHandler, TimerKind, go_query, internal_topic_failed};
use crate::pool::{
    filter::{self, Filter},
    host::HostId,
    message::{Channel, MessageBody},
};
use log::{error, info, warn};

/// Proves the bus works for this host before trusting anything else on it:
/// a heartbeat is sent to the host's own channel and must come back.
#[derive(Debug)]
pub struct StartState {
    heartbeat_timestamp: i64,
}

impl StartState {
    pub fn new(heartbeat_timestamp: i64) -> Self {
        Self {
            heartbeat_timestamp,
        }
    }

    pub fn heartbeat_timestamp(&self) -> i64 {
        self.heartbeat_timestamp
    }
}

impl StateHandler for StartState {
    fn start(&mut self, ctx: &mut dyn Context) {
        let own_channel = Channel::Host(ctx.host().clone());
        ctx.publish(
            own_channel,
            MessageBody::Heartbeat {
                timestamp_ms: self.heartbeat_timestamp,
            },
        );

        let timeout = ctx.config().start_heartbeat;
        ctx.schedule(TimerKind::StartHeartbeat, timeout, false);
    }

    fn filter(&self, ctx: &dyn Context) -> Filter {
        filter::own_heartbeat(ctx.host(), self.heartbeat_timestamp)
    }

    fn on_timer(&mut self, ctx: &mut dyn Context, kind: TimerKind) -> Option<State> {
        if kind != TimerKind::StartHeartbeat {
            return None;
        }

        error!("{} never saw its own heartbeat, internal topic failed", ctx.host());
        Some(internal_topic_failed(ctx))
    }

    fn process_heartbeat(
        &mut self,
        ctx: &mut dyn Context,
        source: &HostId,
        timestamp_ms: i64,
    ) -> Option<State> {
        if source != ctx.host() || timestamp_ms != self.heartbeat_timestamp {
            return None;
        }

        info!("{} saw its own heartbeat, querying the pool", ctx.host());
        ctx.publish(Channel::Admin, MessageBody::Query);

        Some(go_query(ctx))
    }

    fn process_forward(
        &mut self,
        ctx: &mut dyn Context,
        _payload: serde_json::Value,
        num_hops: u32,
    ) -> Option<State> {
        warn!("{} dropping event forwarded after {num_hops} hops while starting", ctx.host());
        None
    }
}
