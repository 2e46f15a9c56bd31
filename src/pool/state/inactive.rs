use super::{Context, State, StateHandler, TimerKind, go_start, respond_to_query};
use crate::pool::{assignments::BucketAssignments, host::HostId};
use log::{debug, info};
use std::sync::Arc;

/// The host owns no bucket. It keeps its routing table current and starts
/// over after a back-off.
#[derive(Debug, Default)]
pub struct InactiveState;

impl InactiveState {
    pub fn new() -> Self {
        Self
    }
}

impl StateHandler for InactiveState {
    fn start(&mut self, ctx: &mut dyn Context) {
        let delay = ctx.config().reactivate;
        ctx.schedule(TimerKind::Reactivate, delay, false);
    }

    fn on_timer(&mut self, ctx: &mut dyn Context, kind: TimerKind) -> Option<State> {
        if kind != TimerKind::Reactivate {
            return None;
        }

        info!("{} reactivating", ctx.host());
        Some(go_start(ctx))
    }

    fn process_leader(
        &mut self,
        ctx: &mut dyn Context,
        source: &HostId,
        assignments: Arc<BucketAssignments>,
    ) -> Option<State> {
        debug!("{} adopting assignments from {source} while inactive", ctx.host());
        ctx.start_distributing(Some(assignments));
        None
    }

    fn process_query(&mut self, ctx: &mut dyn Context, source: &HostId) -> Option<State> {
        Some(respond_to_query(ctx, source))
    }
}
