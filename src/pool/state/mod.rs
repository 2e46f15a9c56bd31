//! Per-host finite state machine.
//!
//! A host is always in exactly one [`State`]. Incoming messages and timer
//! expiries are handed to it one at a time by the manager; a handler returns
//! `Some(next)` to replace the current state. The manager then cancels every
//! timer the old state armed, installs the new state's bus filter and calls
//! [`State::start`] before anything else is processed.

mod active;
mod idle;
mod inactive;
mod processing;
mod query;
mod start;

pub use active::ActiveState;
pub use idle::IdleState;
pub use inactive::InactiveState;
pub use query::QueryState;
pub use start::StartState;

use crate::config::PoolConfig;
use crate::pool::{
    assignments::BucketAssignments,
    filter::{self, Filter},
    host::HostId,
    message::{Channel, Message, MessageBody},
};
use log::warn;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;

/// Services a state needs from the host that runs it.
pub trait Context {
    fn host(&self) -> &HostId;

    fn config(&self) -> &PoolConfig;

    /// Assignments currently used for routing events.
    fn assignments(&self) -> Option<Arc<BucketAssignments>>;

    /// Sends a message from this host. Failures are logged, never returned.
    fn publish(&mut self, channel: Channel, body: MessageBody);

    /// Arms a timer owned by the current state. It fires once after `delay`,
    /// or every `delay` when `repeat` is set, until the state is replaced.
    fn schedule(&mut self, kind: TimerKind, delay: Duration, repeat: bool);

    /// Makes `assignments` the routing table and flushes events queued while
    /// there was none.
    fn start_distributing(&mut self, assignments: Option<Arc<BucketAssignments>>);

    /// An event forwarded to this host by another one.
    fn handle_forward(&mut self, payload: Value, num_hops: u32);

    /// A heartbeat timestamp never handed out before by this host.
    fn next_timestamp(&mut self) -> i64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimerKind {
    StartHeartbeat,
    Identification,
    AwaitLeader,
    SendHeartbeat,
    OwnHeartbeatCheck,
    PredecessorCheck,
    Reactivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StateKind {
    Idle,
    Start,
    Query,
    Active,
    Inactive,
}

/// Per-state behaviour. Every handler defaults to ignoring its input, except
/// forwarded events which are handed to the host for processing.
pub(crate) trait StateHandler {
    fn start(&mut self, _ctx: &mut dyn Context) {}

    fn filter(&self, ctx: &dyn Context) -> Filter {
        filter::admin_or_host(ctx.host())
    }

    fn on_timer(&mut self, _ctx: &mut dyn Context, _kind: TimerKind) -> Option<State> {
        None
    }

    fn process_heartbeat(
        &mut self,
        _ctx: &mut dyn Context,
        _source: &HostId,
        _timestamp_ms: i64,
    ) -> Option<State> {
        None
    }

    fn process_identification(
        &mut self,
        _ctx: &mut dyn Context,
        _source: &HostId,
        _assignments: Option<Arc<BucketAssignments>>,
    ) -> Option<State> {
        None
    }

    /// `assignments` has already been checked to be made by `source`.
    fn process_leader(
        &mut self,
        _ctx: &mut dyn Context,
        _source: &HostId,
        _assignments: Arc<BucketAssignments>,
    ) -> Option<State> {
        None
    }

    fn process_offline(&mut self, _ctx: &mut dyn Context, _source: &HostId) -> Option<State> {
        None
    }

    fn process_query(&mut self, _ctx: &mut dyn Context, _source: &HostId) -> Option<State> {
        None
    }

    fn process_forward(
        &mut self,
        ctx: &mut dyn Context,
        payload: Value,
        num_hops: u32,
    ) -> Option<State> {
        ctx.handle_forward(payload, num_hops);
        None
    }
}

#[derive(Debug)]
pub enum State {
    Idle(IdleState),
    Start(StartState),
    Query(QueryState),
    Active(ActiveState),
    Inactive(InactiveState),
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Idle(_) => StateKind::Idle,
            State::Start(_) => StateKind::Start,
            State::Query(_) => StateKind::Query,
            State::Active(_) => StateKind::Active,
            State::Inactive(_) => StateKind::Inactive,
        }
    }

    fn handler(&self) -> &dyn StateHandler {
        match self {
            State::Idle(s) => s,
            State::Start(s) => s,
            State::Query(s) => s,
            State::Active(s) => s,
            State::Inactive(s) => s,
        }
    }

    fn handler_mut(&mut self) -> &mut dyn StateHandler {
        match self {
            State::Idle(s) => s,
            State::Start(s) => s,
            State::Query(s) => s,
            State::Active(s) => s,
            State::Inactive(s) => s,
        }
    }

    /// Called once, right after the state became current.
    pub fn start(&mut self, ctx: &mut dyn Context) {
        self.handler_mut().start(ctx)
    }

    pub fn filter(&self, ctx: &dyn Context) -> Filter {
        self.handler().filter(ctx)
    }

    pub fn on_timer(&mut self, ctx: &mut dyn Context, kind: TimerKind) -> Option<State> {
        self.handler_mut().on_timer(ctx, kind)
    }

    pub fn process(&mut self, ctx: &mut dyn Context, message: Message) -> Option<State> {
        let Message {
            source,
            channel,
            body,
        } = message;

        let handler = self.handler_mut();

        match body {
            MessageBody::Heartbeat { timestamp_ms } => {
                handler.process_heartbeat(ctx, &source, timestamp_ms)
            }
            MessageBody::Identification { assignments } => {
                handler.process_identification(ctx, &source, assignments)
            }
            MessageBody::Leader {
                assignments: Some(assignments),
            } if assignments.leader() == &source => {
                handler.process_leader(ctx, &source, assignments)
            }
            MessageBody::Leader { .. } => {
                warn!("discarding inconsistent leader message from {source}");
                None
            }
            MessageBody::Offline => handler.process_offline(ctx, &source),
            MessageBody::Query => handler.process_query(ctx, &source),
            MessageBody::Forward { payload, num_hops } => {
                if channel != Channel::Host(ctx.host().clone()) {
                    warn!("discarding forward from {source} addressed to {channel}");
                    return None;
                }
                handler.process_forward(ctx, payload, num_hops)
            }
        }
    }
}

/// Active if `assignments` give this host a bucket, inactive otherwise.
pub(crate) fn go_active(
    ctx: &mut dyn Context,
    assignments: Option<Arc<BucketAssignments>>,
) -> State {
    ctx.start_distributing(assignments.clone());

    match assignments {
        Some(assignments) if assignments.has_assignment(ctx.host()) => {
            State::Active(ActiveState::new(ctx.host().clone(), assignments))
        }
        _ => State::Inactive(InactiveState::new()),
    }
}

pub(crate) fn go_query(ctx: &mut dyn Context) -> State {
    let assignments = ctx.assignments();
    ctx.start_distributing(assignments.clone());

    State::Query(QueryState::new(ctx.host().clone(), assignments))
}

pub(crate) fn go_start(ctx: &mut dyn Context) -> State {
    let assignments = ctx.assignments();
    ctx.start_distributing(assignments);

    State::Start(StartState::new(ctx.next_timestamp()))
}

pub(crate) fn go_inactive(ctx: &mut dyn Context) -> State {
    let assignments = ctx.assignments();
    ctx.start_distributing(assignments);

    State::Inactive(InactiveState::new())
}

/// Administrative stop: no routing table, no timers, no traffic.
pub(crate) fn go_idle(ctx: &mut dyn Context) -> State {
    ctx.start_distributing(None);

    State::Idle(IdleState)
}

/// Answers a query with what this host knows and joins the discovery round,
/// counting the querier as alive.
pub(crate) fn respond_to_query(ctx: &mut dyn Context, source: &HostId) -> State {
    let assignments = ctx.assignments();
    ctx.publish(
        Channel::Admin,
        MessageBody::Identification {
            assignments: assignments.clone(),
        },
    );
    ctx.start_distributing(assignments.clone());

    let mut query = QueryState::new(ctx.host().clone(), assignments);
    query.record(source, None);
    State::Query(query)
}

/// The bus path of this host is broken: announce it, forget the assignments
/// and back off.
pub(crate) fn internal_topic_failed(ctx: &mut dyn Context) -> State {
    ctx.publish(Channel::Admin, MessageBody::Offline);
    ctx.start_distributing(None);

    go_inactive(ctx)
}
