use super::{Context, State, StateHandler, TimerKind, go_active, processing::Processing};
use crate::pool::{
    assignments::BucketAssignments,
    host::HostId,
    message::{Channel, MessageBody},
};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Discovery round: collect identifications, then either lead or wait for the
/// leader.
#[derive(Debug)]
pub struct QueryState {
    processing: Processing,
    alive: BTreeSet<HostId>,
    /// Set once the identification period is over and a smaller host exists.
    awaiting_leader: bool,
}

impl QueryState {
    pub fn new(host: HostId, assignments: Option<Arc<BucketAssignments>>) -> Self {
        let alive = BTreeSet::from([host.clone()]);

        Self {
            processing: Processing::new(host.clone(), host, assignments),
            alive,
            awaiting_leader: false,
        }
    }

    #[cfg(test)]
    pub fn leader(&self) -> &HostId {
        &self.processing.leader
    }

    #[cfg(test)]
    pub fn alive(&self) -> &BTreeSet<HostId> {
        &self.alive
    }

    #[cfg(test)]
    pub fn assignments(&self) -> Option<&Arc<BucketAssignments>> {
        self.processing.assignments.as_ref()
    }

    fn update_leader(&mut self) {
        if let Some(first) = self.alive.first() {
            self.processing.leader = first.clone();
        }
    }

    pub(super) fn record(&mut self, source: &HostId, assignments: Option<Arc<BucketAssignments>>) {
        self.alive.insert(source.clone());
        self.update_leader();

        let Some(assignments) = assignments else {
            return;
        };

        // Only ever move to assignments made by a smaller leader, so that
        // hosts hearing identifications in different orders settle on the
        // same ones.
        let better = match &self.processing.assignments {
            None => true,
            Some(current) => assignments.leader() < current.leader(),
        };

        if better {
            debug!(
                "{} adopting assignments made by {}",
                self.processing.host,
                assignments.leader()
            );
            self.processing.assignments = Some(assignments);
        }
    }
}

impl StateHandler for QueryState {
    fn start(&mut self, ctx: &mut dyn Context) {
        let delay = ctx.config().identification;
        ctx.schedule(TimerKind::Identification, delay, false);
    }

    fn on_timer(&mut self, ctx: &mut dyn Context, kind: TimerKind) -> Option<State> {
        match kind {
            TimerKind::Identification => {
                if self.processing.is_leader() {
                    return Some(self.processing.become_leader(ctx, &self.alive));
                }

                info!(
                    "{} waiting for leader {}",
                    self.processing.host, self.processing.leader
                );
                self.awaiting_leader = true;
                let delay = ctx.config().identification;
                ctx.schedule(TimerKind::AwaitLeader, delay, false);

                None
            }
            TimerKind::AwaitLeader => {
                warn!(
                    "{} never heard from leader {}, using the assignments it has",
                    self.processing.host, self.processing.leader
                );
                Some(go_active(ctx, self.processing.assignments.clone()))
            }
            _ => None,
        }
    }

    fn process_heartbeat(
        &mut self,
        _ctx: &mut dyn Context,
        source: &HostId,
        _timestamp_ms: i64,
    ) -> Option<State> {
        self.record(source, None);
        None
    }

    fn process_identification(
        &mut self,
        _ctx: &mut dyn Context,
        source: &HostId,
        assignments: Option<Arc<BucketAssignments>>,
    ) -> Option<State> {
        self.record(source, assignments);
        None
    }

    fn process_leader(
        &mut self,
        ctx: &mut dyn Context,
        source: &HostId,
        assignments: Arc<BucketAssignments>,
    ) -> Option<State> {
        if source <= &self.processing.leader {
            info!("{} accepting assignments from leader {source}", self.processing.host);
            return Some(go_active(ctx, Some(assignments)));
        }

        self.record(source, Some(assignments));
        None
    }

    fn process_offline(&mut self, ctx: &mut dyn Context, source: &HostId) -> Option<State> {
        if source == &self.processing.host || !self.alive.remove(source) {
            return None;
        }

        self.update_leader();

        if self.awaiting_leader && self.processing.is_leader() {
            info!(
                "{} was waiting for {source} which went offline, taking over",
                self.processing.host
            );
            return Some(self.processing.become_leader(ctx, &self.alive));
        }

        None
    }

    fn process_query(&mut self, ctx: &mut dyn Context, source: &HostId) -> Option<State> {
        self.record(source, None);
        ctx.publish(
            Channel::Admin,
            MessageBody::Identification {
                assignments: self.processing.assignments.clone(),
            },
        );
        None
    }
}
