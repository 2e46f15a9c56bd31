use super::{
    Context, State, StateHandler, TimerKind, go_active, go_query, go_start, processing::Processing,
    respond_to_query,
};
use crate::pool::{
    assignments::BucketAssignments,
    host::HostId,
    message::{Channel, MessageBody},
};
use log::{error, info};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Neighbours of `host` on the ring formed by `hosts`: (predecessor, successor).
///
/// A host alone on the ring has neither.
pub fn ring_neighbors(host: &HostId, hosts: &BTreeSet<HostId>) -> (Option<HostId>, Option<HostId>) {
    let nodes: Vec<&HostId> = hosts.iter().collect();

    let Some(our_idx) = nodes.iter().position(|h| *h == host) else {
        return (None, None);
    };

    if nodes.len() < 2 {
        return (None, None);
    }

    let predecessor = nodes[(our_idx + nodes.len() - 1) % nodes.len()];
    let successor = nodes[(our_idx + 1) % nodes.len()];

    (Some(predecessor.clone()), Some(successor.clone()))
}

/// Steady state of a host owning buckets. Heartbeats travel around the ring of
/// assigned hosts; each host watches its own and its predecessor's.
#[derive(Debug)]
pub struct ActiveState {
    processing: Processing,
    assignments: Arc<BucketAssignments>,
    predecessor: Option<HostId>,
    successor: Option<HostId>,
    own_heartbeat_seen: bool,
    predecessor_heartbeat_seen: bool,
}

impl ActiveState {
    pub fn new(host: HostId, assignments: Arc<BucketAssignments>) -> Self {
        let (predecessor, successor) = ring_neighbors(&host, &assignments.all_hosts());
        let leader = assignments.leader().clone();

        Self {
            processing: Processing::new(host, leader, Some(assignments.clone())),
            assignments,
            predecessor,
            successor,
            own_heartbeat_seen: false,
            predecessor_heartbeat_seen: false,
        }
    }

    #[cfg(test)]
    pub fn predecessor(&self) -> Option<&HostId> {
        self.predecessor.as_ref()
    }

    #[cfg(test)]
    pub fn successor(&self) -> Option<&HostId> {
        self.successor.as_ref()
    }

    #[cfg(test)]
    pub fn leader(&self) -> &HostId {
        &self.processing.leader
    }

    fn send_heartbeats(&self, ctx: &mut dyn Context) {
        let timestamp_ms = ctx.next_timestamp();
        let own_channel = Channel::Host(self.processing.host.clone());
        ctx.publish(own_channel, MessageBody::Heartbeat { timestamp_ms });

        if let Some(successor) = &self.successor {
            ctx.publish(
                Channel::Host(successor.clone()),
                MessageBody::Heartbeat { timestamp_ms },
            );
        }
    }
}

impl StateHandler for ActiveState {
    fn start(&mut self, ctx: &mut dyn Context) {
        let config = ctx.config().clone();

        ctx.schedule(TimerKind::SendHeartbeat, config.active_heartbeat, true);
        ctx.schedule(TimerKind::OwnHeartbeatCheck, config.inter_heartbeat, true);
        if self.predecessor.is_some() {
            ctx.schedule(TimerKind::PredecessorCheck, config.inter_heartbeat, true);
        }

        self.send_heartbeats(ctx);
    }

    fn on_timer(&mut self, ctx: &mut dyn Context, kind: TimerKind) -> Option<State> {
        match kind {
            TimerKind::SendHeartbeat => {
                self.send_heartbeats(ctx);
                None
            }
            TimerKind::OwnHeartbeatCheck => {
                if std::mem::take(&mut self.own_heartbeat_seen) {
                    return None;
                }

                error!("{} missed its own heartbeat", self.processing.host);
                ctx.publish(Channel::Admin, MessageBody::Offline);
                Some(go_start(ctx))
            }
            TimerKind::PredecessorCheck => {
                if std::mem::take(&mut self.predecessor_heartbeat_seen) {
                    return None;
                }

                error!(
                    "{} missed the heartbeat of its predecessor {}",
                    self.processing.host,
                    self.predecessor
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
                ctx.publish(Channel::Admin, MessageBody::Query);
                Some(go_query(ctx))
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
        if source == &self.processing.host {
            self.own_heartbeat_seen = true;
        } else if self.predecessor.as_ref() == Some(source) {
            self.predecessor_heartbeat_seen = true;
        }

        None
    }

    fn process_leader(
        &mut self,
        ctx: &mut dyn Context,
        source: &HostId,
        assignments: Arc<BucketAssignments>,
    ) -> Option<State> {
        if assignments == self.assignments {
            return None;
        }

        if source < &self.processing.leader {
            info!(
                "{} heard from leader {source} which beats {}, querying",
                self.processing.host, self.processing.leader
            );
            ctx.publish(Channel::Admin, MessageBody::Query);
            return Some(go_query(ctx));
        }

        info!("{} accepting assignments from leader {source}", self.processing.host);
        Some(go_active(ctx, Some(assignments)))
    }

    fn process_offline(&mut self, ctx: &mut dyn Context, source: &HostId) -> Option<State> {
        if source == &self.processing.host || !self.assignments.has_assignment(source) {
            return None;
        }

        let leader_was_predecessor =
            source == &self.processing.leader && self.predecessor.as_ref() == Some(source);

        if !self.processing.is_leader() && !leader_was_predecessor {
            return None;
        }

        info!(
            "{} taking over the buckets of {source} which went offline",
            self.processing.host
        );

        let mut remaining = self.assignments.all_hosts();
        remaining.remove(source);

        Some(self.processing.become_leader(ctx, &remaining))
    }

    fn process_query(&mut self, ctx: &mut dyn Context, source: &HostId) -> Option<State> {
        Some(respond_to_query(ctx, source))
    }
}
