use super::{Context, State, go_active, go_inactive};
use crate::pool::{
    assignments::BucketAssignments,
    host::HostId,
    message::{Channel, MessageBody},
    rebalance::compute_assignments,
};
use log::{error, info};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Leader bookkeeping shared by the query and active states.
#[derive(Debug, Clone)]
pub(crate) struct Processing {
    pub host: HostId,
    /// Host currently believed to be the leader.
    pub leader: HostId,
    pub assignments: Option<Arc<BucketAssignments>>,
}

impl Processing {
    pub fn new(host: HostId, leader: HostId, assignments: Option<Arc<BucketAssignments>>) -> Self {
        Self {
            host,
            leader,
            assignments,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.host
    }

    /// Computes new assignments over `alive`, publishes them and switches to them.
    ///
    /// `alive` must contain this host as its smallest member.
    pub fn become_leader(&self, ctx: &mut dyn Context, alive: &BTreeSet<HostId>) -> State {
        let assignments = match compute_assignments(
            &self.host,
            self.assignments.as_deref(),
            alive,
            ctx.config().max_buckets,
        ) {
            Ok(assignments) => Arc::new(assignments),
            Err(e) => {
                error!("{} failed to become leader: {e}", self.host);
                return go_inactive(ctx);
            }
        };

        info!(
            "{} is now leader of {} hosts",
            self.host,
            assignments.all_hosts().len()
        );

        ctx.publish(
            Channel::Admin,
            MessageBody::Leader {
                assignments: Some(assignments.clone()),
            },
        );

        go_active(ctx, Some(assignments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::host::host;
    use crate::pool::state::StateKind;
    use crate::pool::testing::{TestContext, assignments_for};

    #[test]
    fn test_become_leader_publishes_and_activates() {
        let mut ctx = TestContext::new("h1");
        let processing = Processing::new(host("h1"), host("h1"), None);
        let alive: BTreeSet<HostId> = [host("h1"), host("h2")].into_iter().collect();

        let next = processing.become_leader(&mut ctx, &alive);

        assert_eq!(next.kind(), StateKind::Active);
        let published = ctx.leader_messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].leader(), &host("h1"));
        assert_eq!(published[0].bucket_count(&host("h2")), ctx.config.max_buckets / 2);
        assert_eq!(ctx.assignments(), Some(published[0].clone()));
    }

    #[test]
    fn test_become_leader_keeps_previous_owners() {
        let mut ctx = TestContext::new("h2");
        let previous = assignments_for("h1", &["h1", "h2", "h3"], 6);
        let processing = Processing::new(host("h2"), host("h2"), Some(previous.clone()));
        let alive: BTreeSet<HostId> = [host("h2"), host("h3")].into_iter().collect();

        processing.become_leader(&mut ctx, &alive);

        let new = &ctx.leader_messages()[0];
        for (bucket, owner) in previous.buckets().iter().enumerate() {
            if owner.as_ref() != Some(&host("h1")) {
                assert_eq!(new.assigned_host(bucket), owner.as_ref());
            }
        }
    }

    #[test]
    fn test_not_smallest_cannot_lead() {
        let mut ctx = TestContext::new("h2");
        let processing = Processing::new(host("h2"), host("h2"), None);
        let alive: BTreeSet<HostId> = [host("h1"), host("h2")].into_iter().collect();

        let next = processing.become_leader(&mut ctx, &alive);

        assert_eq!(next.kind(), StateKind::Inactive);
        assert!(ctx.leader_messages().is_empty());
    }
}
