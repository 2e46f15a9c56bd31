use crate::pool::host::HostId;
use anyhow::{Result, bail};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable mapping from bucket index to the host that owns it.
///
/// Produced only by the leader while rebalancing. A newer value replaces an
/// older one wholesale, nothing is ever updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAssignments")]
pub struct BucketAssignments {
    leader: HostId,
    host_array: Vec<Option<HostId>>,
}

#[derive(Deserialize)]
struct RawAssignments {
    leader: HostId,
    host_array: Vec<Option<HostId>>,
}

impl TryFrom<RawAssignments> for BucketAssignments {
    type Error = anyhow::Error;

    fn try_from(raw: RawAssignments) -> Result<Self> {
        Self::new(raw.leader, raw.host_array)
    }
}

impl BucketAssignments {
    pub fn new(leader: HostId, host_array: Vec<Option<HostId>>) -> Result<Self> {
        if host_array.is_empty() {
            bail!("bucket assignments must contain at least one bucket");
        }

        Ok(Self { leader, host_array })
    }

    /// The host that computed these assignments.
    pub fn leader(&self) -> &HostId {
        &self.leader
    }

    pub fn size(&self) -> usize {
        self.host_array.len()
    }

    pub fn buckets(&self) -> &[Option<HostId>] {
        &self.host_array
    }

    pub fn assigned_host(&self, bucket: usize) -> Option<&HostId> {
        self.host_array.get(bucket)?.as_ref()
    }

    pub fn has_assignment(&self, host: &HostId) -> bool {
        self.host_array.iter().any(|h| h.as_ref() == Some(host))
    }

    /// Hosts owning at least one bucket. This is the heartbeat ring.
    pub fn all_hosts(&self) -> BTreeSet<HostId> {
        self.host_array.iter().flatten().cloned().collect()
    }

    /// Buckets grouped by owner, in ascending bucket order.
    pub fn buckets_by_host(&self) -> BTreeMap<HostId, Vec<usize>> {
        self.host_array
            .iter()
            .enumerate()
            .filter_map(|(bucket, host)| host.as_ref().map(|h| (h.clone(), bucket)))
            .into_group_map()
            .into_iter()
            .collect()
    }

    pub fn bucket_count(&self, host: &HostId) -> usize {
        self.host_array
            .iter()
            .filter(|h| h.as_ref() == Some(host))
            .count()
    }
}
