//! Leader-side bucket rebalancing.
//!
//! Starting from the previous assignments (when there are any) the leader keeps
//! every bucket whose owner is still alive, hands orphaned buckets to the least
//! loaded hosts and finally moves single buckets from the most loaded to the
//! least loaded host until all counts are within one of each other. The number
//! of buckets changing owner is the minimum needed to reach that balance.

use crate::pool::{assignments::BucketAssignments, host::HostId};
use anyhow::{Result, bail};
use log::info;
use std::collections::{BTreeMap, BTreeSet};

pub fn compute_assignments(
    leader: &HostId,
    previous: Option<&BucketAssignments>,
    alive: &BTreeSet<HostId>,
    max_buckets: usize,
) -> Result<BucketAssignments> {
    if alive.first() != Some(leader) {
        bail!("{leader} cannot compute assignments, it is not the smallest alive host");
    }

    let mut host_array = match previous {
        Some(previous) => previous.buckets().to_vec(),
        None => vec![None; max_buckets],
    };

    // Never more hosts than buckets. The leader sorts first so it always stays.
    let hosts: BTreeSet<&HostId> = alive.iter().take(host_array.len()).collect();

    let mut owned: BTreeMap<&HostId, Vec<usize>> = hosts.iter().map(|h| (*h, Vec::new())).collect();
    let mut orphans = Vec::new();

    for (bucket, owner) in host_array.iter().enumerate() {
        match owner.as_ref().and_then(|h| owned.get_mut(h)) {
            Some(buckets) => buckets.push(bucket),
            None => orphans.push(bucket),
        }
    }

    // (load, host) ordered, so the first entry is the least loaded host with
    // ties going to the smaller id.
    let mut loads: BTreeSet<(usize, &HostId)> = owned.iter().map(|(h, b)| (b.len(), *h)).collect();

    for bucket in &orphans {
        let Some((load, host)) = loads.pop_first() else {
            bail!("no hosts to assign buckets to");
        };

        if let Some(buckets) = owned.get_mut(host) {
            buckets.push(*bucket);
        }
        loads.insert((load + 1, host));
    }

    let mut moved = 0;
    loop {
        let (Some(&(min_load, min_host)), Some(&(max_load, max_host))) =
            (loads.first(), loads.last())
        else {
            break;
        };

        if max_load - min_load <= 1 {
            break;
        }

        let Some(bucket) = owned.get_mut(max_host).and_then(|b| b.pop()) else {
            break;
        };
        if let Some(buckets) = owned.get_mut(min_host) {
            buckets.push(bucket);
        }

        loads.remove(&(min_load, min_host));
        loads.remove(&(max_load, max_host));
        loads.insert((min_load + 1, min_host));
        loads.insert((max_load - 1, max_host));
        moved += 1;
    }

    for (host, buckets) in &owned {
        for bucket in buckets {
            host_array[*bucket] = Some((*host).clone());
        }
    }

    info!(
        "{leader} assigned buckets to {} hosts: {} orphans placed, {moved} moved",
        owned.len(),
        orphans.len()
    );

    BucketAssignments::new(leader.clone(), host_array)
}
