// State machine test utilities
//
// `TestContext` records everything a state asks of its host instead of doing it.

use crate::config::PoolConfig;
use crate::pool::{
    assignments::BucketAssignments,
    host::{HostId, host},
    manager::{PoolStatus, RuleEngine},
    message::{Channel, MessageBody},
    rebalance::compute_assignments,
    state::{Context, StateKind, TimerKind},
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tokio::time;

pub struct TestContext {
    pub host: HostId,
    pub config: PoolConfig,
    pub current: Option<Arc<BucketAssignments>>,
    pub published: Vec<(Channel, MessageBody)>,
    pub timers: Vec<(TimerKind, Duration, bool)>,
    pub distributed: Vec<Option<Arc<BucketAssignments>>>,
    pub forwards: Vec<(Value, u32)>,
    timestamp: i64,
}

impl TestContext {
    pub fn new(id: &str) -> Self {
        Self {
            host: host(id),
            config: PoolConfig::default(),
            current: None,
            published: Vec::new(),
            timers: Vec::new(),
            distributed: Vec::new(),
            forwards: Vec::new(),
            timestamp: 1_000,
        }
    }

    /// Assignments carried by the leader messages published so far.
    pub fn leader_messages(&self) -> Vec<Arc<BucketAssignments>> {
        self.published
            .iter()
            .filter_map(|(_, body)| match body {
                MessageBody::Leader { assignments } => assignments.clone(),
                _ => None,
            })
            .collect()
    }
}

impl Context for TestContext {
    fn host(&self) -> &HostId {
        &self.host
    }

    fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn assignments(&self) -> Option<Arc<BucketAssignments>> {
        self.current.clone()
    }

    fn publish(&mut self, channel: Channel, body: MessageBody) {
        self.published.push((channel, body));
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration, repeat: bool) {
        self.timers.push((kind, delay, repeat));
    }

    fn start_distributing(&mut self, assignments: Option<Arc<BucketAssignments>>) {
        self.current = assignments.clone();
        self.distributed.push(assignments);
    }

    fn handle_forward(&mut self, payload: Value, num_hops: u32) {
        self.forwards.push((payload, num_hops));
    }

    fn next_timestamp(&mut self) -> i64 {
        self.timestamp += 1;
        self.timestamp
    }
}

/// Fresh balanced assignments made by `leader`, which must sort first in `hosts`.
pub fn assignments_for(leader: &str, hosts: &[&str], buckets: usize) -> Arc<BucketAssignments> {
    let alive: BTreeSet<HostId> = hosts.iter().map(|h| host(h)).collect();

    Arc::new(compute_assignments(&host(leader), None, &alive, buckets).expect("valid assignments"))
}

#[derive(Default)]
pub struct RecordingRules {
    events: Mutex<Vec<Value>>,
}

impl RecordingRules {
    pub fn events(&self) -> Vec<Value> {
        self.events.lock().unwrap().clone()
    }
}

impl RuleEngine for RecordingRules {
    fn handle_event(&self, event: Value) {
        self.events.lock().unwrap().push(event);
    }
}

pub async fn wait_for_state(status: &mut Receiver<PoolStatus>, state: StateKind) -> PoolStatus {
    wait_for(status, |s| s.state == state).await
}

/// Waits, in paused time, for a status matching `f`.
pub async fn wait_for(
    status: &mut Receiver<PoolStatus>,
    f: impl FnMut(&PoolStatus) -> bool,
) -> PoolStatus {
    time::timeout(Duration::from_secs(600), status.wait_for(f))
        .await
        .expect("status reached in time")
        .expect("manager running")
        .clone()
}
