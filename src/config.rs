use crate::eager_env;
use anyhow::{Result, bail};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of buckets the workload is split into. Constant for the life of a pool.
    pub max_buckets: usize,
    /// How long a starting host waits to see its own heartbeat.
    pub start_heartbeat: Duration,
    /// How long a querying host collects identifications, and then how long
    /// it waits for the leader.
    pub identification: Duration,
    /// Interval between heartbeats of an active host.
    pub active_heartbeat: Duration,
    /// Interval at which an active host checks that heartbeats were seen.
    pub inter_heartbeat: Duration,
    /// Back-off before an inactive host starts over.
    pub reactivate: Duration,
    /// Events kept while no assignments are known.
    pub offline_queue_limit: usize,
    /// Queued events older than this are discarded instead of routed.
    pub offline_age: Duration,
    pub forward_max_hops: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buckets: 1024,
            start_heartbeat: Duration::from_millis(10_000),
            identification: Duration::from_millis(5_000),
            active_heartbeat: Duration::from_millis(5_000),
            inter_heartbeat: Duration::from_millis(15_000),
            reactivate: Duration::from_millis(50_000),
            offline_queue_limit: 1000,
            offline_age: Duration::from_millis(60_000),
            forward_max_hops: 5,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            max_buckets: *eager_env::MAX_BUCKETS,
            start_heartbeat: Duration::from_millis(*eager_env::START_HEARTBEAT_MS),
            identification: Duration::from_millis(*eager_env::IDENTIFICATION_MS),
            active_heartbeat: Duration::from_millis(*eager_env::ACTIVE_HEARTBEAT_MS),
            inter_heartbeat: Duration::from_millis(*eager_env::INTER_HEARTBEAT_MS),
            reactivate: Duration::from_millis(*eager_env::REACTIVATE_MS),
            offline_queue_limit: *eager_env::OFFLINE_QUEUE_LIMIT,
            offline_age: Duration::from_millis(*eager_env::OFFLINE_AGE_MS),
            forward_max_hops: *eager_env::FORWARD_MAX_HOPS,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buckets == 0 {
            bail!("max_buckets must be positive");
        }

        let timers = [
            ("start_heartbeat", self.start_heartbeat),
            ("identification", self.identification),
            ("active_heartbeat", self.active_heartbeat),
            ("inter_heartbeat", self.inter_heartbeat),
            ("reactivate", self.reactivate),
        ];

        for (name, duration) in timers {
            if duration.is_zero() {
                bail!("{name} must be positive");
            }
        }

        // otherwise a healthy host would miss its own heartbeat
        if self.inter_heartbeat <= self.active_heartbeat {
            bail!(
                "inter_heartbeat ({:?}) must be longer than active_heartbeat ({:?})",
                self.inter_heartbeat,
                self.active_heartbeat
            );
        }

        Ok(())
    }
}
