mod config;
mod eager_env;
mod pool;
mod utils;

use crate::{
    config::PoolConfig,
    eager_env::check_env,
    pool::{HostId, JsonFieldRouter, LocalBus, PoolManager, RuleEngine},
};
use log::info;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::time;
use uuid::Uuid;

/// Stands in for the rule engine: logs what this host was given to process.
struct LoggingRules {
    host: HostId,
}

impl RuleEngine for LoggingRules {
    fn handle_event(&self, event: Value) {
        info!("{} processing {event}", self.host);
    }
}

fn sample_event(sequence: u64) -> Value {
    let mut event = Map::new();
    event.insert(
        eager_env::REQUEST_FIELD.clone(),
        Value::String(Uuid::new_v4().to_string()),
    );
    event.insert("sequence".to_string(), Value::from(sequence));
    Value::Object(event)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
    check_env();

    let config = PoolConfig::from_env().expect("invalid pool configuration");
    let bus = Arc::new(LocalBus::new());
    let router = Arc::new(JsonFieldRouter::new(eager_env::REQUEST_FIELD.as_str()));

    let mut handles = Vec::new();
    for _ in 0..*eager_env::HOSTS {
        let host = HostId::generate();
        let rules = Arc::new(LoggingRules { host: host.clone() });

        let (handle, mut status) =
            PoolManager::new(host.clone(), config.clone(), bus.clone(), router.clone(), rules)
                .expect("invalid pool configuration")
                .start();

        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                let Some(assignments) = current.assignments else {
                    info!("{host} is {} without assignments", current.state);
                    continue;
                };
                info!(
                    "{host} is {} with {} buckets, {} hosts own buckets",
                    current.state,
                    assignments.bucket_count(&host),
                    assignments.buckets_by_host().len()
                );
            }
        });

        handle.activate();
        handles.push(handle);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut ticker = time::interval(config.active_heartbeat);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(entry) = handles.get(sequence as usize % handles.len().max(1)) {
                    entry.route(sample_event(sequence));
                }
                sequence += 1;
            }
            _ = &mut shutdown => break,
        }
    }

    info!("shutting down {} hosts", handles.len());
    for handle in &handles {
        handle.deactivate();
    }
    for handle in handles {
        info!("stopping {}", handle.host());
        handle.stop().await;
    }
}
