use crate::config::PoolConfig;
use crate::pool::{
    assignments::BucketAssignments,
    bus::Bus,
    filter::Filter,
    host::HostId,
    message::{Channel, Message, MessageBody},
    router::{EventRouter, bucket_for_key},
    state::{self, Context, IdleState, State, StateKind, TimerKind},
};
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{
    mpsc::{self, UnboundedSender},
    watch::{self, Receiver},
};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

/// Processes application events this host is responsible for.
pub trait RuleEngine: Send + Sync {
    fn handle_event(&self, event: Value);
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub state: StateKind,
    pub assignments: Option<Arc<BucketAssignments>>,
}

enum Event {
    Inbound(String),
    Timer { epoch: u64, kind: TimerKind },
    Activate,
    Deactivate,
    Route(Value),
    Shutdown,
}

/// Everything a state may touch, owned by the scheduler task.
struct HostContext {
    host: HostId,
    config: PoolConfig,
    bus: Arc<dyn Bus>,
    router: Arc<dyn EventRouter>,
    rules: Arc<dyn RuleEngine>,
    assignments: Option<Arc<BucketAssignments>>,
    events: UnboundedSender<Event>,
    inbound: UnboundedSender<String>,
    timers: Vec<JoinHandle<()>>,
    /// Bumped whenever the timers are cancelled. A timer carrying an older
    /// epoch belongs to a replaced state.
    epoch: u64,
    last_timestamp: i64,
    queue: VecDeque<(Instant, Value)>,
    status: watch::Sender<PoolStatus>,
}

impl HostContext {
    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.epoch += 1;
    }

    fn subscribe(&self, filter: Filter) {
        if let Err(e) = self.bus.subscribe(&self.host, filter, self.inbound.clone()) {
            error!("{} failed to subscribe: {e}", self.host);
        }
    }

    fn unsubscribe(&self) {
        if let Err(e) = self.bus.unsubscribe(&self.host) {
            error!("{} failed to unsubscribe: {e}", self.host);
        }
    }

    fn route(&mut self, event: Value, num_hops: u32) {
        let Some(key) = self.router.bucket_key(&event) else {
            self.rules.handle_event(event);
            return;
        };

        let Some(assignments) = self.assignments.clone() else {
            self.enqueue(event);
            return;
        };

        let bucket = bucket_for_key(&key, assignments.size());

        match assignments.assigned_host(bucket) {
            Some(owner) if owner != &self.host => {
                if num_hops >= self.config.forward_max_hops {
                    warn!(
                        "{} dropping event {key} for bucket {bucket} after {num_hops} hops",
                        self.host
                    );
                    return;
                }

                debug!("{} forwarding event {key} to {owner}", self.host);
                self.publish(
                    Channel::Host(owner.clone()),
                    MessageBody::Forward {
                        payload: event,
                        num_hops: num_hops + 1,
                    },
                );
            }
            _ => self.rules.handle_event(event),
        }
    }

    fn enqueue(&mut self, event: Value) {
        if self.queue.len() >= self.config.offline_queue_limit {
            warn!("{} offline queue full, dropping oldest event", self.host);
            self.queue.pop_front();
        }

        debug!("{} queueing event until assignments are known", self.host);
        self.queue.push_back((Instant::now(), event));
    }

    fn set_state(&self, state: StateKind) {
        self.status.send_modify(|status| status.state = state);
    }
}

impl Context for HostContext {
    fn host(&self) -> &HostId {
        &self.host
    }

    fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn assignments(&self) -> Option<Arc<BucketAssignments>> {
        self.assignments.clone()
    }

    fn publish(&mut self, channel: Channel, body: MessageBody) {
        let message = Message {
            source: self.host.clone(),
            channel: channel.clone(),
            body,
        };

        let result = message
            .encode()
            .and_then(|text| self.bus.publish(&channel, text));

        if let Err(e) = result {
            error!("{} failed to publish {} to {channel}: {e}", self.host, message.kind());
        }
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration, repeat: bool) {
        let events = self.events.clone();
        let epoch = self.epoch;

        let timer = tokio::spawn(async move {
            if !repeat {
                time::sleep(delay).await;
                let _ = events.send(Event::Timer { epoch, kind });
                return;
            }

            let mut ticker = time::interval_at(Instant::now() + delay, delay);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if events.send(Event::Timer { epoch, kind }).is_err() {
                    break;
                }
            }
        });

        self.timers.push(timer);
    }

    fn start_distributing(&mut self, assignments: Option<Arc<BucketAssignments>>) {
        self.assignments = assignments.clone();
        self.status
            .send_modify(|status| status.assignments = assignments.clone());

        if assignments.is_none() || self.queue.is_empty() {
            return;
        }

        let offline_age = self.config.offline_age;
        let pending = std::mem::take(&mut self.queue);
        info!("{} routing {} queued events", self.host, pending.len());

        for (queued_at, event) in pending {
            if queued_at.elapsed() > offline_age {
                warn!("{} discarding event queued for {:?}", self.host, queued_at.elapsed());
                continue;
            }
            self.route(event, 0);
        }
    }

    fn handle_forward(&mut self, payload: Value, num_hops: u32) {
        self.route(payload, num_hops);
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }
}

struct Driver {
    ctx: HostContext,
    state: State,
}

impl Driver {
    /// Returns `false` once the manager should stop.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Inbound(text) => self.receive(&text),
            Event::Timer { epoch, kind } => {
                if epoch != self.ctx.epoch {
                    debug!("{} ignoring stale {kind} timer", self.ctx.host);
                    return true;
                }
                let next = self.state.on_timer(&mut self.ctx, kind);
                self.transition(next);
            }
            Event::Activate => {
                if self.state.kind() == StateKind::Idle {
                    let next = state::go_start(&mut self.ctx);
                    self.transition(Some(next));
                }
            }
            Event::Deactivate => self.go_idle(),
            Event::Route(event) => self.ctx.route(event, 0),
            Event::Shutdown => {
                self.go_idle();
                self.ctx.unsubscribe();
                return false;
            }
        }

        true
    }

    fn receive(&mut self, text: &str) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} discarding malformed message: {e}", self.ctx.host);
                return;
            }
        };

        match &message.channel {
            Channel::Admin => {}
            Channel::Host(host) if host == &self.ctx.host => {}
            other => {
                debug!("{} ignoring message for {other}", self.ctx.host);
                return;
            }
        }

        debug!(
            "{} received {} from {} while {}",
            self.ctx.host,
            message.kind(),
            message.source,
            self.state.kind()
        );

        let next = self.state.process(&mut self.ctx, message);
        self.transition(next);
    }

    fn go_idle(&mut self) {
        if self.state.kind() == StateKind::Idle {
            return;
        }

        self.ctx.publish(Channel::Admin, MessageBody::Offline);
        let next = state::go_idle(&mut self.ctx);
        self.transition(Some(next));
    }

    fn transition(&mut self, next: Option<State>) {
        let Some(next) = next else {
            return;
        };

        self.ctx.cancel_timers();
        info!(
            "{} state transition {} -> {}",
            self.ctx.host,
            self.state.kind(),
            next.kind()
        );

        self.state = next;
        self.ctx.subscribe(self.state.filter(&self.ctx));
        self.state.start(&mut self.ctx);
        self.ctx.set_state(self.state.kind());
    }
}

/// Runs the state machine of one host on a single task: bus messages, timer
/// expiries and commands are handled strictly one after another.
pub struct PoolManager {
    host: HostId,
    config: PoolConfig,
    bus: Arc<dyn Bus>,
    router: Arc<dyn EventRouter>,
    rules: Arc<dyn RuleEngine>,
}

impl PoolManager {
    pub fn new(
        host: HostId,
        config: PoolConfig,
        bus: Arc<dyn Bus>,
        router: Arc<dyn EventRouter>,
        rules: Arc<dyn RuleEngine>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            host,
            config,
            bus,
            router,
            rules,
        })
    }

    fn into_driver(
        self,
        events: UnboundedSender<Event>,
        inbound: UnboundedSender<String>,
        status: watch::Sender<PoolStatus>,
    ) -> Driver {
        Driver {
            ctx: HostContext {
                host: self.host,
                config: self.config,
                bus: self.bus,
                router: self.router,
                rules: self.rules,
                assignments: None,
                events,
                inbound,
                timers: Vec::new(),
                epoch: 0,
                last_timestamp: 0,
                queue: VecDeque::new(),
                status,
            },
            state: State::Idle(IdleState),
        }
    }

    /// Spawns the scheduler. The host starts idle until [`PoolHandle::activate`].
    pub fn start(self) -> (PoolHandle, Receiver<PoolStatus>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PoolStatus {
            state: StateKind::Idle,
            assignments: None,
        });

        let host = self.host.clone();
        let mut driver = self.into_driver(events_tx.clone(), inbound_tx, status_tx);

        let task = tokio::spawn(async move {
            driver.ctx.subscribe(driver.state.filter(&driver.ctx));

            let mut events = UnboundedReceiverStream::new(inbound_rx)
                .map(Event::Inbound)
                .merge(UnboundedReceiverStream::new(events_rx));

            while let Some(event) = events.next().await {
                if !driver.handle(event) {
                    break;
                }
            }

            driver.ctx.cancel_timers();
            info!("{} pool manager stopped", driver.ctx.host);
        });

        info!("{host} pool manager started");

        let handle = PoolHandle {
            host,
            events: events_tx,
            task,
        };

        (handle, status_rx)
    }
}

pub struct PoolHandle {
    host: HostId,
    events: UnboundedSender<Event>,
    task: JoinHandle<()>,
}

impl PoolHandle {
    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Joins the pool (unlock).
    pub fn activate(&self) {
        self.send(Event::Activate);
    }

    /// Leaves the pool and stays idle (lock).
    pub fn deactivate(&self) {
        self.send(Event::Deactivate);
    }

    /// Hands an application event to the pool, which processes it here or
    /// forwards it to the owner of its bucket.
    pub fn route(&self, event: Value) {
        self.send(Event::Route(event));
    }

    pub async fn stop(self) {
        self.send(Event::Shutdown);

        if let Err(e) = self.task.await {
            error!("{} pool manager task failed: {e}", self.host);
        }
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            warn!("{} pool manager is not running", self.host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::bus::LocalBus;
    use crate::pool::host::host;
    use crate::pool::router::JsonFieldRouter;
    use crate::pool::testing::{RecordingRules, wait_for, wait_for_state};
    use crate::pool::filter::{self, Filter};
    use crate::pool::testing::assignments_for;
    use crate::utils::init_logging;
    use log::LevelFilter;
    use serde_json::json;

    fn config() -> PoolConfig {
        PoolConfig {
            max_buckets: 16,
            ..PoolConfig::default()
        }
    }

    fn manager(
        id: &str,
        config: PoolConfig,
        bus: &Arc<LocalBus>,
    ) -> (PoolHandle, Receiver<PoolStatus>, Arc<RecordingRules>) {
        let rules = Arc::new(RecordingRules::default());
        let (handle, status) = PoolManager::new(
            host(id),
            config,
            bus.clone(),
            Arc::new(JsonFieldRouter::new("request_id")),
            rules.clone(),
        )
        .expect("valid config")
        .start();

        (handle, status, rules)
    }

    /// A request id whose bucket belongs to `owner`.
    fn key_owned_by(assignments: &BucketAssignments, owner: &HostId) -> String {
        (0..)
            .map(|i| format!("request-{i}"))
            .find(|key| {
                assignments.assigned_host(bucket_for_key(key, assignments.size())) == Some(owner)
            })
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_host_leads_itself() -> Result<()> {
        init_logging(LevelFilter::Debug);
        let bus = Arc::new(LocalBus::new());
        let (handle, mut status, _) = manager("h1", config(), &bus);

        assert_eq!(status.borrow().state, StateKind::Idle);
        handle.activate();

        let active = wait_for_state(&mut status, StateKind::Active).await;
        let assignments = active.assignments.expect("assignments");
        assert_eq!(assignments.leader(), &host("h1"));
        assert_eq!(assignments.bucket_count(&host("h1")), 16);

        handle.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_queue_until_assignments_exist() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let (handle, mut status, rules) = manager("h1", config(), &bus);

        handle.route(json!({"request_id": "a"}));
        handle.route(json!({"request_id": "b"}));
        handle.route(json!({"no_key": true}));
        tokio::task::yield_now().await;
        time::sleep(Duration::from_millis(1)).await;

        // keyless events do not need a bucket
        assert_eq!(rules.events(), vec![json!({"no_key": true})]);

        handle.activate();
        wait_for_state(&mut status, StateKind::Active).await;

        assert_eq!(rules.events().len(), 3);

        handle.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_queued_events_are_dropped() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let config = PoolConfig {
            offline_age: Duration::from_millis(100),
            ..config()
        };
        let (handle, mut status, rules) = manager("h1", config, &bus);

        handle.route(json!({"request_id": "a"}));
        time::sleep(Duration::from_secs(1)).await;

        handle.activate();
        wait_for_state(&mut status, StateKind::Active).await;

        assert!(rules.events().is_empty());

        handle.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_queue_is_bounded() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let config = PoolConfig {
            offline_queue_limit: 2,
            ..config()
        };
        let (handle, mut status, rules) = manager("h1", config, &bus);

        for key in ["a", "b", "c"] {
            handle.route(json!({"request_id": key}));
        }
        handle.activate();
        wait_for_state(&mut status, StateKind::Active).await;

        assert_eq!(
            rules.events(),
            vec![json!({"request_id": "b"}), json!({"request_id": "c"})]
        );

        handle.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_forwarded_to_owner() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let (h1, mut status1, rules1) = manager("h1", config(), &bus);
        let (h2, mut status2, rules2) = manager("h2", config(), &bus);

        h1.activate();
        h2.activate();
        let active = wait_for_state(&mut status1, StateKind::Active).await;
        wait_for_state(&mut status2, StateKind::Active).await;
        let assignments = active.assignments.expect("assignments");

        let for_h2 = key_owned_by(&assignments, &host("h2"));
        let for_h1 = key_owned_by(&assignments, &host("h1"));
        h1.route(json!({"request_id": for_h2}));
        h1.route(json!({"request_id": for_h1}));
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rules1.events(), vec![json!({"request_id": for_h1})]);
        assert_eq!(rules2.events(), vec![json!({"request_id": for_h2})]);

        h1.stop().await;
        h2.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_hop_limit() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let (h1, mut status1, rules1) = manager("h1", config(), &bus);
        let (h2, mut status2, rules2) = manager("h2", config(), &bus);

        h1.activate();
        h2.activate();
        let active = wait_for_state(&mut status1, StateKind::Active).await;
        wait_for_state(&mut status2, StateKind::Active).await;
        let assignments = active.assignments.expect("assignments");
        let for_h1 = key_owned_by(&assignments, &host("h1"));

        // arrives at h2 but belongs to h1
        let misrouted = |num_hops| Message {
            source: host("h3"),
            channel: Channel::Host(host("h2")),
            body: MessageBody::Forward {
                payload: json!({"request_id": for_h1}),
                num_hops,
            },
        };

        bus.publish(&Channel::Host(host("h2")), misrouted(5).encode()?)?;
        time::sleep(Duration::from_millis(10)).await;
        assert!(rules1.events().is_empty());
        assert!(rules2.events().is_empty());

        bus.publish(&Channel::Host(host("h2")), misrouted(1).encode()?)?;
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rules1.events().len(), 1);
        assert!(rules2.events().is_empty());

        h1.stop().await;
        h2.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_messages_are_discarded() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let (handle, mut status, _) = manager("h1", config(), &bus);

        handle.activate();
        wait_for_state(&mut status, StateKind::Active).await;

        bus.publish(&Channel::Admin, r#"{"channel":"_admin","type":"query"}"#.to_string())?;
        let empty_leader = json!({
            "source": "h0",
            "channel": "_admin",
            "type": "leader",
            "assignments": {"leader": "h0", "host_array": []}
        });
        bus.publish(&Channel::Admin, empty_leader.to_string())?;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(status.borrow().state, StateKind::Active);

        handle.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_goes_idle_and_announces_it() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let (h1, mut status1, _) = manager("h1", config(), &bus);
        let (h2, mut status2, _) = manager("h2", config(), &bus);

        h1.activate();
        h2.activate();
        wait_for_state(&mut status1, StateKind::Active).await;
        wait_for_state(&mut status2, StateKind::Active).await;

        h2.deactivate();
        let idle = wait_for_state(&mut status2, StateKind::Idle).await;
        assert!(idle.assignments.is_none());
        assert_eq!(bus.subscriber_filter(&host("h2")), Some(filter::nothing()));

        // h1 leads and takes h2's buckets over
        let taken_over = wait_for(&mut status1, |s| {
            s.assignments
                .as_ref()
                .is_some_and(|a| a.bucket_count(&host("h1")) == 16)
        })
        .await;
        assert_eq!(taken_over.state, StateKind::Active);

        h2.activate();
        let rejoined = wait_for_state(&mut status2, StateKind::Active).await;
        let assignments = rejoined.assignments.expect("assignments");
        assert_eq!(assignments.bucket_count(&host("h2")), 8);

        h1.stop().await;
        h2.stop().await;
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_config() {
        let bus = Arc::new(LocalBus::new());
        let config = PoolConfig {
            active_heartbeat: Duration::ZERO,
            ..config()
        };

        let manager = PoolManager::new(
            host("h1"),
            config,
            bus,
            Arc::new(JsonFieldRouter::new("request_id")),
            Arc::new(RecordingRules::default()),
        );

        assert!(manager.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_of_replaced_state_are_ignored() -> Result<()> {
        init_logging(LevelFilter::Info);
        let bus = Arc::new(LocalBus::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PoolStatus {
            state: StateKind::Idle,
            assignments: None,
        });
        let mut driver = PoolManager::new(
            host("h1"),
            config(),
            bus.clone(),
            Arc::new(JsonFieldRouter::new("request_id")),
            Arc::new(RecordingRules::default()),
        )?
        .into_driver(events_tx, inbound_tx, status_tx);

        let (admin_tx, mut admin_rx) = mpsc::unbounded_channel();
        bus.subscribe(&host("h0"), Filter::equals("channel", "_admin"), admin_tx)?;

        let first = state::go_active(&mut driver.ctx, Some(assignments_for("h1", &["h1"], 4)));
        driver.transition(Some(first));
        let stale_epoch = driver.ctx.epoch;

        let second = assignments_for("h1", &["h1", "h2"], 4);
        let replacement = state::go_active(&mut driver.ctx, Some(second.clone()));
        driver.transition(Some(replacement));

        // the replacement has seen no own heartbeat yet, so only the epoch check saves it
        assert!(driver.handle(Event::Timer {
            epoch: stale_epoch,
            kind: TimerKind::OwnHeartbeatCheck,
        }));
        assert_eq!(driver.state.kind(), StateKind::Active);
        assert_eq!(status_rx.borrow().assignments, Some(second));
        assert!(admin_rx.try_recv().is_err());

        let current_epoch = driver.ctx.epoch;
        driver.handle(Event::Timer {
            epoch: current_epoch,
            kind: TimerKind::OwnHeartbeatCheck,
        });
        assert_eq!(driver.state.kind(), StateKind::Start);
        assert!(admin_rx.try_recv().is_ok());

        Ok(())
    }
}
