use crate::pool::{filter::Filter, host::HostId, message::Channel};
use anyhow::{Result, anyhow};
use log::debug;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Publish/subscribe transport shared by all hosts of a pool.
///
/// Each host holds a single subscription. Subscribing again replaces the
/// previous filter, which is how a host narrows its traffic on every state
/// transition. Filtering happens on the bus side.
pub trait Bus: Send + Sync {
    fn subscribe(
        &self,
        subscriber: &HostId,
        filter: Filter,
        handler: UnboundedSender<String>,
    ) -> Result<()>;

    fn unsubscribe(&self, subscriber: &HostId) -> Result<()>;

    fn publish(&self, channel: &Channel, message: String) -> Result<()>;
}

struct Subscription {
    filter: Filter,
    handler: UnboundedSender<String>,
}

#[derive(Default)]
struct LocalBusInner {
    subscriptions: BTreeMap<HostId, Subscription>,
    isolated: BTreeSet<HostId>,
}

/// In-process bus. Delivery is immediate and in publish order.
///
/// Hosts can be isolated to simulate a broken transport: nothing they publish
/// is delivered and nothing is delivered to them.
#[derive(Default)]
pub struct LocalBus {
    inner: Mutex<LocalBusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LocalBusInner>> {
        self.inner.lock().map_err(|_| anyhow!("bus lock poisoned"))
    }

    #[cfg(test)]
    pub fn isolate(&self, host: &HostId) -> Result<()> {
        self.lock()?.isolated.insert(host.clone());
        Ok(())
    }

    #[cfg(test)]
    pub fn reconnect(&self, host: &HostId) -> Result<()> {
        self.lock()?.isolated.remove(host);
        Ok(())
    }

    #[cfg(test)]
    pub fn subscriber_filter(&self, host: &HostId) -> Option<Filter> {
        let inner = self.lock().ok()?;
        inner.subscriptions.get(host).map(|s| s.filter.clone())
    }
}

impl Bus for LocalBus {
    fn subscribe(
        &self,
        subscriber: &HostId,
        filter: Filter,
        handler: UnboundedSender<String>,
    ) -> Result<()> {
        debug!(
            "{subscriber} subscribing with filter {}",
            serde_json::to_string(&filter)?
        );
        self.lock()?
            .subscriptions
            .insert(subscriber.clone(), Subscription { filter, handler });

        Ok(())
    }

    fn unsubscribe(&self, subscriber: &HostId) -> Result<()> {
        self.lock()?.subscriptions.remove(subscriber);
        Ok(())
    }

    fn publish(&self, channel: &Channel, message: String) -> Result<()> {
        let value: Value = serde_json::from_str(&message)?;
        let inner = self.lock()?;

        let sender_isolated = value
            .get("source")
            .and_then(|s| s.as_str())
            .is_some_and(|source| inner.isolated.iter().any(|h| h.as_str() == source));

        if sender_isolated {
            debug!("dropping message to {channel} from an isolated host");
            return Ok(());
        }

        for (host, subscription) in &inner.subscriptions {
            if inner.isolated.contains(host) || !subscription.filter.matches(&value) {
                continue;
            }

            // a closed handler only means that host is shutting down
            let _ = subscription.handler.send(message.clone());
        }

        Ok(())
    }
}
