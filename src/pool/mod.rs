//! Bucket pool coordination.
//!
//! Every host runs a [`PoolManager`]. Hosts talk only through a shared [`Bus`]:
//! an admin channel everybody listens on plus one channel per host. The lowest
//! alive host id leads, splits the buckets over the alive hosts and announces
//! the result; every host then routes events to the owner of their bucket.

pub mod assignments;
pub mod bus;
pub mod filter;
pub mod host;
pub mod manager;
pub mod message;
mod network;
pub mod rebalance;
pub mod router;
pub mod state;

#[cfg(test)]
mod testing;

pub use bus::LocalBus;
pub use host::HostId;
pub use manager::{PoolManager, RuleEngine};
pub use router::JsonFieldRouter;
