use crate::pool::network::get_first_network_address;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Identifier of a running pool member.
///
/// Ordering is plain string ordering: the smallest identifier among the live
/// hosts is the leader, and ring neighbours are computed over the sorted set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            bail!("host id cannot be empty");
        }

        // reserved for the admin channel
        if id.starts_with('_') {
            bail!("host id cannot start with '_': {id}");
        }

        Ok(Self(id))
    }

    /// Builds an id unique to this process: the private address of the machine
    /// (or `localhost`) followed by a random suffix.
    pub fn generate() -> Self {
        let address = get_first_network_address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "localhost".to_string());
        let suffix = Uuid::new_v4().simple().to_string();

        Self(format!("{address}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HostId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<HostId> for String {
    fn from(value: HostId) -> Self {
        value.0
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
pub fn host(id: &str) -> HostId {
    HostId::new(id).expect("valid test host id")
}
