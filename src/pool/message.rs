use crate::pool::{assignments::BucketAssignments, host::HostId};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use strum::EnumDiscriminants;

/// Name of the shared channel seen by every host.
pub const ADMIN_CHANNEL: &str = "_admin";

/// Field names usable in bus filters.
pub const MSG_CHANNEL: &str = "channel";
pub const MSG_TIMESTAMP: &str = "timestamp_ms";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    Admin,
    Host(HostId),
}

impl TryFrom<String> for Channel {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        if value == ADMIN_CHANNEL {
            return Ok(Channel::Admin);
        }

        Ok(Channel::Host(HostId::new(value)?))
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        match value {
            Channel::Admin => ADMIN_CHANNEL.to_string(),
            Channel::Host(host) => host.into(),
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Admin => f.write_str(ADMIN_CHANNEL),
            Channel::Host(host) => host.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub source: HostId,
    pub channel: Channel,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum_discriminants(name(MessageKind), derive(strum::Display))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
pub enum MessageBody {
    /// Liveness signal, sent to the sender's own channel and its ring successor.
    Heartbeat { timestamp_ms: i64 },
    /// Reply to a query, carrying whatever assignments the sender holds.
    Identification {
        assignments: Option<Arc<BucketAssignments>>,
    },
    /// Assignments published by a host that considers itself leader.
    Leader {
        assignments: Option<Arc<BucketAssignments>>,
    },
    Offline,
    Query,
    /// Application event routed to the owner of its bucket.
    Forward { payload: Value, num_hops: u32 },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        MessageKind::from(&self.body)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes and validates a message received from the bus.
    pub fn decode(text: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(text)?;
        message.validate()?;

        Ok(message)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.body {
            MessageBody::Leader { assignments: None } => {
                bail!("leader message from {} has no assignments", self.source)
            }
            MessageBody::Leader {
                assignments: Some(assignments),
            } if assignments.leader() != &self.source => bail!(
                "leader message from {} carries assignments made by {}",
                self.source,
                assignments.leader()
            ),
            MessageBody::Forward { .. } if self.channel == Channel::Admin => {
                bail!("forward message from {} sent to the admin channel", self.source)
            }
            _ => Ok(()),
        }
    }
}
