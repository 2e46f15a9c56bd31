//! Predicates pushed to the bus so that a host only receives the traffic its
//! current state cares about. They are evaluated against the top-level fields
//! of the JSON message.

use crate::pool::{
    host::HostId,
    message::{ADMIN_CHANNEL, MSG_CHANNEL, MSG_TIMESTAMP},
};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Filter {
    Equals { field: String, value: String },
    And { filters: Vec<Filter> },
    /// An empty `Or` matches nothing.
    Or { filters: Vec<Filter> },
}

impl Filter {
    pub fn equals(field: &str, value: impl Into<String>) -> Self {
        Filter::Equals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    pub fn matches(&self, message: &Value) -> bool {
        match self {
            Filter::Equals { field, value } => match message.get(field) {
                Some(Value::String(s)) => s == value,
                Some(Value::Number(n)) => n.to_string() == *value,
                Some(Value::Bool(b)) => b.to_string() == *value,
                _ => false,
            },
            Filter::And { filters } => filters.iter().all(|f| f.matches(message)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(message)),
        }
    }
}

/// Admin traffic plus anything addressed to `host`.
pub fn admin_or_host(host: &HostId) -> Filter {
    Filter::or(vec![
        Filter::equals(MSG_CHANNEL, ADMIN_CHANNEL),
        Filter::equals(MSG_CHANNEL, host.as_str()),
    ])
}

/// Only `host`'s own heartbeat carrying `timestamp_ms`.
pub fn own_heartbeat(host: &HostId, timestamp_ms: i64) -> Filter {
    Filter::and(vec![
        Filter::equals(MSG_CHANNEL, host.as_str()),
        Filter::equals(MSG_TIMESTAMP, timestamp_ms.to_string()),
    ])
}

pub fn nothing() -> Filter {
    Filter::or(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::host::host;
    use serde_json::json;

    #[test]
    fn test_admin_or_host() {
        let filter = admin_or_host(&host("h1"));

        assert!(filter.matches(&json!({"channel": "_admin", "type": "query"})));
        assert!(filter.matches(&json!({"channel": "h1", "type": "heartbeat"})));
        assert!(!filter.matches(&json!({"channel": "h2", "type": "heartbeat"})));
        assert!(!filter.matches(&json!({"type": "query"})));
    }

    #[test]
    fn test_own_heartbeat() {
        let filter = own_heartbeat(&host("h1"), 1700);

        assert!(filter.matches(&json!({"channel": "h1", "timestamp_ms": 1700})));
        assert!(!filter.matches(&json!({"channel": "h1", "timestamp_ms": 1701})));
        assert!(!filter.matches(&json!({"channel": "_admin", "timestamp_ms": 1700})));
        assert!(!filter.matches(&json!({"channel": "h1", "type": "query"})));
    }

    #[test]
    fn test_nothing() {
        assert!(!nothing().matches(&json!({"channel": "_admin"})));
        assert!(Filter::and(Vec::new()).matches(&json!({})));
    }

    #[test]
    fn test_serialized_form() -> anyhow::Result<()> {
        let filter = Filter::and(vec![Filter::equals("type", "query")]);

        assert_eq!(
            serde_json::to_value(&filter)?,
            json!({
                "class": "and",
                "filters": [{"class": "equals", "field": "type", "value": "query"}]
            })
        );

        Ok(())
    }
}
