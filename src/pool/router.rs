use serde_json::Value;
use uuid::Uuid;

/// Extracts the key that decides which bucket an application event belongs to.
///
/// Events without a key are processed by whichever host receives them.
pub trait EventRouter: Send + Sync {
    fn bucket_key(&self, event: &Value) -> Option<String>;
}

/// Uses a top-level field of the event as its key.
pub struct JsonFieldRouter {
    field: String,
}

impl JsonFieldRouter {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl EventRouter for JsonFieldRouter {
    fn bucket_key(&self, event: &Value) -> Option<String> {
        match event.get(&self.field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Bucket of a key. Name-based UUIDs are stable across hosts and builds.
pub fn bucket_for_key(key: &str, bucket_count: usize) -> usize {
    let hash = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).as_u128();

    (hash % bucket_count as u128) as usize
}
