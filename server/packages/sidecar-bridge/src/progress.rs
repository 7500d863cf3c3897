use std::collections::HashMap;
use std::sync::Arc;

use sidecar_bridge_error::BridgeError;

use crate::model::ProgressChunk;

/// Delivery callback for one in-flight request. Shared so the map lock can be
/// released before the callback runs.
pub type ProgressCallback = Arc<dyn Fn(ProgressChunk) + Send + Sync>;

/// Request id → progress callback, at most one per request.
#[derive(Default)]
pub struct PendingProgressMap<C = ProgressCallback> {
    entries: HashMap<String, C>,
}

impl<C> PendingProgressMap<C> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Never overwrites: a second handler for a live request is rejected.
    pub fn set(&mut self, request_id: impl Into<String>, callback: C) -> Result<(), BridgeError> {
        let request_id = request_id.into();
        if self.entries.contains_key(&request_id) {
            tracing::warn!(
                request_id = %request_id,
                "progress: handler already registered for request"
            );
            return Err(BridgeError::DuplicateProgressHandler { request_id });
        }
        self.entries.insert(request_id, callback);
        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Option<&C> {
        self.entries.get(request_id)
    }

    pub fn delete(&mut self, request_id: &str) -> Option<C> {
        self.entries.remove(request_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C> std::fmt::Debug for PendingProgressMap<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingProgressMap")
            .field("requests", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_handler_is_rejected_until_cleanup() {
        let mut map: PendingProgressMap<&'static str> = PendingProgressMap::new();
        map.set("r1", "first").expect("first handler");
        let err = map.set("r1", "second").expect_err("duplicate handler");
        assert_eq!(
            err,
            BridgeError::DuplicateProgressHandler {
                request_id: "r1".to_string()
            }
        );
        assert_eq!(map.get("r1"), Some(&"first"));

        assert_eq!(map.delete("r1"), Some("first"));
        assert!(map.delete("r1").is_none());
        map.set("r1", "second").expect("handler after cleanup");
        assert_eq!(map.len(), 1);
    }
}
