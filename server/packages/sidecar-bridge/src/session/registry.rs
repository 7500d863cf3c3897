use std::collections::{BTreeMap, BTreeSet, HashMap};

use sidecar_bridge_error::BridgeError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use super::editing::{CodeEditingSession, RollbackReport};
use crate::documents::DocumentStore;
use crate::model::Range;

/// A live session plus the handles needed to stop its in-flight calls.
#[derive(Debug)]
pub struct SessionEntry {
    pub session: CodeEditingSession,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SessionEntry {
    fn new(session_id: &str) -> Self {
        Self {
            session: CodeEditingSession::new(session_id),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Token for one call made on behalf of this session. Cancelled when the
    /// session stops.
    pub fn call_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

/// Handles for draining a session that is being stopped.
#[derive(Debug, Clone)]
pub struct StopHandle {
    pub tracker: TaskTracker,
}

/// Session id → live session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, session_id: &str) -> &mut SessionEntry {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(session_id, "sessions: created");
                SessionEntry::new(session_id)
            })
    }

    pub fn entry(&self, session_id: &str) -> Result<&SessionEntry, BridgeError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| not_found(session_id))
    }

    pub fn get(&self, session_id: &str) -> Result<&CodeEditingSession, BridgeError> {
        self.entry(session_id).map(|entry| &entry.session)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Result<&mut CodeEditingSession, BridgeError> {
        self.sessions
            .get_mut(session_id)
            .map(|entry| &mut entry.session)
            .ok_or_else(|| not_found(session_id))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn reject_for_exchange(
        &mut self,
        session_id: &str,
        exchange_id: &str,
        documents: &mut dyn DocumentStore,
    ) -> Result<RollbackReport, BridgeError> {
        self.get_mut(session_id)?
            .reject_for_exchange(exchange_id, documents)
    }

    pub fn file_location_for_edits_made(
        &self,
        session_id: &str,
        exchange_id: &str,
        documents: &dyn DocumentStore,
    ) -> Result<BTreeMap<Url, Vec<Range>>, BridgeError> {
        self.get(session_id)?
            .file_location_for_edits_made(exchange_id, documents)
    }

    pub fn files_changed_for_exchange(
        &self,
        session_id: &str,
        exchange_id: &str,
    ) -> Result<BTreeSet<Url>, BridgeError> {
        Ok(self.get(session_id)?.files_changed_for_exchange(exchange_id))
    }

    /// Cancel every call tied to the session and stop accepting new ones.
    /// The caller waits on the returned tracker, then calls [`Self::dispose`].
    pub fn begin_stop(&mut self, session_id: &str) -> Result<StopHandle, BridgeError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| not_found(session_id))?;
        entry.cancel.cancel();
        entry.tracker.close();
        tracing::info!(
            session_id,
            in_flight = entry.tracker.len(),
            "sessions: stopping"
        );
        Ok(StopHandle {
            tracker: entry.tracker.clone(),
        })
    }

    /// Dispose and forget a session. Unknown ids are ignored.
    pub fn dispose(&mut self, session_id: &str) -> Option<CodeEditingSession> {
        let mut entry = self.sessions.remove(session_id)?;
        entry.cancel.cancel();
        entry.session.dispose();
        Some(entry.session)
    }
}

fn not_found(session_id: &str) -> BridgeError {
    BridgeError::SessionNotFound {
        session_id: session_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::editing::SessionState;

    #[test]
    fn sessions_are_created_once() {
        let mut registry = SessionRegistry::new();
        registry
            .get_or_create("s1")
            .session
            .begin_exchange("e1")
            .expect("begin");
        registry.get_or_create("s1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("s1").expect("session").exchanges().len(), 1);
        assert_eq!(
            registry.get("missing").expect_err("missing").error_type(),
            sidecar_bridge_error::ErrorType::SessionNotFound
        );
    }

    #[tokio::test]
    async fn stopping_cancels_call_tokens() {
        let mut registry = SessionRegistry::new();
        let token = registry.get_or_create("s1").call_token();
        let tracker = registry.entry("s1").expect("entry").tracker().clone();
        let task = tracker.spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        let stop = registry.begin_stop("s1").expect("stop");
        assert!(token.is_cancelled());
        stop.tracker.wait().await;
        task.await.expect("task joined");

        let session = registry.dispose("s1").expect("disposed");
        assert_eq!(session.state(), SessionState::Disposed);
        assert!(registry.dispose("s1").is_none());
        assert!(registry.is_empty());
    }
}
