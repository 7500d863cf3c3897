//! Editor-side coordinator. Owns the bridge, the live sessions and plans and
//! the sidecar monitor, and runs the single dispatch loop for agent frames.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::{AgentMessage, ProviderKind, UserAction};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::AuthProvider;
use crate::bridge::{RpcBridge, TriggerRequest};
use crate::config::BridgeConfig;
use crate::documents::SharedDocuments;
use crate::lock;
use crate::model::{ProgressChunk, Range, TriggerOutcome};
use crate::plan::{PlanState, PlanTracker};
use crate::presenter::Presenter;
use crate::progress::ProgressCallback;
use crate::revive::{revive_download_status, revive_running_status};
use crate::session::{Checkpoint, RollbackReport, SessionEvent, SessionRegistry, SessionState};
use crate::status::{RunningStatus, SidecarMonitor};
use crate::transport::{AgentTransport, Inbound, InboundReceiver};

pub struct HostParts {
    pub transport: Arc<dyn AgentTransport>,
    pub auth: Arc<dyn AuthProvider>,
    pub documents: SharedDocuments,
    pub presenter: Arc<dyn Presenter>,
    pub config: BridgeConfig,
}

#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    bridge: RpcBridge,
    sessions: Mutex<SessionRegistry>,
    plans: PlanTracker,
    monitor: SidecarMonitor,
    documents: SharedDocuments,
    stop_grace: Duration,
}

impl Host {
    pub fn new(parts: HostParts) -> Self {
        let HostParts {
            transport,
            auth,
            documents,
            presenter,
            config,
        } = parts;
        Self {
            inner: Arc::new(HostInner {
                bridge: RpcBridge::new(transport.clone(), auth, config.request_timeout),
                sessions: Mutex::new(SessionRegistry::new()),
                plans: PlanTracker::new(presenter),
                monitor: SidecarMonitor::new(transport),
                documents,
                stop_grace: config.stop_grace,
            }),
        }
    }

    pub fn bridge(&self) -> &RpcBridge {
        &self.inner.bridge
    }

    pub fn plans(&self) -> &PlanTracker {
        &self.inner.plans
    }

    pub fn monitor(&self) -> &SidecarMonitor {
        &self.inner.monitor
    }

    pub fn documents(&self) -> &SharedDocuments {
        &self.inner.documents
    }

    pub fn spawn_dispatch(&self, inbound: InboundReceiver) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(inbound))
    }

    /// Dispatch agent frames in arrival order until the link closes.
    pub async fn run(self, mut inbound: InboundReceiver) {
        while let Some(frame) = inbound.recv().await {
            self.dispatch(frame);
        }
        tracing::debug!("host: inbound closed");
    }

    pub fn dispatch(&self, frame: Inbound) {
        let inner = &self.inner;
        match frame {
            Inbound::Message(message) => match message {
                AgentMessage::RegisterProvider(register) => {
                    if let Err(err) = inner.bridge.register_provider(register.handle, register.data)
                    {
                        tracing::warn!(error = %err, "host: provider registration refused");
                    }
                }
                AgentMessage::UnregisterProvider(unregister) => {
                    inner.bridge.unregister_provider(unregister.handle);
                }
                AgentMessage::ProgressChunk(progress) => {
                    inner
                        .bridge
                        .handle_progress_chunk(&progress.request_id, progress.chunk);
                }
                AgentMessage::Result(result) => {
                    inner.bridge.handle_result(&result.request_id, result.outcome);
                }
                AgentMessage::SetRunningStatus(status) => {
                    inner
                        .monitor
                        .set_running_status(revive_running_status(status.status));
                }
                AgentMessage::SetDownloadStatus(status) => {
                    inner
                        .monitor
                        .set_download_status(revive_download_status(status.status));
                }
            },
            Inbound::Unparsed { raw, error } => {
                tracing::warn!(error = %error, bytes = raw.len(), "host: unparsed frame dropped");
            }
            Inbound::Exited { code, success } => {
                tracing::warn!(?code, success, "host: sidecar exited");
                inner.monitor.set_running_status(RunningStatus::Unavailable);
                inner.bridge.fail_all_pending();
            }
        }
    }

    /// Start an exchange in `session_id` and stream the agent's response
    /// into it. Resolves when the agent finishes, the call is cancelled
    /// through `cancel`, or the session is stopped.
    pub async fn submit(
        &self,
        session_id: &str,
        exchange_id: &str,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<TriggerOutcome, BridgeError> {
        let inner = &self.inner;
        if !inner.monitor.is_connected() {
            return Err(BridgeError::SidecarUnavailable {
                status: inner.monitor.snapshot().running_status.to_string(),
            });
        }
        let handle = inner
            .bridge
            .provider_for_kind(ProviderKind::CodeEditing)
            .or_else(|| inner.bridge.provider_for_kind(ProviderKind::Agent))
            .ok_or_else(|| BridgeError::SidecarUnavailable {
                status: "no provider registered".to_string(),
            })?;

        let (token, tracker) = {
            let mut sessions = lock(&inner.sessions);
            let entry = sessions.get_or_create(session_id);
            entry.session.begin_exchange(exchange_id)?;
            (entry.call_token(), entry.tracker().clone())
        };

        let progress: ProgressCallback = {
            let weak = Arc::downgrade(inner);
            let session_id = session_id.to_string();
            Arc::new(move |chunk: ProgressChunk| route_chunk(&weak, &session_id, chunk))
        };
        let request = TriggerRequest {
            session_id: session_id.to_string(),
            exchange_id: exchange_id.to_string(),
            payload,
        };
        let call = tracker.track_future(inner.bridge.initiate(handle, request, progress, token.clone()));
        tokio::pin!(call);
        let outcome = tokio::select! {
            outcome = &mut call => outcome,
            _ = cancel.cancelled() => {
                token.cancel();
                call.await
            }
        };

        self.finish_exchange(session_id, exchange_id, &outcome);
        outcome
    }

    fn finish_exchange(
        &self,
        session_id: &str,
        exchange_id: &str,
        outcome: &Result<TriggerOutcome, BridgeError>,
    ) {
        let inner = &self.inner;
        {
            let mut sessions = lock(&inner.sessions);
            if let Ok(session) = sessions.get_mut(session_id) {
                if session.state() == SessionState::StreamingEdits {
                    if let Err(err) = session.complete() {
                        tracing::debug!(session_id, error = %err, "host: could not settle session");
                    }
                }
            }
        }
        let ended_early = !matches!(outcome, Ok(TriggerOutcome::Completed(_)));
        if let Some(plan) = inner.plans.get(session_id, exchange_id) {
            if ended_early && !plan.state().is_terminal() {
                let _ = plan.cancel();
            }
        }
        match outcome {
            Ok(outcome) => tracing::debug!(session_id, exchange_id, ?outcome, "host: exchange finished"),
            Err(err) => tracing::warn!(session_id, exchange_id, error = %err, "host: exchange failed"),
        }
    }

    /// Accept every undecided edit in the session. Returns the documents the
    /// edits touched so the caller can persist them.
    pub async fn accept(&self, session_id: &str) -> Result<BTreeSet<Url>, BridgeError> {
        let touched = lock(&self.inner.sessions).get_mut(session_id)?.accept()?;
        self.inner
            .bridge
            .notify_user_action(session_id, None, UserAction::AcceptedEdits)
            .await;
        Ok(touched)
    }

    pub async fn reject(&self, session_id: &str) -> Result<RollbackReport, BridgeError> {
        let report = {
            let mut sessions = lock(&self.inner.sessions);
            let mut documents = lock(&*self.inner.documents);
            sessions.get_mut(session_id)?.reject(&mut *documents)?
        };
        self.inner
            .bridge
            .notify_user_action(session_id, None, UserAction::RejectedEdits)
            .await;
        Ok(report)
    }

    pub async fn reject_for_exchange(
        &self,
        session_id: &str,
        exchange_id: &str,
    ) -> Result<RollbackReport, BridgeError> {
        let report = {
            let mut sessions = lock(&self.inner.sessions);
            let mut documents = lock(&*self.inner.documents);
            sessions.reject_for_exchange(session_id, exchange_id, &mut *documents)?
        };
        self.inner
            .bridge
            .notify_user_action(session_id, Some(exchange_id), UserAction::RejectedEdits)
            .await;
        Ok(report)
    }

    pub fn rollback_to_checkpoint(
        &self,
        session_id: &str,
        exchange_id: &str,
    ) -> Result<Option<(Checkpoint, RollbackReport)>, BridgeError> {
        let mut sessions = lock(&self.inner.sessions);
        let mut documents = lock(&*self.inner.documents);
        sessions
            .get_mut(session_id)?
            .rollback_to_checkpoint(exchange_id, &mut *documents)
    }

    pub fn file_location_for_edits_made(
        &self,
        session_id: &str,
        exchange_id: &str,
    ) -> Result<BTreeMap<Url, Vec<Range>>, BridgeError> {
        let sessions = lock(&self.inner.sessions);
        let documents = lock(&*self.inner.documents);
        sessions.file_location_for_edits_made(session_id, exchange_id, &*documents)
    }

    pub fn files_changed_for_exchange(
        &self,
        session_id: &str,
        exchange_id: &str,
    ) -> Result<BTreeSet<Url>, BridgeError> {
        lock(&self.inner.sessions).files_changed_for_exchange(session_id, exchange_id)
    }

    pub fn session_state(&self, session_id: &str) -> Result<SessionState, BridgeError> {
        Ok(lock(&self.inner.sessions).get(session_id)?.state())
    }

    pub fn session_ids(&self) -> Vec<String> {
        lock(&self.inner.sessions).session_ids()
    }

    /// Subscribe to a session's events, creating the session if needed.
    pub fn open_session(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        lock(&self.inner.sessions)
            .get_or_create(session_id)
            .session
            .subscribe()
    }

    pub fn subscribe_session(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<SessionEvent>, BridgeError> {
        Ok(lock(&self.inner.sessions).get(session_id)?.subscribe())
    }

    /// Cancel the session's calls, wait up to the stop grace for them to
    /// drain, then dispose the session and its plans.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), BridgeError> {
        let stop = lock(&self.inner.sessions).begin_stop(session_id)?;
        if tokio::time::timeout(self.inner.stop_grace, stop.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                session_id,
                in_flight = stop.tracker.len(),
                grace_ms = self.inner.stop_grace.as_millis() as u64,
                "host: calls still running after stop grace"
            );
        }
        lock(&self.inner.sessions).dispose(session_id);
        let plans = self.inner.plans.remove_session(session_id);
        tracing::info!(session_id, plans, "host: session stopped");
        self.inner
            .bridge
            .notify_user_action(session_id, None, UserAction::StoppedSession)
            .await;
        Ok(())
    }

    /// Forward a user action to the agent without touching local state.
    pub async fn user_action(
        &self,
        session_id: &str,
        exchange_id: Option<&str>,
        action: UserAction,
    ) {
        self.inner
            .bridge
            .notify_user_action(session_id, exchange_id, action)
            .await;
    }

    pub async fn attempt_restart(&self) -> Result<(), BridgeError> {
        self.inner.monitor.attempt_restart().await
    }

    /// Stop every live session.
    pub async fn shutdown(&self) {
        let session_ids = self.session_ids();
        for session_id in session_ids {
            if let Err(err) = self.stop_session(&session_id).await {
                tracing::debug!(session_id = %session_id, error = %err, "host: stop during shutdown failed");
            }
        }
    }
}

/// Apply one progress chunk to the session and plan state it belongs to.
fn route_chunk(inner: &Weak<HostInner>, session_id: &str, chunk: ProgressChunk) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    match chunk {
        ProgressChunk::Edit { exchange_id, edit } => {
            let mut sessions = lock(&inner.sessions);
            let Ok(session) = sessions.get_mut(session_id) else {
                tracing::debug!(session_id, exchange_id = %exchange_id, "host: edit for unknown session dropped");
                return;
            };
            let mut documents = lock(&*inner.documents);
            let uri = edit.uri.clone();
            let applied = session.apply(&exchange_id, edit, &mut *documents);
            match &applied {
                Ok(()) => {}
                Err(err @ BridgeError::StaleEdit { .. }) => {
                    tracing::warn!(session_id, exchange_id = %exchange_id, uri = %uri, error = %err, "host: stale edit skipped");
                }
                Err(err @ BridgeError::InvalidState { .. }) => {
                    tracing::error!(session_id, exchange_id = %exchange_id, error = %err, "host: edit arrived in the wrong state");
                }
                Err(err) => {
                    tracing::warn!(session_id, exchange_id = %exchange_id, uri = %uri, error = %err, "host: edit not applied");
                }
            }
            debug_assert!(
                !matches!(applied, Err(BridgeError::InvalidState { .. })),
                "edit routed to a session in the wrong state"
            );
        }
        ProgressChunk::EditsComplete { exchange_id } => {
            let mut sessions = lock(&inner.sessions);
            if let Ok(session) = sessions.get_mut(session_id) {
                if let Err(err) = session.complete() {
                    tracing::debug!(session_id, exchange_id = %exchange_id, error = %err, "host: edits complete ignored");
                }
            }
        }
        ProgressChunk::PlanInfo { exchange_id, info } => {
            let fresh = !inner.plans.is_plan_session(session_id, &exchange_id);
            let plan = inner.plans.get_or_start_plan_session(session_id, &exchange_id);
            if let Err(err) = plan.update_plan_info(info) {
                tracing::warn!(session_id, exchange_id = %exchange_id, error = %err, "host: plan update refused");
                return;
            }
            if fresh {
                let inner = inner.clone();
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    if let Err(err) = inner
                        .plans
                        .anchor_plan_view_pane(&session_id, &exchange_id)
                        .await
                    {
                        tracing::debug!(session_id = %session_id, error = %err, "host: plan view not anchored");
                    }
                });
            }
        }
        ProgressChunk::PlanFinished {
            exchange_id,
            outcome,
        } => {
            let plan = inner.plans.get_or_start_plan_session(session_id, &exchange_id);
            let result = match outcome {
                PlanState::Cancelled => plan.cancel(),
                PlanState::Complete | PlanState::Started => plan.complete(),
            };
            if let Err(err) = result {
                tracing::warn!(session_id, exchange_id = %exchange_id, error = %err, "host: plan finish refused");
            }
        }
        ProgressChunk::Response { exchange_id, delta } => {
            let sessions = lock(&inner.sessions);
            match sessions.get(session_id) {
                Ok(session) => session.push_response_delta(&exchange_id, &delta),
                Err(_) => {
                    tracing::debug!(session_id, exchange_id = %exchange_id, "host: response for unknown session dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::documents::{shared, InMemoryDocumentStore};
    use crate::presenter::LoggingPresenter;
    use crate::transport::channel_pair;
    use sidecar_bridge_protocol::{ProviderData, RegisterProvider, SetRunningStatus};

    fn host() -> (Host, crate::transport::AgentEndpoint) {
        let (transport, _inbound, endpoint) = channel_pair();
        let host = Host::new(HostParts {
            transport: Arc::new(transport),
            auth: Arc::new(StaticAuth::new(true)),
            documents: shared(InMemoryDocumentStore::new()),
            presenter: Arc::new(LoggingPresenter),
            config: BridgeConfig::default(),
        });
        (host, endpoint)
    }

    #[tokio::test]
    async fn submit_requires_a_connected_sidecar() {
        let (host, _endpoint) = host();
        let err = host
            .submit("s1", "e1", Value::Null, CancellationToken::new())
            .await
            .expect_err("not connected");
        assert_eq!(
            err,
            BridgeError::SidecarUnavailable {
                status: "unavailable".to_string()
            }
        );
        assert!(host.session_ids().is_empty());
    }

    #[tokio::test]
    async fn dispatch_tracks_providers_and_exit() {
        let (host, _endpoint) = host();
        host.dispatch(Inbound::Message(AgentMessage::RegisterProvider(
            RegisterProvider {
                handle: 4,
                data: ProviderData {
                    kind: ProviderKind::Agent,
                    id: "agent".to_string(),
                    label: None,
                },
            },
        )));
        host.dispatch(Inbound::Message(AgentMessage::SetRunningStatus(
            SetRunningStatus {
                status: sidecar_bridge_protocol::RunningStatus::Connected,
            },
        )));
        assert!(host.monitor().is_connected());
        assert_eq!(host.bridge().provider_for_kind(ProviderKind::Agent), Some(4));

        host.dispatch(Inbound::Unparsed {
            raw: "{".to_string(),
            error: "EOF".to_string(),
        });
        host.dispatch(Inbound::Exited {
            code: Some(1),
            success: false,
        });
        assert_eq!(
            host.monitor().snapshot().running_status,
            RunningStatus::Unavailable
        );
    }

    #[tokio::test]
    async fn operations_on_unknown_sessions_fail() {
        let (host, _endpoint) = host();
        assert!(matches!(
            host.accept("missing").await,
            Err(BridgeError::SessionNotFound { .. })
        ));
        assert!(matches!(
            host.stop_session("missing").await,
            Err(BridgeError::SessionNotFound { .. })
        ));
    }
}
