use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::{
    CancelMessage, HostMessage, ProviderData, ProviderKind, ResultOutcome, TriggerMessage,
    UserAction, UserActionMessage, WireChunk,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthProvider;
use crate::handles::{Handle, HandleRegistry};
use crate::lock;
use crate::model::TriggerOutcome;
use crate::progress::{PendingProgressMap, ProgressCallback};
use crate::revive::revive_chunk;
use crate::transport::AgentTransport;

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequest {
    pub session_id: String,
    pub exchange_id: String,
    pub payload: Value,
}

#[derive(Debug)]
enum CallResult {
    Outcome(ResultOutcome),
    ProviderGone,
    TransportClosed,
}

#[derive(Debug)]
struct PendingCall {
    handle: Handle,
    session_id: String,
    sender: oneshot::Sender<CallResult>,
}

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Trigger,
    Initiate,
}

impl CallKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Initiate => "initiate",
        }
    }
}

/// Host-side proxy for providers registered by the agent. Calls are routed
/// by handle and correlated with streamed progress by request id.
#[derive(Clone)]
pub struct RpcBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    transport: Arc<dyn AgentTransport>,
    auth: Arc<dyn AuthProvider>,
    request_timeout: Option<Duration>,
    next_request_id: AtomicU64,
    providers: Mutex<HandleRegistry<ProviderData>>,
    progress: Mutex<PendingProgressMap<ProgressCallback>>,
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl BridgeInner {
    fn clear(&self, request_id: &str) {
        lock(&self.progress).delete(request_id);
        lock(&self.pending).remove(request_id);
    }
}

/// Removes a call's pending entries on every exit path.
struct PendingGuard<'a> {
    inner: &'a BridgeInner,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.clear(&self.request_id);
    }
}

impl RpcBridge {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        auth: Arc<dyn AuthProvider>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                transport,
                auth,
                request_timeout,
                next_request_id: AtomicU64::new(0),
                providers: Mutex::new(HandleRegistry::new()),
                progress: Mutex::new(PendingProgressMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register_provider(&self, handle: Handle, data: ProviderData) -> Result<(), BridgeError> {
        let mut providers = lock(&self.inner.providers);
        if let Some((existing, _)) = providers
            .iter()
            .find(|(_, registered)| registered.id == data.id)
        {
            tracing::warn!(
                handle,
                existing,
                provider_id = %data.id,
                "bridge: provider id already registered"
            );
            return Err(BridgeError::DuplicateRegistration {
                handle,
                message: format!("provider {} is already registered as handle {existing}", data.id),
            });
        }
        providers.insert(handle, data.clone())?;
        tracing::info!(
            handle,
            kind = data.kind.as_str(),
            provider_id = %data.id,
            "bridge: provider registered"
        );
        Ok(())
    }

    /// Idempotent. Calls in flight through the handle fail with
    /// `UnknownProvider`.
    pub fn unregister_provider(&self, handle: Handle) -> bool {
        let removed = lock(&self.inner.providers).unregister(handle);
        let orphaned: Vec<(String, PendingCall)> = {
            let mut pending = lock(&self.inner.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, call)| call.handle == handle)
                .map(|(request_id, _)| request_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|request_id| pending.remove(&request_id).map(|call| (request_id, call)))
                .collect()
        };
        for (request_id, call) in orphaned {
            lock(&self.inner.progress).delete(&request_id);
            tracing::debug!(
                handle,
                request_id = %request_id,
                session_id = %call.session_id,
                "bridge: failing call for unregistered provider"
            );
            let _ = call.sender.send(CallResult::ProviderGone);
        }
        match &removed {
            Some(data) => tracing::info!(
                handle,
                provider_id = %data.id,
                "bridge: provider unregistered"
            ),
            None => tracing::debug!(handle, "bridge: unregister for unknown handle ignored"),
        }
        removed.is_some()
    }

    pub fn provider(&self, handle: Handle) -> Result<ProviderData, BridgeError> {
        lock(&self.inner.providers).lookup(handle).cloned()
    }

    /// Lowest live handle registered for `kind`.
    pub fn provider_for_kind(&self, kind: ProviderKind) -> Option<Handle> {
        lock(&self.inner.providers)
            .iter()
            .find(|(_, data)| data.kind == kind)
            .map(|(handle, _)| handle)
    }

    pub fn providers(&self) -> Vec<(Handle, ProviderData)> {
        lock(&self.inner.providers)
            .iter()
            .map(|(handle, data)| (handle, data.clone()))
            .collect()
    }

    pub async fn trigger(
        &self,
        handle: Handle,
        request: TriggerRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<TriggerOutcome, BridgeError> {
        self.invoke(CallKind::Trigger, handle, request, progress, cancel)
            .await
    }

    pub async fn initiate(
        &self,
        handle: Handle,
        request: TriggerRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<TriggerOutcome, BridgeError> {
        self.invoke(CallKind::Initiate, handle, request, progress, cancel)
            .await
    }

    async fn invoke(
        &self,
        kind: CallKind,
        handle: Handle,
        request: TriggerRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<TriggerOutcome, BridgeError> {
        if !self.inner.auth.is_authenticated() {
            tracing::info!(
                handle,
                session_id = %request.session_id,
                call = kind.as_str(),
                "bridge: not authenticated, call skipped"
            );
            return Ok(TriggerOutcome::Empty);
        }
        let provider = self.provider(handle)?;

        let sequence = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = format!("req-{sequence}");
        lock(&self.inner.progress).set(request_id.clone(), progress)?;
        let (sender, receiver) = oneshot::channel();
        lock(&self.inner.pending).insert(
            request_id.clone(),
            PendingCall {
                handle,
                session_id: request.session_id.clone(),
                sender,
            },
        );
        let guard = PendingGuard {
            inner: &self.inner,
            request_id: request_id.clone(),
        };

        let message = TriggerMessage {
            request_id: request_id.clone(),
            handle,
            session_id: request.session_id.clone(),
            exchange_id: request.exchange_id.clone(),
            payload: request.payload,
        };
        tracing::info!(
            handle,
            provider_id = %provider.id,
            request_id = %request_id,
            session_id = %request.session_id,
            exchange_id = %request.exchange_id,
            call = kind.as_str(),
            "bridge: call → agent"
        );
        let started = Instant::now();
        self.inner
            .transport
            .send(match kind {
                CallKind::Trigger => HostMessage::Trigger(message),
                CallKind::Initiate => HostMessage::Initiate(message),
            })
            .await?;

        let timeout = self.inner.request_timeout;
        let deadline = async move {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = receiver => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(CallResult::Outcome(ResultOutcome::Completed { value })) => {
                        tracing::info!(request_id = %request_id, elapsed_ms, "bridge: call completed");
                        Ok(TriggerOutcome::Completed(value))
                    }
                    Ok(CallResult::Outcome(ResultOutcome::Cancelled)) => {
                        tracing::info!(request_id = %request_id, elapsed_ms, "bridge: call cancelled by agent");
                        Ok(TriggerOutcome::Cancelled)
                    }
                    Ok(CallResult::Outcome(ResultOutcome::Failed { message })) => {
                        tracing::warn!(request_id = %request_id, elapsed_ms, error = %message, "bridge: call failed");
                        Err(BridgeError::Remote { message })
                    }
                    Ok(CallResult::ProviderGone) => Err(BridgeError::UnknownProvider { handle }),
                    Ok(CallResult::TransportClosed) | Err(_) => {
                        Err(BridgeError::transport(format!("sidecar went away during {request_id}")))
                    }
                }
            }
            _ = cancel.cancelled() => {
                drop(guard);
                tracing::info!(request_id = %request_id, "bridge: call cancelled");
                self.send_cancel(&request_id).await;
                Ok(TriggerOutcome::Cancelled)
            }
            _ = deadline => {
                drop(guard);
                tracing::warn!(request_id = %request_id, ?timeout, "bridge: call timed out");
                self.send_cancel(&request_id).await;
                Err(BridgeError::Timeout { request_id })
            }
        }
    }

    async fn send_cancel(&self, request_id: &str) {
        let message = HostMessage::Cancel(CancelMessage {
            request_id: request_id.to_string(),
        });
        if let Err(err) = self.inner.transport.send(message).await {
            tracing::debug!(request_id, error = %err, "bridge: cancel notification not delivered");
        }
    }

    /// Deliver a streamed chunk to the call that owns `request_id`. Chunks
    /// for unknown requests are dropped.
    pub fn handle_progress_chunk(&self, request_id: &str, chunk: WireChunk) {
        let callback = lock(&self.inner.progress).get(request_id).cloned();
        let Some(callback) = callback else {
            tracing::debug!(request_id, "bridge: chunk for unknown request dropped");
            return;
        };
        match revive_chunk(chunk) {
            Ok(chunk) => callback(chunk),
            Err(err) => {
                tracing::warn!(request_id, error = %err, "bridge: malformed chunk dropped");
            }
        }
    }

    pub fn handle_result(&self, request_id: &str, outcome: ResultOutcome) {
        let call = lock(&self.inner.pending).remove(request_id);
        lock(&self.inner.progress).delete(request_id);
        match call {
            Some(call) => {
                let _ = call.sender.send(CallResult::Outcome(outcome));
            }
            None => tracing::debug!(request_id, "bridge: late result dropped"),
        }
    }

    /// Fail every call in flight. Used when the sidecar goes away.
    pub fn fail_all_pending(&self) -> usize {
        let calls: Vec<(String, PendingCall)> = lock(&self.inner.pending).drain().collect();
        let mut progress = lock(&self.inner.progress);
        for (request_id, _) in &calls {
            progress.delete(request_id);
        }
        drop(progress);
        let count = calls.len();
        for (_, call) in calls {
            let _ = call.sender.send(CallResult::TransportClosed);
        }
        if count > 0 {
            tracing::warn!(count, "bridge: failed in-flight calls");
        }
        count
    }

    pub async fn notify_user_action(
        &self,
        session_id: &str,
        exchange_id: Option<&str>,
        action: UserAction,
    ) {
        let message = HostMessage::UserAction(UserActionMessage {
            session_id: session_id.to_string(),
            exchange_id: exchange_id.map(str::to_string),
            action,
        });
        if let Err(err) = self.inner.transport.send(message).await {
            tracing::debug!(session_id, ?action, error = %err, "bridge: user action not delivered");
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn progress_handler_count(&self) -> usize {
        lock(&self.inner.progress).len()
    }
}
