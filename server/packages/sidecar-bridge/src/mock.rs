use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use sidecar_bridge_protocol::{
    AgentMessage, DownloadStatus, EditChunk, ExchangeRef, HostMessage, PlanFinishedChunk,
    PlanInfoChunk, PlanOutcome, ProgressChunkMessage, ProviderData, ProviderKind,
    RegisterProvider, ResponseChunk, ResultMessage, ResultOutcome, RunningStatus,
    SetDownloadStatus, SetRunningStatus, TriggerMessage, WireChunk, WirePlanStep, WireTextEdit,
};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::handles::HandleRegistry;
use crate::transport::{AgentEndpoint, Inbound, InboundSender};

/// What the mock streams back for one `initiate`/`trigger`, read from the
/// call payload. Unknown payload fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MockScript {
    pub query: Option<String>,
    pub response: Option<String>,
    pub edits: Vec<WireTextEdit>,
    pub plan: Vec<WirePlanStep>,
    pub plan_outcome: Option<PlanOutcome>,
    /// Fail the call with this message after streaming.
    pub fail: Option<String>,
    /// Stop after the edits. The plan never finishes and no result is sent,
    /// so the call only ends through cancellation.
    pub hold: bool,
    pub delay_ms: u64,
}

/// Scripted agent side used by tests and `run --mock`.
pub struct MockSidecar {
    endpoint: AgentEndpoint,
    handles: HandleRegistry<ProviderData>,
    running: HashMap<String, JoinHandle<()>>,
}

impl MockSidecar {
    pub fn new(endpoint: AgentEndpoint) -> Self {
        Self {
            endpoint,
            handles: HandleRegistry::new(),
            running: HashMap::new(),
        }
    }

    pub fn spawn(endpoint: AgentEndpoint) -> JoinHandle<()> {
        tokio::spawn(Self::new(endpoint).run())
    }

    pub async fn run(mut self) {
        self.announce();
        while let Some(message) = self.endpoint.recv().await {
            self.running.retain(|_, task| !task.is_finished());
            match message {
                HostMessage::Initiate(call) | HostMessage::Trigger(call) => self.start_call(call),
                HostMessage::Cancel(cancel) => {
                    if let Some(task) = self.running.remove(&cancel.request_id) {
                        task.abort();
                        tracing::debug!(request_id = %cancel.request_id, "mock: call cancelled");
                        self.send(AgentMessage::Result(ResultMessage {
                            request_id: cancel.request_id,
                            outcome: ResultOutcome::Cancelled,
                        }));
                    }
                }
                HostMessage::UserAction(action) => {
                    tracing::debug!(
                        session_id = %action.session_id,
                        action = ?action.action,
                        "mock: user action"
                    );
                }
                HostMessage::AttemptRestart => {
                    self.send_status(RunningStatus::Restarting);
                    self.send_status(RunningStatus::Connected);
                }
            }
        }
        for (_, task) in self.running.drain() {
            task.abort();
        }
        tracing::debug!("mock: host closed the link");
    }

    fn announce(&mut self) {
        self.send_status(RunningStatus::Starting);
        self.send(AgentMessage::SetDownloadStatus(SetDownloadStatus {
            status: DownloadStatus::default(),
        }));
        for (kind, id) in [
            (ProviderKind::Agent, "mock-agent"),
            (ProviderKind::CodeEditing, "mock-code-editing"),
            (ProviderKind::Plan, "mock-plan"),
        ] {
            let data = ProviderData {
                kind,
                id: id.to_string(),
                label: Some(format!("Mock {}", kind.as_str())),
            };
            let handle = self.handles.allocate(data.clone());
            self.send(AgentMessage::RegisterProvider(RegisterProvider { handle, data }));
        }
        self.send_status(RunningStatus::Connected);
    }

    fn start_call(&mut self, call: TriggerMessage) {
        let request_id = call.request_id.clone();
        if self.handles.lookup(call.handle).is_err() {
            self.send(AgentMessage::Result(ResultMessage {
                request_id,
                outcome: ResultOutcome::Failed {
                    message: format!("mock has no provider {}", call.handle),
                },
            }));
            return;
        }
        let script: MockScript = match serde_json::from_value(call.payload.clone()) {
            Ok(script) => script,
            Err(err) => {
                tracing::debug!(error = %err, "mock: payload is not a script, using defaults");
                MockScript::default()
            }
        };
        let to_host = self.endpoint.to_host.clone();
        let task = tokio::spawn(play(to_host, call, script));
        self.running.insert(request_id, task);
    }

    fn send_status(&self, status: RunningStatus) {
        self.send(AgentMessage::SetRunningStatus(SetRunningStatus { status }));
    }

    fn send(&self, message: AgentMessage) {
        if !self.endpoint.send(message) {
            tracing::debug!("mock: host inbound closed");
        }
    }
}

async fn play(to_host: InboundSender, call: TriggerMessage, script: MockScript) {
    let request_id = call.request_id.clone();
    let exchange_id = call.exchange_id.clone();
    let delay = Duration::from_millis(script.delay_ms);
    let chunk = |chunk: WireChunk| {
        let _ = to_host.send(Inbound::Message(AgentMessage::ProgressChunk(
            ProgressChunkMessage {
                request_id: request_id.clone(),
                chunk,
            },
        )));
    };

    let response = script.response.clone().or_else(|| {
        script
            .query
            .as_ref()
            .map(|query| format!("mock: {query}"))
    });
    if let Some(delta) = response {
        chunk(WireChunk::Response(ResponseChunk {
            exchange_id: exchange_id.clone(),
            delta,
        }));
    }
    if !script.plan.is_empty() {
        chunk(WireChunk::PlanInfo(PlanInfoChunk {
            exchange_id: exchange_id.clone(),
            steps: script.plan.clone(),
        }));
    }
    for edit in &script.edits {
        if !delay.is_zero() {
            sleep(delay).await;
        }
        chunk(WireChunk::Edit(EditChunk {
            exchange_id: exchange_id.clone(),
            edit: edit.clone(),
        }));
    }
    if !script.edits.is_empty() {
        chunk(WireChunk::EditsComplete(ExchangeRef {
            exchange_id: exchange_id.clone(),
        }));
    }
    if script.hold {
        std::future::pending::<()>().await;
    }
    if !script.plan.is_empty() {
        chunk(WireChunk::PlanFinished(PlanFinishedChunk {
            exchange_id: exchange_id.clone(),
            outcome: script.plan_outcome.unwrap_or(PlanOutcome::Complete),
        }));
    }

    if !delay.is_zero() {
        sleep(delay).await;
    }
    let outcome = match script.fail {
        Some(message) => ResultOutcome::Failed { message },
        None => ResultOutcome::Completed {
            value: json!({ "edits": script.edits.len() }),
        },
    };
    let _ = to_host.send(Inbound::Message(AgentMessage::Result(ResultMessage {
        request_id,
        outcome,
    })));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    #[tokio::test]
    async fn mock_announces_providers_then_connects() {
        let (_transport, mut inbound, endpoint) = channel_pair();
        let mock = MockSidecar::spawn(endpoint);

        let mut kinds = Vec::new();
        let mut last_status = None;
        while last_status != Some(RunningStatus::Connected) {
            match inbound.recv().await {
                Some(Inbound::Message(AgentMessage::RegisterProvider(register))) => {
                    kinds.push((register.handle, register.data.kind));
                }
                Some(Inbound::Message(AgentMessage::SetRunningStatus(status))) => {
                    last_status = Some(status.status);
                }
                Some(_) => {}
                None => panic!("mock closed early"),
            }
        }
        assert_eq!(
            kinds,
            vec![
                (1, ProviderKind::Agent),
                (2, ProviderKind::CodeEditing),
                (3, ProviderKind::Plan)
            ]
        );
        mock.abort();
    }

    #[test]
    fn scripts_ignore_unknown_fields() {
        let script: MockScript = serde_json::from_value(json!({
            "query": "hello",
            "delayMs": 5,
            "somethingElse": true
        }))
        .expect("script");
        assert_eq!(script.query.as_deref(), Some("hello"));
        assert_eq!(script.delay_ms, 5);
        assert!(script.edits.is_empty());
    }
}
