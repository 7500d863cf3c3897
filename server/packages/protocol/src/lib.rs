//! Wire shapes exchanged between the editor host and the agent sidecar.
//!
//! Every frame is a single JSON object on its own line, tagged by `type`.
//! These types are deliberately plain data: the host revives them into its
//! own domain types after each hop.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod framing;

pub use framing::{decode_line, encode_line};

/// Messages sent by the agent side to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    RegisterProvider(RegisterProvider),
    UnregisterProvider(UnregisterProvider),
    ProgressChunk(ProgressChunkMessage),
    Result(ResultMessage),
    SetRunningStatus(SetRunningStatus),
    SetDownloadStatus(SetDownloadStatus),
}

/// Messages sent by the host to the agent side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Trigger(TriggerMessage),
    Initiate(TriggerMessage),
    Cancel(CancelMessage),
    UserAction(UserActionMessage),
    AttemptRestart,
}

impl AgentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterProvider(_) => "registerProvider",
            Self::UnregisterProvider(_) => "unregisterProvider",
            Self::ProgressChunk(_) => "progressChunk",
            Self::Result(_) => "result",
            Self::SetRunningStatus(_) => "setRunningStatus",
            Self::SetDownloadStatus(_) => "setDownloadStatus",
        }
    }
}

impl HostMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Trigger(_) => "trigger",
            Self::Initiate(_) => "initiate",
            Self::Cancel(_) => "cancel",
            Self::UserAction(_) => "userAction",
            Self::AttemptRestart => "attemptRestart",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Trigger(message) | Self::Initiate(message) => Some(&message.request_id),
            Self::Cancel(message) => Some(&message.request_id),
            Self::UserAction(_) | Self::AttemptRestart => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ProviderKind {
    Agent,
    CodeEditing,
    Plan,
    Sidecar,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::CodeEditing => "codeEditing",
            Self::Plan => "plan",
            Self::Sidecar => "sidecar",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderData {
    pub kind: ProviderKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RegisterProvider {
    pub handle: u64,
    pub data: ProviderData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnregisterProvider {
    pub handle: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessage {
    pub request_id: String,
    pub handle: u64,
    pub session_id: String,
    pub exchange_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelMessage {
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum UserAction {
    NewIteration,
    AcceptedEdits,
    RejectedEdits,
    StoppedSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserActionMessage {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    pub action: UserAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressChunkMessage {
    pub request_id: String,
    pub chunk: WireChunk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub request_id: String,
    pub outcome: ResultOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ResultOutcome {
    Completed {
        #[serde(default)]
        value: Value,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

/// One streamed piece of an in-flight request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WireChunk {
    Edit(EditChunk),
    EditsComplete(ExchangeRef),
    PlanInfo(PlanInfoChunk),
    PlanFinished(PlanFinishedChunk),
    Response(ResponseChunk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRef {
    pub exchange_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EditChunk {
    pub exchange_id: String,
    pub edit: WireTextEdit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfoChunk {
    pub exchange_id: String,
    pub steps: Vec<WirePlanStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PlanOutcome {
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanFinishedChunk {
    pub exchange_id: String,
    pub outcome: PlanOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    pub exchange_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WirePosition {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WireRange {
    pub start: WirePosition,
    pub end: WirePosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireTextEdit {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<i32>,
    pub range: WireRange,
    pub new_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WirePlanStep {
    pub index: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum RunningStatus {
    Unavailable,
    Starting,
    Restarting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct DownloadStatus {
    pub downloading: bool,
    pub update: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SetRunningStatus {
    pub status: RunningStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SetDownloadStatus {
    pub status: DownloadStatus,
}

/// JSON schema for both directions of the protocol.
pub fn protocol_schema() -> Value {
    serde_json::json!({
        "agentMessage": schemars::schema_for!(AgentMessage),
        "hostMessage": schemars::schema_for!(HostMessage),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initiate_message_shape() {
        let message = HostMessage::Initiate(TriggerMessage {
            request_id: "req-1".to_string(),
            handle: 7,
            session_id: "s1".to_string(),
            exchange_id: "e1".to_string(),
            payload: json!({ "query": "rename foo" }),
        });
        insta::assert_json_snapshot!(message, @r###"
        {
          "type": "initiate",
          "requestId": "req-1",
          "handle": 7,
          "sessionId": "s1",
          "exchangeId": "e1",
          "payload": {
            "query": "rename foo"
          }
        }
        "###);
    }

    #[test]
    fn progress_chunk_parses_from_agent_json() {
        let raw = json!({
            "type": "progressChunk",
            "requestId": "r1",
            "chunk": {
                "kind": "edit",
                "exchangeId": "e1",
                "edit": {
                    "uri": "file:///a.ts",
                    "range": {
                        "start": { "line": 1, "character": 1 },
                        "end": { "line": 1, "character": 5 }
                    },
                    "newText": "x"
                }
            }
        });
        let message: AgentMessage = serde_json::from_value(raw).expect("parse chunk");
        let AgentMessage::ProgressChunk(chunk) = message else {
            panic!("expected progress chunk");
        };
        assert_eq!(chunk.request_id, "r1");
        let WireChunk::Edit(edit) = chunk.chunk else {
            panic!("expected edit chunk");
        };
        assert_eq!(edit.edit.version_id, None);
        assert_eq!(edit.edit.range.end.character, 5);
    }

    #[test]
    fn unit_variants_round_through_tags() {
        let restart = serde_json::to_value(HostMessage::AttemptRestart).expect("serialize");
        assert_eq!(restart, json!({ "type": "attemptRestart" }));

        let cancelled: ResultOutcome =
            serde_json::from_value(json!({ "status": "cancelled" })).expect("parse outcome");
        assert_eq!(cancelled, ResultOutcome::Cancelled);

        let status: AgentMessage = serde_json::from_value(json!({
            "type": "setRunningStatus",
            "status": "restarting"
        }))
        .expect("parse status");
        assert_eq!(
            status,
            AgentMessage::SetRunningStatus(SetRunningStatus {
                status: RunningStatus::Restarting
            })
        );
    }

    #[test]
    fn schema_covers_both_directions() {
        let schema = protocol_schema();
        assert!(schema["agentMessage"].is_object());
        assert!(schema["hostMessage"].is_object());
    }
}
