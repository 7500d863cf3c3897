//! Conversion of wire shapes into domain types after each hop.

use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::{
    DownloadStatus as WireDownloadStatus, PlanOutcome, RunningStatus as WireRunningStatus,
    WireChunk, WirePlanStep, WirePosition, WireRange, WireTextEdit,
};
use url::Url;

use crate::model::{Position, ProgressChunk, Range, WorkspaceTextEdit};
use crate::plan::{PlanInfo, PlanState, PlanStep};
use crate::status::{DownloadStatus, RunningStatus};

pub fn revive_chunk(chunk: WireChunk) -> Result<ProgressChunk, BridgeError> {
    Ok(match chunk {
        WireChunk::Edit(edit) => ProgressChunk::Edit {
            exchange_id: edit.exchange_id,
            edit: revive_text_edit(edit.edit)?,
        },
        WireChunk::EditsComplete(reference) => ProgressChunk::EditsComplete {
            exchange_id: reference.exchange_id,
        },
        WireChunk::PlanInfo(info) => ProgressChunk::PlanInfo {
            exchange_id: info.exchange_id,
            info: PlanInfo {
                steps: info.steps.into_iter().map(revive_plan_step).collect(),
            },
        },
        WireChunk::PlanFinished(finished) => ProgressChunk::PlanFinished {
            exchange_id: finished.exchange_id,
            outcome: match finished.outcome {
                PlanOutcome::Complete => PlanState::Complete,
                PlanOutcome::Cancelled => PlanState::Cancelled,
            },
        },
        WireChunk::Response(response) => ProgressChunk::Response {
            exchange_id: response.exchange_id,
            delta: response.delta,
        },
    })
}

pub fn revive_text_edit(edit: WireTextEdit) -> Result<WorkspaceTextEdit, BridgeError> {
    let uri = Url::parse(&edit.uri)
        .map_err(|err| BridgeError::invalid_payload(format!("edit uri {:?}: {err}", edit.uri)))?;
    let range = revive_range(edit.range);
    if range.end < range.start {
        return Err(BridgeError::invalid_payload(format!(
            "edit range {range} for {uri} ends before it starts"
        )));
    }
    Ok(WorkspaceTextEdit {
        uri,
        version_id: edit.version_id,
        range,
        new_text: edit.new_text,
    })
}

pub fn revive_range(range: WireRange) -> Range {
    Range {
        start: revive_position(range.start),
        end: revive_position(range.end),
    }
}

fn revive_position(position: WirePosition) -> Position {
    Position {
        line: position.line,
        character: position.character,
    }
}

pub fn revive_plan_step(step: WirePlanStep) -> PlanStep {
    PlanStep {
        index: step.index,
        title: step.title,
        description: step.description,
        is_last: step.is_last,
    }
}

pub fn revive_running_status(status: WireRunningStatus) -> RunningStatus {
    match status {
        WireRunningStatus::Unavailable => RunningStatus::Unavailable,
        WireRunningStatus::Starting => RunningStatus::Starting,
        WireRunningStatus::Restarting => RunningStatus::Restarting,
        WireRunningStatus::Connected => RunningStatus::Connected,
    }
}

pub fn revive_download_status(status: WireDownloadStatus) -> DownloadStatus {
    DownloadStatus {
        downloading: status.downloading,
        update: status.update,
    }
}

/// Domain → wire, used by the mock sidecar and tests.
pub fn wire_text_edit(edit: &WorkspaceTextEdit) -> WireTextEdit {
    let position = |position: Position| WirePosition {
        line: position.line,
        character: position.character,
    };
    WireTextEdit {
        uri: edit.uri.to_string(),
        version_id: edit.version_id,
        range: WireRange {
            start: position(edit.range.start),
            end: position(edit.range.end),
        },
        new_text: edit.new_text.clone(),
    }
}
