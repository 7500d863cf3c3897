use std::fmt;

use serde_json::Value;
use url::Url;

/// Zero-based line/character position. `character` counts Unicode scalar
/// values within the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub const fn lines(start_line: u32, start_char: u32, end_line: u32, end_char: u32) -> Self {
        Self {
            start: Position::new(start_line, start_char),
            end: Position::new(end_line, end_char),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start.line, self.start.character, self.end.line, self.end.character
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceTextEdit {
    pub uri: Url,
    /// Document version the edit was computed against, when known.
    pub version_id: Option<i32>,
    pub range: Range,
    pub new_text: String,
}

/// One revived piece of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressChunk {
    Edit {
        exchange_id: String,
        edit: WorkspaceTextEdit,
    },
    EditsComplete {
        exchange_id: String,
    },
    PlanInfo {
        exchange_id: String,
        info: crate::plan::PlanInfo,
    },
    PlanFinished {
        exchange_id: String,
        outcome: crate::plan::PlanState,
    },
    Response {
        exchange_id: String,
        delta: String,
    },
}

impl ProgressChunk {
    pub fn exchange_id(&self) -> &str {
        match self {
            Self::Edit { exchange_id, .. }
            | Self::EditsComplete { exchange_id }
            | Self::PlanInfo { exchange_id, .. }
            | Self::PlanFinished { exchange_id, .. }
            | Self::Response { exchange_id, .. } => exchange_id,
        }
    }
}

/// Terminal result of a `trigger`/`initiate` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completed(Value),
    /// The call was not attempted (authentication gate).
    Empty,
    Cancelled,
}

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Character offset of `position` within `text`, or `None` when the position
/// lies outside the document.
pub(crate) fn offset_at(text: &str, position: Position) -> Option<usize> {
    let mut offset = 0usize;
    for (index, line) in text.split('\n').enumerate() {
        let len = char_len(line);
        if index == position.line as usize {
            let character = position.character as usize;
            return (character <= len).then_some(offset + character);
        }
        offset += len + 1;
    }
    None
}

pub(crate) fn position_at(text: &str, offset: usize) -> Position {
    let mut line = 0u32;
    let mut character = 0u32;
    for ch in text.chars().take(offset) {
        if ch == '\n' {
            line += 1;
            character = 0;
        } else {
            character += 1;
        }
    }
    Position { line, character }
}

pub(crate) fn full_range(text: &str) -> Range {
    Range {
        start: Position::new(0, 0),
        end: position_at(text, char_len(text)),
    }
}

fn byte_index(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map(|(index, _)| index)
        .unwrap_or(text.len())
}

/// Replace `removed` characters starting at character `start`.
pub(crate) fn replace_chars(text: &str, start: usize, removed: usize, insert: &str) -> String {
    let start_byte = byte_index(text, start);
    let end_byte = byte_index(text, start + removed);
    let mut out = String::with_capacity(text.len() + insert.len());
    out.push_str(&text[..start_byte]);
    out.push_str(insert);
    out.push_str(&text[end_byte..]);
    out
}
