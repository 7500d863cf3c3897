//! Per-document edit ledger and the offset arithmetic used to drop one
//! exchange's edits while keeping everything applied after them.
//!
//! Offsets are character offsets. Every entry is recorded against the text
//! as it was immediately before that entry was applied.

use std::collections::HashSet;

use crate::model::{char_len, position_at, replace_chars, Range};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub exchange_id: String,
    pub start: usize,
    pub removed: usize,
    pub inserted: usize,
    pub new_text: String,
}

impl LedgerEntry {
    pub fn new(exchange_id: impl Into<String>, start: usize, removed: usize, new_text: &str) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            start,
            removed,
            inserted: char_len(new_text),
            new_text: new_text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bias {
    Start,
    End,
}

/// How one original entry changed the coordinate space during a replay.
#[derive(Debug, Clone, Copy)]
enum Step {
    Dropped {
        start: usize,
        removed: usize,
        inserted: usize,
    },
    Kept {
        start: usize,
        removed: usize,
        inserted: usize,
        rebased_start: usize,
        rebased_removed: usize,
    },
}

/// Map an offset expressed against the original text at some point in the
/// ledger into the replayed text at the same point. `steps` are the entries
/// preceding that point, oldest first.
fn map_position(steps: &[Step], offset: usize, bias: Bias) -> usize {
    let mut position = offset;
    let mut adjust: isize = 0;
    for step in steps.iter().rev() {
        match *step {
            Step::Dropped {
                start,
                removed,
                inserted,
            } => {
                if position <= start {
                    continue;
                }
                if position < start + inserted {
                    position = match bias {
                        Bias::Start => start,
                        Bias::End => start + removed,
                    };
                } else {
                    position = position - inserted + removed;
                }
            }
            Step::Kept {
                start,
                removed,
                inserted,
                rebased_start,
                rebased_removed,
            } => {
                if position < start {
                    continue;
                }
                if position < start + inserted {
                    let mapped = rebased_start + (position - start);
                    return offset_by(mapped, adjust);
                }
                position = position - inserted + removed;
                adjust += inserted as isize - rebased_removed as isize;
            }
        }
    }
    offset_by(position, adjust)
}

fn offset_by(position: usize, adjust: isize) -> usize {
    (position as isize + adjust).max(0) as usize
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub text: String,
    /// Kept entries rebased onto the replayed history, in order.
    pub entries: Vec<LedgerEntry>,
}

/// Rebuild a document from `baseline` applying only the entries for which
/// `drop` returns false. Kept entries that overlapped a dropped range win:
/// their replacement is applied over whatever the baseline held there.
pub fn replay_without<F>(baseline: &str, entries: &[LedgerEntry], drop: F) -> Replay
where
    F: Fn(&LedgerEntry) -> bool,
{
    let mut text = baseline.to_string();
    let mut steps = Vec::with_capacity(entries.len());
    let mut kept = Vec::new();

    for entry in entries {
        if drop(entry) {
            steps.push(Step::Dropped {
                start: entry.start,
                removed: entry.removed,
                inserted: entry.inserted,
            });
            continue;
        }
        let len = char_len(&text);
        let start = map_position(&steps, entry.start, Bias::Start).min(len);
        let end = map_position(&steps, entry.start + entry.removed, Bias::End)
            .max(start)
            .min(len);
        text = replace_chars(&text, start, end - start, &entry.new_text);
        steps.push(Step::Kept {
            start: entry.start,
            removed: entry.removed,
            inserted: entry.inserted,
            rebased_start: start,
            rebased_removed: end - start,
        });
        kept.push(LedgerEntry {
            exchange_id: entry.exchange_id.clone(),
            start,
            removed: end - start,
            inserted: entry.inserted,
            new_text: entry.new_text.clone(),
        });
    }

    Replay {
        text,
        entries: kept,
    }
}

/// Apply every entry to `baseline`.
pub fn replay_all(baseline: &str, entries: &[LedgerEntry]) -> String {
    entries.iter().fold(baseline.to_string(), |text, entry| {
        replace_chars(&text, entry.start, entry.removed, &entry.new_text)
    })
}

/// Character spans currently occupied by the text `exchange_id` inserted,
/// after every later entry has been applied. Spans an edit deleted entirely
/// are kept as empty ranges; spans later edits erased are dropped.
pub fn current_spans(entries: &[LedgerEntry], exchange_id: &str) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize, bool)> = Vec::new();
    for entry in entries {
        let (s, d, n) = (entry.start, entry.removed, entry.inserted);
        for span in spans.iter_mut() {
            span.0 = forward(span.0, s, d, n, Bias::Start);
            span.1 = forward(span.1, s, d, n, Bias::End).max(span.0);
        }
        spans.retain(|(start, end, originally_empty)| start < end || *originally_empty);
        if entry.exchange_id == exchange_id {
            spans.push((s, s + n, n == 0));
        }
    }

    let mut spans: Vec<(usize, usize)> = spans.into_iter().map(|(s, e, _)| (s, e)).collect();
    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 && (start < last.1 || end > start) => {
                last.1 = last.1.max(end);
            }
            Some(last) if *last == (start, end) => {}
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn forward(position: usize, start: usize, removed: usize, inserted: usize, bias: Bias) -> usize {
    if position < start {
        position
    } else if position > start + removed {
        position - removed + inserted
    } else {
        match bias {
            Bias::Start if position == start => position,
            Bias::Start => start + inserted,
            Bias::End if position == start + removed && removed > 0 => start + inserted,
            Bias::End => start,
        }
    }
}

pub fn spans_to_ranges(text: &str, spans: &[(usize, usize)]) -> Vec<Range> {
    spans
        .iter()
        .map(|(start, end)| Range {
            start: position_at(text, *start),
            end: position_at(text, *end),
        })
        .collect()
}

pub fn exchanges_in<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> HashSet<String> {
    entries
        .into_iter()
        .map(|entry| entry.exchange_id.clone())
        .collect()
}
