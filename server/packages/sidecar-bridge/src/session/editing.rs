use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use sidecar_bridge_error::BridgeError;
use tokio::sync::broadcast;
use url::Url;

use super::ledger::{self, LedgerEntry};
use crate::documents::{resolve_range, DocumentStore};
use crate::model::{full_range, Range, WorkspaceTextEdit};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    StreamingEdits,
    Idle,
    Disposed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::StreamingEdits => "streaming_edits",
            Self::Idle => "idle",
            Self::Disposed => "disposed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Sent, or finished streaming and awaiting a decision.
    Pending,
    Streaming,
    Accepted,
    Rejected,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub exchange_id: String,
    pub state: ExchangeState,
    pub edits: Vec<WorkspaceTextEdit>,
    /// Set when an edit for this exchange was refused as stale.
    pub needs_review: bool,
}

impl Exchange {
    fn new(exchange_id: &str) -> Self {
        Self {
            exchange_id: exchange_id.to_string(),
            state: ExchangeState::Pending,
            edits: Vec::new(),
            needs_review: false,
        }
    }

    fn is_decided(&self) -> bool {
        matches!(self.state, ExchangeState::Accepted | ExchangeState::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub session_id: String,
    pub exchange_id: String,
    /// Number of ledger entries recorded before the exchange's first edit.
    pub ledger_position: usize,
    /// Filled when the session is rolled back to this checkpoint.
    pub edits_removed: usize,
}

/// Documents touched by a rollback. `stale` documents were modified outside
/// the session since its last write and were left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: Vec<Url>,
    pub stale: Vec<Url>,
}

impl RollbackReport {
    pub fn is_empty(&self) -> bool {
        self.restored.is_empty() && self.stale.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: String,
        state: SessionState,
    },
    ExchangeChanged {
        session_id: String,
        exchange_id: String,
        state: ExchangeState,
        needs_review: bool,
    },
    EditApplied {
        session_id: String,
        exchange_id: String,
        uri: Url,
        range: Range,
    },
    ResponseDelta {
        session_id: String,
        exchange_id: String,
        delta: String,
    },
    Disposed {
        session_id: String,
    },
}

#[derive(Debug, Clone)]
struct AppliedEdit {
    uri: Url,
    entry: LedgerEntry,
}

#[derive(Debug, Clone)]
struct DocumentBaseline {
    text: String,
    captured_version: i32,
    written_version: i32,
}

/// Edits proposed by the agent for one session, applied live and tracked so
/// they can be accepted, rejected as a whole, or rejected per exchange.
#[derive(Debug)]
pub struct CodeEditingSession {
    session_id: String,
    state: SessionState,
    exchanges: Vec<Exchange>,
    current_exchange: Option<String>,
    ledger: Vec<AppliedEdit>,
    baselines: HashMap<Url, DocumentBaseline>,
    checkpoints: Vec<Checkpoint>,
    events: broadcast::Sender<SessionEvent>,
}

impl CodeEditingSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session_id: session_id.into(),
            state: SessionState::Initial,
            exchanges: Vec::new(),
            current_exchange: None,
            ledger: Vec::new(),
            baselines: HashMap::new(),
            checkpoints: Vec::new(),
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn exchange(&self, exchange_id: &str) -> Option<&Exchange> {
        self.exchanges
            .iter()
            .find(|exchange| exchange.exchange_id == exchange_id)
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Record an exchange before any of its edits arrive.
    pub fn begin_exchange(&mut self, exchange_id: &str) -> Result<(), BridgeError> {
        self.ensure_live("begin exchange")?;
        if self.exchange(exchange_id).is_none() {
            self.exchanges.push(Exchange::new(exchange_id));
            self.emit_exchange(exchange_id);
        }
        Ok(())
    }

    pub fn apply(
        &mut self,
        exchange_id: &str,
        edit: WorkspaceTextEdit,
        documents: &mut dyn DocumentStore,
    ) -> Result<(), BridgeError> {
        self.ensure_live("apply")?;
        if let Some(exchange) = self.exchange(exchange_id) {
            if exchange.is_decided() {
                return Err(BridgeError::InvalidState {
                    session_id: self.session_id.clone(),
                    operation: format!("apply edits to exchange {exchange_id}"),
                    state: exchange.state.to_string(),
                });
            }
        }

        if self.state != SessionState::StreamingEdits {
            self.set_state(SessionState::StreamingEdits);
        }
        if self.exchange(exchange_id).is_none() {
            self.exchanges.push(Exchange::new(exchange_id));
        }
        if self.current_exchange.as_deref() != Some(exchange_id) {
            self.current_exchange = Some(exchange_id.to_string());
        }
        if let Some(exchange) = self.exchange_mut(exchange_id) {
            if exchange.state != ExchangeState::Streaming {
                exchange.state = ExchangeState::Streaming;
                self.emit_exchange(exchange_id);
            }
        }

        let actual = documents.version_id(&edit.uri);
        if let Some(expected) = edit.version_id {
            if !self.version_matches(&edit.uri, expected, actual) {
                tracing::warn!(
                    session_id = %self.session_id,
                    exchange_id,
                    uri = %edit.uri,
                    expected,
                    actual = ?actual,
                    "session: stale edit refused"
                );
                if let Some(exchange) = self.exchange_mut(exchange_id) {
                    exchange.needs_review = true;
                }
                self.emit_exchange(exchange_id);
                return Err(BridgeError::StaleEdit {
                    uri: edit.uri.to_string(),
                    expected,
                    actual,
                });
            }
        }

        let text = documents.text(&edit.uri)?;
        let (start, end) = resolve_range(&edit.uri, &text, edit.range)?;
        let version = documents.apply_edit(&edit.uri, edit.range, &edit.new_text)?;

        let first_edit = self
            .exchange(exchange_id)
            .is_some_and(|exchange| exchange.edits.is_empty());
        if first_edit {
            self.checkpoints.push(Checkpoint {
                session_id: self.session_id.clone(),
                exchange_id: exchange_id.to_string(),
                ledger_position: self.ledger.len(),
                edits_removed: 0,
            });
        }
        self.baselines
            .entry(edit.uri.clone())
            .and_modify(|baseline| baseline.written_version = version)
            .or_insert_with(|| DocumentBaseline {
                text,
                captured_version: actual.unwrap_or(0),
                written_version: version,
            });
        self.ledger.push(AppliedEdit {
            uri: edit.uri.clone(),
            entry: LedgerEntry::new(exchange_id, start, end - start, &edit.new_text),
        });

        tracing::debug!(
            session_id = %self.session_id,
            exchange_id,
            uri = %edit.uri,
            range = %edit.range,
            version,
            "session: edit applied"
        );
        let _ = self.events.send(SessionEvent::EditApplied {
            session_id: self.session_id.clone(),
            exchange_id: exchange_id.to_string(),
            uri: edit.uri.clone(),
            range: edit.range,
        });
        if let Some(exchange) = self.exchange_mut(exchange_id) {
            exchange.edits.push(edit);
        }
        Ok(())
    }

    /// Finish the current streaming turn.
    pub fn complete(&mut self) -> Result<(), BridgeError> {
        self.ensure_live("complete")?;
        if self.state == SessionState::Idle {
            return Ok(());
        }
        if let Some(exchange_id) = self.current_exchange.take() {
            if let Some(exchange) = self.exchange_mut(&exchange_id) {
                if exchange.state == ExchangeState::Streaming {
                    exchange.state = ExchangeState::Pending;
                }
            }
            self.emit_exchange(&exchange_id);
        }
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// Keep every undecided edit. Returns the documents the accepted edits
    /// touched.
    pub fn accept(&mut self) -> Result<BTreeSet<Url>, BridgeError> {
        self.ensure_idle("accept")?;
        let touched: BTreeSet<Url> = self.baselines.keys().cloned().collect();
        let decided = self.decide_open_exchanges(ExchangeState::Accepted);
        self.ledger.clear();
        self.baselines.clear();
        self.checkpoints.clear();
        for exchange_id in decided {
            self.emit_exchange(&exchange_id);
        }
        tracing::info!(
            session_id = %self.session_id,
            documents = touched.len(),
            "session: edits accepted"
        );
        Ok(touched)
    }

    /// Restore every touched document to its baseline.
    pub fn reject(&mut self, documents: &mut dyn DocumentStore) -> Result<RollbackReport, BridgeError> {
        self.ensure_idle("reject")?;
        let mut report = RollbackReport::default();
        let mut uris: Vec<Url> = self.baselines.keys().cloned().collect();
        uris.sort();
        for uri in uris {
            let Some(baseline) = self.baselines.get(&uri) else {
                continue;
            };
            if documents.version_id(&uri) != Some(baseline.written_version) {
                report.stale.push(uri);
                continue;
            }
            let text = baseline.text.clone();
            self.write_document(documents, &uri, &text)?;
            report.restored.push(uri);
        }

        let decided = self.decide_open_exchanges(ExchangeState::Rejected);
        self.ledger.clear();
        self.baselines.clear();
        self.checkpoints.clear();
        for exchange_id in decided {
            self.emit_exchange(&exchange_id);
        }
        tracing::info!(
            session_id = %self.session_id,
            restored = report.restored.len(),
            stale = report.stale.len(),
            "session: edits rejected"
        );
        Ok(report)
    }

    /// Remove one exchange's edits while keeping every other exchange's.
    pub fn reject_for_exchange(
        &mut self,
        exchange_id: &str,
        documents: &mut dyn DocumentStore,
    ) -> Result<RollbackReport, BridgeError> {
        self.ensure_live("reject exchange")?;
        if self.state == SessionState::StreamingEdits
            && self.current_exchange.as_deref() == Some(exchange_id)
        {
            return Err(BridgeError::InvalidState {
                session_id: self.session_id.clone(),
                operation: format!("reject exchange {exchange_id}"),
                state: ExchangeState::Streaming.to_string(),
            });
        }

        let targets: BTreeSet<String> = std::iter::once(exchange_id.to_string()).collect();
        let report = self.remove_exchanges(&targets, documents)?;
        if report.is_empty() {
            return Ok(report);
        }
        self.settle_removed(&targets, &report);
        tracing::info!(
            session_id = %self.session_id,
            exchange_id,
            restored = report.restored.len(),
            stale = report.stale.len(),
            "session: exchange rejected"
        );
        Ok(report)
    }

    /// Undo `exchange_id` and every exchange after it. Returns the checkpoint
    /// recorded before the exchange's first edit, or `None` when the exchange
    /// has no recorded edits.
    pub fn rollback_to_checkpoint(
        &mut self,
        exchange_id: &str,
        documents: &mut dyn DocumentStore,
    ) -> Result<Option<(Checkpoint, RollbackReport)>, BridgeError> {
        self.ensure_idle("roll back")?;
        let Some(index) = self
            .checkpoints
            .iter()
            .position(|checkpoint| checkpoint.exchange_id == exchange_id)
        else {
            return Ok(None);
        };
        let position = self.checkpoints[index].ledger_position;
        let mut targets: BTreeSet<String> = self.checkpoints[index..]
            .iter()
            .map(|checkpoint| checkpoint.exchange_id.clone())
            .collect();
        targets.extend(
            self.ledger
                .iter()
                .skip(position)
                .map(|applied| applied.entry.exchange_id.clone()),
        );

        let before = self.ledger.len();
        let report = self.remove_exchanges(&targets, documents)?;
        let mut checkpoint = self.checkpoints[index].clone();
        checkpoint.edits_removed = before - self.ledger.len();
        self.settle_removed(&targets, &report);
        tracing::info!(
            session_id = %self.session_id,
            exchange_id,
            edits_removed = checkpoint.edits_removed,
            "session: rolled back to checkpoint"
        );
        Ok(Some((checkpoint, report)))
    }

    /// Ranges the exchange's edits currently occupy, per document.
    pub fn file_location_for_edits_made(
        &self,
        exchange_id: &str,
        documents: &dyn DocumentStore,
    ) -> Result<BTreeMap<Url, Vec<Range>>, BridgeError> {
        let mut locations = BTreeMap::new();
        for uri in self.files_changed_for_exchange(exchange_id) {
            let entries = self.entries_for(&uri);
            let spans = ledger::current_spans(&entries, exchange_id);
            if spans.is_empty() {
                continue;
            }
            let text = documents.text(&uri)?;
            locations.insert(uri, ledger::spans_to_ranges(&text, &spans));
        }
        Ok(locations)
    }

    pub fn files_changed_for_exchange(&self, exchange_id: &str) -> BTreeSet<Url> {
        self.ledger
            .iter()
            .filter(|applied| applied.entry.exchange_id == exchange_id)
            .map(|applied| applied.uri.clone())
            .collect()
    }

    pub fn push_response_delta(&self, exchange_id: &str, delta: &str) {
        let _ = self.events.send(SessionEvent::ResponseDelta {
            session_id: self.session_id.clone(),
            exchange_id: exchange_id.to_string(),
            delta: delta.to_string(),
        });
    }

    pub fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        self.state = SessionState::Disposed;
        self.current_exchange = None;
        let _ = self.events.send(SessionEvent::Disposed {
            session_id: self.session_id.clone(),
        });
        tracing::debug!(session_id = %self.session_id, "session: disposed");
    }

    fn remove_exchanges(
        &mut self,
        targets: &BTreeSet<String>,
        documents: &mut dyn DocumentStore,
    ) -> Result<RollbackReport, BridgeError> {
        let mut report = RollbackReport::default();
        let touched: BTreeSet<Url> = self
            .ledger
            .iter()
            .filter(|applied| targets.contains(&applied.entry.exchange_id))
            .map(|applied| applied.uri.clone())
            .collect();

        for uri in touched {
            let Some(baseline) = self.baselines.get(&uri) else {
                continue;
            };
            if documents.version_id(&uri) != Some(baseline.written_version) {
                report.stale.push(uri);
                continue;
            }
            let entries = self.entries_for(&uri);
            let replay = ledger::replay_without(&baseline.text, &entries, |entry| {
                targets.contains(&entry.exchange_id)
            });
            let baseline_text = baseline.text.clone();
            self.write_document(documents, &uri, &replay.text)?;

            let mut rebased = replay.entries.into_iter();
            let mut rebuilt = Vec::with_capacity(self.ledger.len());
            for applied in self.ledger.drain(..) {
                if applied.uri != uri {
                    rebuilt.push(applied);
                } else if !targets.contains(&applied.entry.exchange_id) {
                    if let Some(entry) = rebased.next() {
                        rebuilt.push(AppliedEdit {
                            uri: uri.clone(),
                            entry,
                        });
                    }
                }
            }
            self.ledger = rebuilt;

            if replay.text == baseline_text && !self.ledger.iter().any(|applied| applied.uri == uri) {
                self.baselines.remove(&uri);
            }
            report.restored.push(uri);
        }
        Ok(report)
    }

    /// Update exchanges and checkpoints after `targets` were removed from
    /// the ledger where possible.
    fn settle_removed(&mut self, targets: &BTreeSet<String>, report: &RollbackReport) {
        let remaining = ledger::exchanges_in(self.ledger.iter().map(|applied| &applied.entry));
        let mut changed = Vec::new();
        for exchange in self.exchanges.iter_mut() {
            if !targets.contains(&exchange.exchange_id) {
                continue;
            }
            if remaining.contains(&exchange.exchange_id) {
                exchange.needs_review = true;
            } else {
                exchange.state = ExchangeState::Rejected;
            }
            changed.push(exchange.exchange_id.clone());
        }
        self.checkpoints
            .retain(|checkpoint| remaining.contains(&checkpoint.exchange_id));
        for checkpoint in self.checkpoints.iter_mut() {
            if let Some(position) = self
                .ledger
                .iter()
                .position(|applied| applied.entry.exchange_id == checkpoint.exchange_id)
            {
                checkpoint.ledger_position = position;
            }
        }
        if !report.stale.is_empty() {
            tracing::warn!(
                session_id = %self.session_id,
                stale = ?report.stale.iter().map(Url::as_str).collect::<Vec<_>>(),
                "session: documents changed outside the session were left untouched"
            );
        }
        for exchange_id in changed {
            self.emit_exchange(&exchange_id);
        }
    }

    fn entries_for(&self, uri: &Url) -> Vec<LedgerEntry> {
        self.ledger
            .iter()
            .filter(|applied| &applied.uri == uri)
            .map(|applied| applied.entry.clone())
            .collect()
    }

    fn write_document(
        &mut self,
        documents: &mut dyn DocumentStore,
        uri: &Url,
        text: &str,
    ) -> Result<(), BridgeError> {
        let current = documents.text(uri)?;
        if current == text {
            return Ok(());
        }
        let version = documents.apply_edit(uri, full_range(&current), text)?;
        if let Some(baseline) = self.baselines.get_mut(uri) {
            baseline.written_version = version;
        }
        Ok(())
    }

    /// Our own writes bump the version; an edit computed against any version
    /// since the baseline was captured is still current as long as nobody
    /// else has written the document.
    fn version_matches(&self, uri: &Url, expected: i32, actual: Option<i32>) -> bool {
        if actual == Some(expected) {
            return true;
        }
        self.baselines.get(uri).is_some_and(|baseline| {
            actual == Some(baseline.written_version)
                && (baseline.captured_version..=baseline.written_version).contains(&expected)
        })
    }

    fn decide_open_exchanges(&mut self, decision: ExchangeState) -> Vec<String> {
        let mut decided = Vec::new();
        for exchange in self.exchanges.iter_mut() {
            if !exchange.is_decided() {
                exchange.state = decision;
                decided.push(exchange.exchange_id.clone());
            }
        }
        decided
    }

    fn exchange_mut(&mut self, exchange_id: &str) -> Option<&mut Exchange> {
        self.exchanges
            .iter_mut()
            .find(|exchange| exchange.exchange_id == exchange_id)
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        let _ = self.events.send(SessionEvent::StateChanged {
            session_id: self.session_id.clone(),
            state,
        });
    }

    fn emit_exchange(&self, exchange_id: &str) {
        if let Some(exchange) = self.exchange(exchange_id) {
            let _ = self.events.send(SessionEvent::ExchangeChanged {
                session_id: self.session_id.clone(),
                exchange_id: exchange.exchange_id.clone(),
                state: exchange.state,
                needs_review: exchange.needs_review,
            });
        }
    }

    fn ensure_live(&self, operation: &str) -> Result<(), BridgeError> {
        if self.state == SessionState::Disposed {
            return Err(self.invalid_state(operation));
        }
        Ok(())
    }

    fn ensure_idle(&self, operation: &str) -> Result<(), BridgeError> {
        if self.state != SessionState::Idle {
            return Err(self.invalid_state(operation));
        }
        Ok(())
    }

    fn invalid_state(&self, operation: &str) -> BridgeError {
        BridgeError::InvalidState {
            session_id: self.session_id.clone(),
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::InMemoryDocumentStore;
    use sidecar_bridge_error::ErrorType;

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///workspace/{name}")).expect("uri")
    }

    fn edit(name: &str, range: Range, text: &str, version_id: Option<i32>) -> WorkspaceTextEdit {
        WorkspaceTextEdit {
            uri: uri(name),
            version_id,
            range,
            new_text: text.to_string(),
        }
    }

    fn numbered_lines(count: usize) -> String {
        (0..count).map(|line| format!("l{line}\n")).collect()
    }

    #[test]
    fn apply_complete_accept_leaves_edit_in_place() {
        let mut store =
            InMemoryDocumentStore::new().with_document(uri("a.ts"), "line zero\nabcdefgh\nend\n");
        let mut session = CodeEditingSession::new("s1");

        session
            .apply("e1", edit("a.ts", Range::lines(1, 1, 1, 5), "x", None), &mut store)
            .expect("apply");
        assert_eq!(session.state(), SessionState::StreamingEdits);
        session.complete().expect("complete");
        let touched = session.accept().expect("accept");

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            store.text(&uri("a.ts")).expect("text"),
            "line zero\naxfgh\nend\n"
        );
        assert_eq!(session.ledger_len(), 0);
        assert!(session.checkpoints().is_empty());
        assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec![uri("a.ts")]);
        assert_eq!(
            session.exchange("e1").map(|exchange| exchange.state),
            Some(ExchangeState::Accepted)
        );
    }

    #[test]
    fn rejecting_one_exchange_keeps_the_other() {
        let original = numbered_lines(13);
        let mut store = InMemoryDocumentStore::new().with_document(uri("a.ts"), original.clone());
        let mut session = CodeEditingSession::new("s1");

        // e1 collapses lines 1-3 into two lines, shifting everything below up.
        session
            .apply(
                "e1",
                edit("a.ts", Range::lines(1, 0, 3, 2), "one\ntwo", None),
                &mut store,
            )
            .expect("apply e1");
        session.complete().expect("complete e1");
        for (line, text) in [(9, "L10"), (10, "L11"), (11, "L12")] {
            session
                .apply("e2", edit("a.ts", Range::lines(line, 0, line, 3), text, None), &mut store)
                .expect("apply e2");
        }
        session.complete().expect("complete e2");

        let report = session.reject_for_exchange("e1", &mut store).expect("reject e1");
        assert_eq!(report.restored, vec![uri("a.ts")]);
        assert!(report.stale.is_empty());

        let expected = original
            .replace("l10\n", "L10\n")
            .replace("l11\n", "L11\n")
            .replace("l12\n", "L12\n");
        assert_eq!(store.text(&uri("a.ts")).expect("text"), expected);
        assert_eq!(
            session.exchange("e1").map(|exchange| exchange.state),
            Some(ExchangeState::Rejected)
        );
        assert_eq!(
            session.exchange("e2").map(|exchange| exchange.state),
            Some(ExchangeState::Pending)
        );
        assert_eq!(session.checkpoints().len(), 1);
        assert_eq!(session.checkpoints()[0].exchange_id, "e2");
        assert_eq!(session.checkpoints()[0].ledger_position, 0);
    }

    #[test]
    fn later_overlapping_exchange_survives_rejection_of_earlier_one() {
        let mut store = InMemoryDocumentStore::new()
            .with_document(uri("lib.rs"), "fn alpha() {}\nfn beta() {}\n");
        let mut session = CodeEditingSession::new("s1");

        session
            .apply("e1", edit("lib.rs", Range::lines(0, 3, 0, 8), "first", None), &mut store)
            .expect("edit A");
        session
            .apply("e1", edit("lib.rs", Range::lines(1, 3, 1, 7), "second", None), &mut store)
            .expect("edit B");
        session.complete().expect("complete e1");
        session
            .apply(
                "e2",
                edit("lib.rs", Range::lines(0, 6, 0, 10), "st(x: u8)", None),
                &mut store,
            )
            .expect("edit C");
        session.complete().expect("complete e2");
        assert_eq!(
            store.text(&uri("lib.rs")).expect("text"),
            "fn first(x: u8) {}\nfn second() {}\n"
        );

        session.reject_for_exchange("e1", &mut store).expect("reject e1");

        assert_eq!(
            store.text(&uri("lib.rs")).expect("text"),
            "fn st(x: u8) {}\nfn beta() {}\n"
        );
        let locations = session
            .file_location_for_edits_made("e2", &store)
            .expect("locations");
        assert_eq!(locations[&uri("lib.rs")], vec![Range::lines(0, 3, 0, 12)]);
        assert!(session.files_changed_for_exchange("e1").is_empty());
    }

    #[test]
    fn reject_restores_every_document() {
        let mut store = InMemoryDocumentStore::new()
            .with_document(uri("a.ts"), "const a = 1;\n")
            .with_document(uri("b.ts"), "const b = 2;\n");
        let mut session = CodeEditingSession::new("s1");
        session
            .apply("e1", edit("a.ts", Range::lines(0, 10, 0, 11), "10", None), &mut store)
            .expect("edit a");
        session
            .apply("e1", edit("b.ts", Range::lines(0, 0, 0, 0), "export ", None), &mut store)
            .expect("edit b");

        let err = session.reject(&mut store).expect_err("still streaming");
        assert_eq!(err.error_type(), ErrorType::InvalidState);

        session.complete().expect("complete");
        let report = session.reject(&mut store).expect("reject");
        assert_eq!(report.restored, vec![uri("a.ts"), uri("b.ts")]);
        assert_eq!(store.text(&uri("a.ts")).expect("a"), "const a = 1;\n");
        assert_eq!(store.text(&uri("b.ts")).expect("b"), "const b = 2;\n");
        assert_eq!(session.ledger_len(), 0);
        assert_eq!(
            session.exchange("e1").map(|exchange| exchange.state),
            Some(ExchangeState::Rejected)
        );
    }

    #[test]
    fn stale_edits_are_refused_and_flag_the_exchange() {
        let mut store = InMemoryDocumentStore::new().with_document(uri("a.ts"), "abc\ndef\n");
        let mut session = CodeEditingSession::new("s1");

        session
            .apply("e1", edit("a.ts", Range::lines(0, 0, 0, 1), "A", Some(1)), &mut store)
            .expect("first edit");
        // Computed against the same version; our own write does not make it stale.
        session
            .apply("e1", edit("a.ts", Range::lines(1, 0, 1, 1), "D", Some(1)), &mut store)
            .expect("second edit");

        store
            .apply_edit(&uri("a.ts"), Range::lines(0, 3, 0, 3), "!")
            .expect("external edit");
        let err = session
            .apply("e1", edit("a.ts", Range::lines(1, 1, 1, 2), "E", Some(3)), &mut store)
            .expect_err("stale");
        assert_eq!(
            err,
            BridgeError::StaleEdit {
                uri: uri("a.ts").to_string(),
                expected: 3,
                actual: Some(4),
            }
        );
        assert!(session.exchange("e1").is_some_and(|exchange| exchange.needs_review));
        assert_eq!(session.exchange("e1").map(|e| e.edits.len()), Some(2));

        session.complete().expect("complete");
        let report = session.reject(&mut store).expect("reject");
        assert_eq!(report.stale, vec![uri("a.ts")]);
        assert_eq!(store.text(&uri("a.ts")).expect("text"), "Abc!\nDef\n");
    }

    #[test]
    fn disposed_session_refuses_everything() {
        let mut store = InMemoryDocumentStore::new().with_document(uri("a.ts"), "abc");
        let mut session = CodeEditingSession::new("s1");
        session
            .apply("e1", edit("a.ts", Range::lines(0, 0, 0, 1), "x", None), &mut store)
            .expect("apply");
        session.complete().expect("complete");
        session.dispose();
        session.dispose();

        let before = store.version_id(&uri("a.ts"));
        let errors = [
            session
                .apply("e2", edit("a.ts", Range::lines(0, 0, 0, 0), "y", None), &mut store)
                .expect_err("apply"),
            session.complete().expect_err("complete"),
            session.accept().expect_err("accept"),
            session.reject(&mut store).expect_err("reject"),
        ];
        for err in errors {
            assert_eq!(err.error_type(), ErrorType::InvalidState);
        }
        assert_eq!(store.version_id(&uri("a.ts")), before);
        assert_eq!(store.text(&uri("a.ts")).expect("text"), "xbc");
        assert_eq!(session.exchanges().len(), 1);
        assert_eq!(session.ledger_len(), 1);
        assert_eq!(session.state(), SessionState::Disposed);
    }

    #[test]
    fn rolling_back_to_a_checkpoint_drops_later_exchanges() {
        let mut store = InMemoryDocumentStore::new()
            .with_document(uri("a.ts"), "one\n")
            .with_document(uri("b.ts"), "two\n");
        let mut session = CodeEditingSession::new("s1");
        for (exchange, name, text) in [("e1", "a.ts", "1"), ("e2", "a.ts", "+"), ("e3", "b.ts", "2")] {
            session
                .apply(exchange, edit(name, Range::lines(0, 0, 0, 0), text, None), &mut store)
                .expect("apply");
            session.complete().expect("complete");
        }
        let positions: Vec<_> = session
            .checkpoints()
            .iter()
            .map(|checkpoint| (checkpoint.exchange_id.as_str(), checkpoint.ledger_position))
            .collect();
        assert_eq!(positions, vec![("e1", 0), ("e2", 1), ("e3", 2)]);

        let (checkpoint, report) = session
            .rollback_to_checkpoint("e2", &mut store)
            .expect("rollback")
            .expect("checkpoint exists");
        assert_eq!(checkpoint.edits_removed, 2);
        assert_eq!(report.restored, vec![uri("a.ts"), uri("b.ts")]);
        assert_eq!(store.text(&uri("a.ts")).expect("a"), "1one\n");
        assert_eq!(store.text(&uri("b.ts")).expect("b"), "two\n");
        assert_eq!(session.checkpoints().len(), 1);
        for exchange in ["e2", "e3"] {
            assert_eq!(
                session.exchange(exchange).map(|e| e.state),
                Some(ExchangeState::Rejected)
            );
        }
        assert!(session
            .rollback_to_checkpoint("missing", &mut store)
            .expect("rollback")
            .is_none());
    }

    #[test]
    fn streaming_exchange_cannot_be_rejected() {
        let mut store = InMemoryDocumentStore::new().with_document(uri("a.ts"), "abc");
        let mut session = CodeEditingSession::new("s1");
        session
            .apply("e1", edit("a.ts", Range::lines(0, 0, 0, 0), "x", None), &mut store)
            .expect("apply");
        let err = session
            .reject_for_exchange("e1", &mut store)
            .expect_err("streaming");
        assert_eq!(err.error_type(), ErrorType::InvalidState);

        // An exchange without edits is a no-op.
        let report = session
            .reject_for_exchange("other", &mut store)
            .expect("no-op");
        assert!(report.is_empty());
    }

    #[test]
    fn events_follow_the_edit_lifecycle() {
        let mut store = InMemoryDocumentStore::new().with_document(uri("a.ts"), "abc");
        let mut session = CodeEditingSession::new("s1");
        let mut events = session.subscribe();

        session.begin_exchange("e1").expect("begin");
        session
            .apply("e1", edit("a.ts", Range::lines(0, 0, 0, 0), "x", None), &mut store)
            .expect("apply");
        session.push_response_delta("e1", "done");
        session.complete().expect("complete");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(match event {
                SessionEvent::StateChanged { state, .. } => format!("state:{state}"),
                SessionEvent::ExchangeChanged { state, .. } => format!("exchange:{state}"),
                SessionEvent::EditApplied { .. } => "edit".to_string(),
                SessionEvent::ResponseDelta { delta, .. } => format!("delta:{delta}"),
                SessionEvent::Disposed { .. } => "disposed".to_string(),
            });
        }
        assert_eq!(
            seen,
            vec![
                "exchange:pending",
                "state:streaming_edits",
                "exchange:streaming",
                "edit",
                "delta:done",
                "exchange:pending",
                "state:idle",
            ]
        );
    }
}
