use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use sidecar_bridge_error::BridgeError;
use tokio::sync::broadcast;

use crate::lock;
use crate::presenter::Presenter;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub index: u32,
    pub title: String,
    pub description: String,
    pub is_last: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanInfo {
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Started,
    Complete,
    Cancelled,
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "started",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSnapshot {
    pub session_id: String,
    pub exchange_id: String,
    pub state: PlanState,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanEvent {
    StepsUpdated { indices: Vec<u32> },
    StateChanged { state: PlanState },
}

#[derive(Debug)]
struct PlanInner {
    state: PlanState,
    steps: BTreeMap<u32, PlanStep>,
}

/// Streamed plan for one exchange.
#[derive(Debug)]
pub struct PlanSession {
    session_id: String,
    exchange_id: String,
    inner: Mutex<PlanInner>,
    events: broadcast::Sender<PlanEvent>,
}

impl PlanSession {
    fn new(session_id: &str, exchange_id: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session_id: session_id.to_string(),
            exchange_id: exchange_id.to_string(),
            inner: Mutex::new(PlanInner {
                state: PlanState::Started,
                steps: BTreeMap::new(),
            }),
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.session_id, self.exchange_id)
    }

    pub fn state(&self) -> PlanState {
        lock(&self.inner).state
    }

    pub fn steps(&self) -> Vec<PlanStep> {
        lock(&self.inner).steps.values().cloned().collect()
    }

    pub fn snapshot(&self) -> PlanSnapshot {
        let inner = lock(&self.inner);
        PlanSnapshot {
            session_id: self.session_id.clone(),
            exchange_id: self.exchange_id.clone(),
            state: inner.state,
            steps: inner.steps.values().cloned().collect(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.events.subscribe()
    }

    /// Merge streamed steps. A later update for an index replaces the earlier
    /// one. The whole update is refused if any step is invalid.
    pub fn update_plan_info(&self, info: PlanInfo) -> Result<(), BridgeError> {
        let mut inner = lock(&self.inner);
        if inner.state.is_terminal() {
            return Err(self.invalid_state("update plan", inner.state));
        }

        let mut previous: Option<u32> = None;
        for (position, step) in info.steps.iter().enumerate() {
            if previous.is_some_and(|previous| step.index <= previous) {
                return Err(BridgeError::invalid_payload(format!(
                    "plan step indices must increase, got {} after {:?}",
                    step.index, previous
                )));
            }
            if step.is_last && position + 1 != info.steps.len() {
                return Err(BridgeError::invalid_payload(format!(
                    "plan step {} is marked last but more steps follow",
                    step.index
                )));
            }
            previous = Some(step.index);
        }

        let final_index = inner
            .steps
            .values()
            .find(|step| step.is_last)
            .map(|step| step.index);
        let max_index = inner.steps.keys().next_back().copied();
        for step in &info.steps {
            if let Some(final_index) = final_index {
                if step.index > final_index {
                    return Err(BridgeError::invalid_payload(format!(
                        "plan step {} comes after final step {final_index}",
                        step.index
                    )));
                }
            }
            if step.is_last && max_index.is_some_and(|max| max > step.index) {
                return Err(BridgeError::invalid_payload(format!(
                    "plan step {} cannot be last, step {:?} already exists",
                    step.index, max_index
                )));
            }
        }

        let indices: Vec<u32> = info.steps.iter().map(|step| step.index).collect();
        for step in info.steps {
            inner.steps.insert(step.index, step);
        }
        drop(inner);

        tracing::debug!(
            session_id = %self.session_id,
            exchange_id = %self.exchange_id,
            steps = indices.len(),
            "plan: steps updated"
        );
        let _ = self.events.send(PlanEvent::StepsUpdated { indices });
        Ok(())
    }

    pub fn complete(&self) -> Result<(), BridgeError> {
        self.finish(PlanState::Complete)
    }

    pub fn cancel(&self) -> Result<(), BridgeError> {
        self.finish(PlanState::Cancelled)
    }

    fn finish(&self, state: PlanState) -> Result<(), BridgeError> {
        let mut inner = lock(&self.inner);
        if inner.state == state {
            return Ok(());
        }
        if inner.state.is_terminal() {
            return Err(self.invalid_state(&format!("mark plan {state}"), inner.state));
        }
        inner.state = state;
        drop(inner);
        tracing::info!(
            session_id = %self.session_id,
            exchange_id = %self.exchange_id,
            state = %state,
            "plan: finished"
        );
        let _ = self.events.send(PlanEvent::StateChanged { state });
        Ok(())
    }

    fn invalid_state(&self, operation: &str, state: PlanState) -> BridgeError {
        BridgeError::InvalidState {
            session_id: self.session_id.clone(),
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}

/// Plans keyed by `(session_id, exchange_id)`.
pub struct PlanTracker {
    plans: Mutex<HashMap<(String, String), Arc<PlanSession>>>,
    presenter: Arc<dyn Presenter>,
}

impl PlanTracker {
    pub fn new(presenter: Arc<dyn Presenter>) -> Self {
        Self {
            plans: Mutex::new(HashMap::new()),
            presenter,
        }
    }

    pub fn is_plan_session(&self, session_id: &str, exchange_id: &str) -> bool {
        lock(&self.plans).contains_key(&key(session_id, exchange_id))
    }

    pub fn get(&self, session_id: &str, exchange_id: &str) -> Option<Arc<PlanSession>> {
        lock(&self.plans).get(&key(session_id, exchange_id)).cloned()
    }

    pub fn get_or_start_plan_session(&self, session_id: &str, exchange_id: &str) -> Arc<PlanSession> {
        lock(&self.plans)
            .entry(key(session_id, exchange_id))
            .or_insert_with(|| {
                tracing::debug!(session_id, exchange_id, "plan: started");
                Arc::new(PlanSession::new(session_id, exchange_id))
            })
            .clone()
    }

    pub async fn anchor_plan_view_pane(
        &self,
        session_id: &str,
        exchange_id: &str,
    ) -> Result<(), BridgeError> {
        let plan = self.require(session_id, exchange_id)?;
        self.presenter.anchor_plan_view(plan.snapshot()).await;
        Ok(())
    }

    pub async fn reveal_plan_step(
        &self,
        session_id: &str,
        exchange_id: &str,
        index: u32,
    ) -> Result<(), BridgeError> {
        let snapshot = self.require(session_id, exchange_id)?.snapshot();
        if !snapshot.steps.iter().any(|step| step.index == index) {
            return Err(BridgeError::invalid_payload(format!(
                "plan {session_id}-{exchange_id} has no step {index}"
            )));
        }
        self.presenter.reveal_plan_step(snapshot, index).await;
        Ok(())
    }

    /// Forget every plan belonging to a session.
    pub fn remove_session(&self, session_id: &str) -> usize {
        let mut plans = lock(&self.plans);
        let before = plans.len();
        plans.retain(|(session, _), _| session != session_id);
        before - plans.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.plans).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.plans).is_empty()
    }

    fn require(&self, session_id: &str, exchange_id: &str) -> Result<Arc<PlanSession>, BridgeError> {
        self.get(session_id, exchange_id)
            .ok_or_else(|| BridgeError::SessionNotFound {
                session_id: format!("{session_id}-{exchange_id}"),
            })
    }
}

fn key(session_id: &str, exchange_id: &str) -> (String, String) {
    (session_id.to_string(), exchange_id.to_string())
}
