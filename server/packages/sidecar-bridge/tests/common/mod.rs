#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use sidecar_bridge::auth::StaticAuth;
use sidecar_bridge::config::BridgeConfig;
use sidecar_bridge::documents::{DocumentStore, InMemoryDocumentStore, SharedDocuments};
use sidecar_bridge::host::{Host, HostParts};
use sidecar_bridge::mock::MockSidecar;
use sidecar_bridge::model::TriggerOutcome;
use sidecar_bridge::plan::PlanSnapshot;
use sidecar_bridge::presenter::{Presenter, PresenterFuture};
use sidecar_bridge::status::RunningStatus;
use sidecar_bridge::transport::channel_pair;
use sidecar_bridge::BridgeError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DOC: &str = "file:///workspace/a.ts";
pub const ORIGINAL: &str = "let a = 1;\nlet b = 2;\n";

pub fn doc_uri() -> Url {
    Url::parse(DOC).expect("doc uri")
}

/// Wire edit replacing `line:start-line:end` with `text`.
pub fn edit(line: u32, start: u32, end: u32, text: &str) -> Value {
    json!({
        "uri": DOC,
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": end }
        },
        "newText": text
    })
}

#[derive(Default)]
pub struct RecordingPresenter {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingPresenter {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("presenter calls").clone()
    }
}

impl Presenter for RecordingPresenter {
    fn anchor_plan_view(&self, plan: PlanSnapshot) -> PresenterFuture<'_> {
        Box::pin(async move {
            self.calls.lock().expect("presenter calls").push(format!(
                "anchor {}-{}",
                plan.session_id, plan.exchange_id
            ));
        })
    }

    fn reveal_plan_step(&self, plan: PlanSnapshot, index: u32) -> PresenterFuture<'_> {
        Box::pin(async move {
            self.calls.lock().expect("presenter calls").push(format!(
                "reveal {}-{} {index}",
                plan.session_id, plan.exchange_id
            ));
        })
    }
}

pub struct Harness {
    pub host: Host,
    pub documents: Arc<Mutex<InMemoryDocumentStore>>,
    pub presenter: Arc<RecordingPresenter>,
    mock: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(BridgeConfig::default()).await
    }

    pub async fn start_with(config: BridgeConfig) -> Self {
        let (transport, inbound, endpoint) = channel_pair();
        let documents = Arc::new(Mutex::new(
            InMemoryDocumentStore::new().with_document(doc_uri(), ORIGINAL),
        ));
        let shared: SharedDocuments = documents.clone();
        let presenter = Arc::new(RecordingPresenter::default());
        let host = Host::new(HostParts {
            transport: Arc::new(transport),
            auth: Arc::new(StaticAuth::new(true)),
            documents: shared,
            presenter: presenter.clone(),
            config,
        });
        let dispatch = host.spawn_dispatch(inbound);
        let mock = MockSidecar::spawn(endpoint);
        let harness = Self {
            host,
            documents,
            presenter,
            mock,
            dispatch,
        };
        harness.wait_connected().await;
        harness
    }

    pub async fn wait_connected(&self) {
        let mut status = self.host.monitor().subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|status| status.running_status == RunningStatus::Connected),
        )
        .await
        .expect("sidecar connects in time")
        .expect("monitor alive");
    }

    pub fn text(&self) -> String {
        self.documents
            .lock()
            .expect("documents")
            .text(&doc_uri())
            .expect("document text")
    }

    pub async fn submit(
        &self,
        session_id: &str,
        exchange_id: &str,
        script: Value,
    ) -> Result<TriggerOutcome, BridgeError> {
        self.host
            .submit(session_id, exchange_id, script, CancellationToken::new())
            .await
    }

    pub fn spawn_submit(
        &self,
        session_id: &str,
        exchange_id: &str,
        script: Value,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<TriggerOutcome, BridgeError>> {
        let host = self.host.clone();
        let session_id = session_id.to_string();
        let exchange_id = exchange_id.to_string();
        tokio::spawn(async move { host.submit(&session_id, &exchange_id, script, cancel).await })
    }

    /// Wait until `count` calls are in flight through the bridge.
    pub async fn wait_pending(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.host.bridge().pending_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("calls in flight");
    }

    /// Wait until the first plan chunk for the exchange has been routed.
    pub async fn wait_plan(&self, session_id: &str, exchange_id: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !self.host.plans().is_plan_session(session_id, exchange_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("plan started");
    }

    /// Wait until the presenter has seen `call`.
    pub async fn wait_presented(&self, call: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !self.presenter.calls().iter().any(|seen| seen == call) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("presenter call");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.mock.abort();
        self.dispatch.abort();
    }
}
