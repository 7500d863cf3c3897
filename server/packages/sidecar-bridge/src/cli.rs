use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Value};
use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::protocol_schema;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::StaticAuth;
use crate::config::BridgeConfig;
use crate::documents::{SharedDocuments, WorkspaceDocuments};
use crate::host::{Host, HostParts};
use crate::lock;
use crate::mock::MockSidecar;
use crate::model::TriggerOutcome;
use crate::presenter::LoggingPresenter;
use crate::session::{RollbackReport, SessionEvent};
use crate::transport::{
    channel_pair, AgentTransport, InboundReceiver, LaunchSpec, SidecarProcess, TransportError,
};

const TOKEN_ENV: &str = "SIDECAR_BRIDGE_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "sidecar-bridge", bin_name = "sidecar-bridge")]
#[command(about = "Editor host bridge for an AI agent sidecar", version)]
#[command(arg_required_else_help = true)]
pub struct SidecarBridgeCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the host against an agent sidecar and read commands from stdin.
    Run(RunArgs),
    /// Print the JSON schema of the host/agent protocol.
    Schema,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Use the built-in scripted sidecar instead of spawning a process.
    #[arg(long, conflicts_with = "agent_program")]
    mock: bool,

    #[arg(long = "agent-program", short = 'a', required_unless_present = "mock")]
    agent_program: Option<PathBuf>,

    /// Arguments passed to the agent program.
    #[arg(last = true)]
    agent_args: Vec<String>,

    #[arg(long, short = 't', env = TOKEN_ENV)]
    token: Option<String>,

    /// Skip calls to the agent until a token is supplied.
    #[arg(long = "require-auth")]
    require_auth: bool,

    #[arg(long = "request-timeout-ms")]
    request_timeout_ms: Option<u64>,

    /// Root that relative document paths resolve against.
    #[arg(long, short = 'w')]
    workspace: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("either --mock or --agent-program is required")]
    MissingAgent,
}

pub fn run_sidecar_bridge() -> Result<(), CliError> {
    let SidecarBridgeCli { command } = SidecarBridgeCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Run(args) => run_host(args),
        Command::Schema => {
            let schema = serde_json::to_string_pretty(&protocol_schema())?;
            write_stdout_line(&schema)
        }
    }
}

fn run_host(args: RunArgs) -> Result<(), CliError> {
    let config =
        BridgeConfig::from_env().with_overrides(args.request_timeout_ms, args.require_auth);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    runtime.block_on(serve(args, config))
}

enum Sidecar {
    Mock(JoinHandle<()>),
    Process(Arc<SidecarProcess>),
}

async fn start_sidecar(
    args: &RunArgs,
) -> Result<(Arc<dyn AgentTransport>, InboundReceiver, Sidecar), CliError> {
    if args.mock {
        let (transport, inbound, endpoint) = channel_pair();
        let mock = MockSidecar::spawn(endpoint);
        let transport: Arc<dyn AgentTransport> = Arc::new(transport);
        return Ok((transport, inbound, Sidecar::Mock(mock)));
    }
    let program = args.agent_program.clone().ok_or(CliError::MissingAgent)?;
    let env = args
        .token
        .iter()
        .map(|token| (TOKEN_ENV.to_string(), token.clone()))
        .collect();
    let (process, inbound) = SidecarProcess::start(LaunchSpec {
        program,
        args: args.agent_args.clone(),
        env,
    })
    .await?;
    let transport: Arc<dyn AgentTransport> = process.clone();
    Ok((transport, inbound, Sidecar::Process(process)))
}

async fn serve(args: RunArgs, config: BridgeConfig) -> Result<(), CliError> {
    let authenticated = !config.require_auth || args.token.is_some();
    let stop_grace = config.stop_grace;
    let workspace = Arc::new(Mutex::new(WorkspaceDocuments::new(args.workspace.clone())));
    let documents: SharedDocuments = workspace.clone();

    let (transport, inbound, sidecar) = start_sidecar(&args).await?;
    let host = Host::new(HostParts {
        transport,
        auth: Arc::new(StaticAuth::new(authenticated)),
        documents,
        presenter: Arc::new(LoggingPresenter),
        config,
    });
    let dispatch = host.spawn_dispatch(inbound);

    let mut statuses = WatchStream::new(host.monitor().subscribe());
    let status_printer = tokio::spawn(async move {
        while let Some(status) = statuses.next().await {
            print_json(&json!({
                "event": "status",
                "runningStatus": status.running_status.to_string(),
                "downloading": status.download_status.downloading,
                "update": status.download_status.update,
            }));
        }
    });

    let repl = Repl {
        host: host.clone(),
        workspace,
        calls: Arc::new(Mutex::new(HashMap::new())),
    };
    let result = repl.run().await;

    host.shutdown().await;
    status_printer.abort();
    dispatch.abort();
    match sidecar {
        Sidecar::Mock(task) => task.abort(),
        Sidecar::Process(process) => process.shutdown(stop_grace).await,
    }
    result
}

#[derive(Parser, Debug)]
#[command(multicall = true)]
struct ReplLine {
    #[command(subcommand)]
    command: ReplCommand,
}

#[derive(Subcommand, Debug)]
enum ReplCommand {
    /// Start an exchange. The payload is the script file, or the words as a query.
    Submit {
        session: String,
        exchange: String,
        #[arg(long)]
        script: Option<PathBuf>,
        query: Vec<String>,
    },
    /// Cancel an exchange that is still running.
    Cancel { session: String, exchange: String },
    Accept { session: String },
    Reject { session: String },
    RejectExchange { session: String, exchange: String },
    Rollback { session: String, exchange: String },
    /// Ranges the exchange's edits currently occupy.
    Locations { session: String, exchange: String },
    Stop { session: String },
    Status,
    Restart,
    Quit,
}

type CallTokens = Arc<Mutex<HashMap<(String, String), CancellationToken>>>;

struct Repl {
    host: Host,
    workspace: Arc<Mutex<WorkspaceDocuments>>,
    calls: CallTokens,
}

impl Repl {
    async fn run(&self) -> Result<(), CliError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                return Ok(());
            };
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            let command = match ReplLine::try_parse_from(words) {
                Ok(parsed) => parsed.command,
                Err(err) => {
                    let _ = write_stderr_line(err.to_string().trim_end());
                    continue;
                }
            };
            if matches!(command, ReplCommand::Quit) {
                return Ok(());
            }
            if let Err(err) = self.execute(command).await {
                print_error(&err);
            }
        }
    }

    async fn execute(&self, command: ReplCommand) -> Result<(), BridgeError> {
        let host = &self.host;
        match command {
            ReplCommand::Submit {
                session,
                exchange,
                script,
                query,
            } => {
                let payload = match script {
                    Some(path) => read_script(&path)?,
                    None => json!({ "query": query.join(" ") }),
                };
                self.submit(session, exchange, payload);
            }
            ReplCommand::Cancel { session, exchange } => {
                let token = lock(&self.calls).remove(&(session.clone(), exchange.clone()));
                match token {
                    Some(token) => token.cancel(),
                    None => print_json(&json!({
                        "event": "cancel",
                        "sessionId": session,
                        "exchangeId": exchange,
                        "running": false,
                    })),
                }
            }
            ReplCommand::Accept { session } => {
                let touched = host.accept(&session).await?;
                let mut saved = Vec::new();
                for uri in touched {
                    match lock(&self.workspace).save(&uri) {
                        Ok(true) => saved.push(uri.to_string()),
                        Ok(false) => {}
                        Err(err) => {
                            tracing::warn!(uri = %uri, error = %err, "cli: save failed");
                        }
                    }
                }
                print_json(&json!({ "event": "accepted", "sessionId": session, "saved": saved }));
            }
            ReplCommand::Reject { session } => {
                let report = host.reject(&session).await?;
                print_json(&rollback_json("rejected", &session, None, &report));
            }
            ReplCommand::RejectExchange { session, exchange } => {
                let report = host.reject_for_exchange(&session, &exchange).await?;
                print_json(&rollback_json("rejected", &session, Some(&exchange), &report));
            }
            ReplCommand::Rollback { session, exchange } => {
                match host.rollback_to_checkpoint(&session, &exchange)? {
                    Some((checkpoint, report)) => {
                        let mut value = rollback_json("rolledBack", &session, Some(&exchange), &report);
                        value["editsRemoved"] = json!(checkpoint.edits_removed);
                        print_json(&value);
                    }
                    None => print_json(&json!({
                        "event": "rolledBack",
                        "sessionId": session,
                        "exchangeId": exchange,
                        "checkpoint": null,
                    })),
                }
            }
            ReplCommand::Locations { session, exchange } => {
                let locations = host.file_location_for_edits_made(&session, &exchange)?;
                let files: serde_json::Map<String, Value> = locations
                    .into_iter()
                    .map(|(uri, ranges)| {
                        let ranges: Vec<String> = ranges.iter().map(ToString::to_string).collect();
                        (uri.to_string(), json!(ranges))
                    })
                    .collect();
                print_json(&json!({
                    "event": "locations",
                    "sessionId": session,
                    "exchangeId": exchange,
                    "files": files,
                }));
            }
            ReplCommand::Stop { session } => {
                host.stop_session(&session).await?;
                lock(&self.calls).retain(|(call_session, _), _| call_session != &session);
            }
            ReplCommand::Status => {
                let status = host.monitor().snapshot();
                let providers: Vec<Value> = host
                    .bridge()
                    .providers()
                    .into_iter()
                    .map(|(handle, data)| {
                        json!({ "handle": handle, "kind": data.kind.as_str(), "id": data.id })
                    })
                    .collect();
                print_json(&json!({
                    "event": "status",
                    "runningStatus": status.running_status.to_string(),
                    "downloading": status.download_status.downloading,
                    "update": status.download_status.update,
                    "providers": providers,
                    "sessions": host.session_ids(),
                    "pendingCalls": host.bridge().pending_count(),
                }));
            }
            ReplCommand::Restart => host.attempt_restart().await?,
            ReplCommand::Quit => {}
        }
        Ok(())
    }

    fn submit(&self, session: String, exchange: String, payload: Value) {
        let host = self.host.clone();
        if host.session_state(&session).is_err() {
            watch_session(host.open_session(&session));
        }
        let token = CancellationToken::new();
        lock(&self.calls).insert((session.clone(), exchange.clone()), token.clone());
        let calls = self.calls.clone();
        tokio::spawn(async move {
            let result = host.submit(&session, &exchange, payload, token).await;
            lock(&calls).remove(&(session.clone(), exchange.clone()));
            match result {
                Ok(outcome) => print_json(&json!({
                    "event": "finished",
                    "sessionId": session,
                    "exchangeId": exchange,
                    "outcome": outcome_json(&outcome),
                })),
                Err(err) => print_error(&err),
            }
        });
    }
}

fn watch_session(receiver: tokio::sync::broadcast::Receiver<SessionEvent>) {
    let mut events = BroadcastStream::new(receiver);
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => print_json(&session_event_json(&event)),
                Err(err) => tracing::debug!(error = %err, "cli: session events lagged"),
            }
        }
    });
}

fn read_script(path: &Path) -> Result<Value, BridgeError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        BridgeError::invalid_payload(format!("cannot read {}: {err}", path.display()))
    })?;
    serde_json::from_str(&text).map_err(|err| {
        BridgeError::invalid_payload(format!("{} is not JSON: {err}", path.display()))
    })
}

fn outcome_json(outcome: &TriggerOutcome) -> Value {
    match outcome {
        TriggerOutcome::Completed(value) => json!({ "status": "completed", "value": value }),
        TriggerOutcome::Empty => json!({ "status": "empty" }),
        TriggerOutcome::Cancelled => json!({ "status": "cancelled" }),
    }
}

fn rollback_json(
    event: &str,
    session_id: &str,
    exchange_id: Option<&str>,
    report: &RollbackReport,
) -> Value {
    json!({
        "event": event,
        "sessionId": session_id,
        "exchangeId": exchange_id,
        "restored": report.restored.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "stale": report.stale.iter().map(ToString::to_string).collect::<Vec<_>>(),
    })
}

fn session_event_json(event: &SessionEvent) -> Value {
    match event {
        SessionEvent::StateChanged { session_id, state } => json!({
            "event": "sessionState",
            "sessionId": session_id,
            "state": state.to_string(),
        }),
        SessionEvent::ExchangeChanged {
            session_id,
            exchange_id,
            state,
            needs_review,
        } => json!({
            "event": "exchangeState",
            "sessionId": session_id,
            "exchangeId": exchange_id,
            "state": state.to_string(),
            "needsReview": needs_review,
        }),
        SessionEvent::EditApplied {
            session_id,
            exchange_id,
            uri,
            range,
        } => json!({
            "event": "editApplied",
            "sessionId": session_id,
            "exchangeId": exchange_id,
            "uri": uri.to_string(),
            "range": range.to_string(),
        }),
        SessionEvent::ResponseDelta {
            session_id,
            exchange_id,
            delta,
        } => json!({
            "event": "response",
            "sessionId": session_id,
            "exchangeId": exchange_id,
            "delta": delta,
        }),
        SessionEvent::Disposed { session_id } => json!({
            "event": "disposed",
            "sessionId": session_id,
        }),
    }
}

fn print_json(value: &Value) {
    if let Err(err) = write_stdout_line(&value.to_string()) {
        tracing::debug!(error = %err, "cli: stdout closed");
    }
}

fn print_error(err: &BridgeError) {
    let text = serde_json::to_string(&err.to_report()).unwrap_or_else(|_| err.to_string());
    if let Err(write_err) = write_stderr_line(&text) {
        tracing::debug!(error = %write_err, "cli: stderr closed");
    }
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
