use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::{decode_line, encode_line, AgentMessage, HostMessage};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::{AgentTransport, Inbound, InboundReceiver, InboundSender, SendFuture};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn sidecar `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture sidecar stdin")]
    MissingStdin,
    #[error("failed to capture sidecar stdout")]
    MissingStdout,
    #[error("failed to capture sidecar stderr")]
    MissingStderr,
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write sidecar stdin: {0}")]
    Write(std::io::Error),
    #[error("sidecar process is shutting down")]
    Closed,
}

impl From<TransportError> for BridgeError {
    fn from(value: TransportError) -> Self {
        BridgeError::transport(value.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Agent sidecar running as a child process speaking JSON lines over stdio.
#[derive(Debug)]
pub struct SidecarProcess {
    stdin: Mutex<ChildStdin>,
    child: Arc<Mutex<Child>>,
    shutting_down: Arc<AtomicBool>,
    spawned_at: Instant,
}

impl SidecarProcess {
    pub async fn start(launch: LaunchSpec) -> Result<(Arc<Self>, InboundReceiver), TransportError> {
        let spawn_start = Instant::now();

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &launch.env {
            command.env(key, value);
        }

        tracing::info!(
            program = ?launch.program,
            args = ?launch.args,
            "spawning sidecar process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                program = ?launch.program,
                error = %err,
                "failed to spawn sidecar process"
            );
            TransportError::Spawn {
                command: format_command_for_display(&launch.program, &launch.args),
                error: err,
            }
        })?;

        tracing::info!(
            pid = child.id().unwrap_or(0),
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "sidecar process spawned"
        );

        let stdin = child.stdin.take().ok_or(TransportError::MissingStdin)?;
        let stdout = child.stdout.take().ok_or(TransportError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(TransportError::MissingStderr)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let process = Arc::new(Self {
            stdin: Mutex::new(stdin),
            child: Arc::new(Mutex::new(child)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            spawned_at: spawn_start,
        });

        process.spawn_stdout_loop(stdout, inbound_tx.clone());
        process.spawn_stderr_loop(stderr);
        process.spawn_exit_watcher(inbound_tx);

        Ok((process, inbound_rx))
    }

    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Wait up to `grace` for the child to exit on its own, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            age_ms = self.spawned_at.elapsed().as_millis() as u64,
            "shutting down sidecar process"
        );

        let deadline = Instant::now() + grace;
        loop {
            let mut child = self.child.lock().await;
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {}
                Ok(None) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return;
                }
                Err(_) => {
                    let _ = child.kill().await;
                    return;
                }
            }
            drop(child);
            tokio::time::sleep(EXIT_POLL_INTERVAL.min(grace)).await;
        }
    }

    fn spawn_stdout_loop(&self, stdout: tokio::process::ChildStdout, inbound: InboundSender) {
        let spawned_at = self.spawned_at;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut line_count: u64 = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                let frame = match decode_line::<AgentMessage>(&line) {
                    Ok(Some(message)) => Inbound::Message(message),
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            line_number = line_count + 1,
                            raw = %truncate(line.trim(), 200),
                            "sidecar stdout: invalid message"
                        );
                        Inbound::Unparsed {
                            raw: line.trim().to_string(),
                            error: err.to_string(),
                        }
                    }
                };
                line_count += 1;
                if inbound.send(frame).is_err() {
                    break;
                }
            }
            tracing::info!(
                total_lines = line_count,
                age_ms = spawned_at.elapsed().as_millis() as u64,
                "sidecar stdout: stream ended"
            );
        });
    }

    fn spawn_stderr_loop(&self, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("sidecar stderr: {}", line);
            }
        });
    }

    fn spawn_exit_watcher(&self, inbound: InboundSender) {
        let child = self.child.clone();
        let spawned_at = self.spawned_at;
        tokio::spawn(async move {
            loop {
                let probe = {
                    let mut child = child.lock().await;
                    child.try_wait()
                };
                match probe {
                    Ok(Some(status)) => {
                        tracing::warn!(
                            success = status.success(),
                            code = status.code(),
                            age_ms = spawned_at.elapsed().as_millis() as u64,
                            "sidecar process exited"
                        );
                        let _ = inbound.send(Inbound::Exited {
                            code: status.code(),
                            success: status.success(),
                        });
                        break;
                    }
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to poll sidecar process status");
                        let _ = inbound.send(Inbound::Exited {
                            code: None,
                            success: false,
                        });
                        break;
                    }
                }
            }
        });
    }

    async fn write_message(&self, message: &HostMessage) -> Result<(), TransportError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let bytes = encode_line(message)?;
        tracing::debug!(
            kind = message.kind(),
            request_id = message.request_id().unwrap_or(""),
            bytes = bytes.len(),
            "stdin: writing message to sidecar"
        );
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&bytes).await.map_err(|err| {
            tracing::error!(kind = message.kind(), error = %err, "stdin: write_all failed");
            TransportError::Write(err)
        })?;
        stdin.flush().await.map_err(TransportError::Write)
    }
}

impl AgentTransport for SidecarProcess {
    fn send(&self, message: HostMessage) -> SendFuture<'_> {
        Box::pin(async move { self.write_message(&message).await.map_err(BridgeError::from) })
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_string(),
    }
}

fn format_command_for_display(program: &std::path::Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_command_is_shell_quoted() {
        assert_eq!(
            format_command_for_display(
                std::path::Path::new("/bin/agent"),
                &["--name".to_string(), "it's".to_string()]
            ),
            "'/bin/agent' '--name' 'it'\\''s'"
        );
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 5), "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_process_reports_frames_and_exit() {
        let launch = LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                r#"echo '{"type":"unregisterProvider","handle":4}'; echo 'nonsense'"#.to_string(),
            ],
            env: Vec::new(),
        };
        let (_process, mut inbound) = SidecarProcess::start(launch).await.expect("spawn sh");

        let mut frames = Vec::new();
        while frames.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
                .await
                .expect("frame before timeout")
                .expect("inbound open");
            frames.push(frame);
        }
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Inbound::Message(AgentMessage::UnregisterProvider(message)) if message.handle == 4
        )));
        assert!(frames
            .iter()
            .any(|frame| matches!(frame, Inbound::Unparsed { raw, .. } if raw == "nonsense")));
        assert!(frames.contains(&Inbound::Exited {
            code: Some(0),
            success: true
        }));
    }
}
