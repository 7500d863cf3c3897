use std::fmt;
use std::sync::Arc;

use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::HostMessage;
use tokio::sync::watch;

use crate::transport::AgentTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningStatus {
    Unavailable,
    Starting,
    Restarting,
    Connected,
}

impl fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unavailable => "unavailable",
            Self::Starting => "starting",
            Self::Restarting => "restarting",
            Self::Connected => "connected",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStatus {
    pub downloading: bool,
    pub update: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarStatus {
    pub running_status: RunningStatus,
    pub download_status: DownloadStatus,
}

impl Default for SidecarStatus {
    fn default() -> Self {
        Self {
            running_status: RunningStatus::Unavailable,
            download_status: DownloadStatus::default(),
        }
    }
}

/// Latest reported state of the agent sidecar. Every write publishes one
/// complete snapshot to subscribers.
pub struct SidecarMonitor {
    status: watch::Sender<SidecarStatus>,
    transport: Arc<dyn AgentTransport>,
}

impl SidecarMonitor {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        let (status, _) = watch::channel(SidecarStatus::default());
        Self { status, transport }
    }

    pub fn set_running_status(&self, running_status: RunningStatus) {
        self.status.send_modify(|status| status.running_status = running_status);
        tracing::info!(status = %running_status, "sidecar: running status");
    }

    pub fn set_download_status(&self, download_status: DownloadStatus) {
        self.status
            .send_modify(|status| status.download_status = download_status);
        tracing::debug!(
            downloading = download_status.downloading,
            update = download_status.update,
            "sidecar: download status"
        );
    }

    pub fn snapshot(&self) -> SidecarStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SidecarStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().running_status == RunningStatus::Connected
    }

    /// Ask the agent side to restart the sidecar. The status only changes
    /// when the agent reports back.
    pub async fn attempt_restart(&self) -> Result<(), BridgeError> {
        tracing::info!(
            status = %self.snapshot().running_status,
            "sidecar: restart requested"
        );
        self.transport.send(HostMessage::AttemptRestart).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    #[tokio::test]
    async fn every_notification_carries_both_fields() {
        let (transport, _inbound, _endpoint) = channel_pair();
        let monitor = SidecarMonitor::new(Arc::new(transport));
        let mut receiver = monitor.subscribe();

        monitor.set_download_status(DownloadStatus {
            downloading: true,
            update: false,
        });
        receiver.changed().await.expect("changed");
        assert_eq!(
            *receiver.borrow_and_update(),
            SidecarStatus {
                running_status: RunningStatus::Unavailable,
                download_status: DownloadStatus {
                    downloading: true,
                    update: false
                },
            }
        );

        monitor.set_running_status(RunningStatus::Starting);
        monitor.set_running_status(RunningStatus::Connected);
        receiver.changed().await.expect("changed");
        let seen = *receiver.borrow_and_update();
        assert_eq!(seen.running_status, RunningStatus::Connected);
        assert!(seen.download_status.downloading);
        assert_eq!(seen, monitor.snapshot());
        assert!(monitor.is_connected());
    }

    #[tokio::test]
    async fn restart_is_forwarded_without_changing_state() {
        let (transport, _inbound, mut endpoint) = channel_pair();
        let monitor = SidecarMonitor::new(Arc::new(transport));
        monitor.set_running_status(RunningStatus::Unavailable);

        monitor.attempt_restart().await.expect("send restart");
        assert_eq!(endpoint.recv().await, Some(HostMessage::AttemptRestart));
        assert_eq!(monitor.snapshot().running_status, RunningStatus::Unavailable);
    }
}
