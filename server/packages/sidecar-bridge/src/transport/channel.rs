use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::{AgentMessage, HostMessage};
use tokio::sync::mpsc;

use super::{AgentTransport, Inbound, InboundReceiver, InboundSender, SendFuture};

/// In-process transport: host messages go into a channel read by an
/// [`AgentEndpoint`].
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    to_agent: mpsc::UnboundedSender<HostMessage>,
}

impl AgentTransport for ChannelTransport {
    fn send(&self, message: HostMessage) -> SendFuture<'_> {
        Box::pin(async move {
            let kind = message.kind();
            self.to_agent.send(message).map_err(|_| {
                tracing::debug!(kind, "channel: agent endpoint dropped");
                BridgeError::transport("agent endpoint closed")
            })
        })
    }
}

/// Agent side of an in-process link.
#[derive(Debug)]
pub struct AgentEndpoint {
    pub from_host: mpsc::UnboundedReceiver<HostMessage>,
    pub to_host: InboundSender,
}

impl AgentEndpoint {
    pub fn send(&self, message: AgentMessage) -> bool {
        self.to_host.send(Inbound::Message(message)).is_ok()
    }

    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.from_host.recv().await
    }

    /// Report the peer as gone, the way a process exit is reported.
    pub fn exit(&self, code: Option<i32>) {
        let _ = self.to_host.send(Inbound::Exited {
            code,
            success: code == Some(0),
        });
    }
}

pub fn channel_pair() -> (ChannelTransport, InboundReceiver, AgentEndpoint) {
    let (to_agent, from_host) = mpsc::unbounded_channel();
    let (to_host, inbound) = mpsc::unbounded_channel();
    (
        ChannelTransport { to_agent },
        inbound,
        AgentEndpoint { from_host, to_host },
    )
}
