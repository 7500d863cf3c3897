use std::future::Future;
use std::pin::Pin;

use sidecar_bridge_error::BridgeError;
use sidecar_bridge_protocol::{AgentMessage, HostMessage};
use tokio::sync::mpsc;

pub mod channel;
pub mod process;

pub use channel::{channel_pair, AgentEndpoint, ChannelTransport};
pub use process::{LaunchSpec, SidecarProcess, TransportError};

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send + 'a>>;

/// Outbound half of the host ↔ agent link.
pub trait AgentTransport: Send + Sync + 'static {
    fn send(&self, message: HostMessage) -> SendFuture<'_>;
}

/// Frames arriving from the agent side, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(AgentMessage),
    /// A line that did not parse as an [`AgentMessage`].
    Unparsed { raw: String, error: String },
    /// The agent process (or the in-memory peer) went away.
    Exited { code: Option<i32>, success: bool },
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;
