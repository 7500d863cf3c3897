//! Session and RPC coordination between an editor host and an agent sidecar.

pub mod auth;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod documents;
pub mod handles;
pub mod host;
pub mod mock;
pub mod model;
pub mod plan;
pub mod presenter;
pub mod progress;
pub mod revive;
pub mod session;
pub mod status;
pub mod transport;

pub use sidecar_bridge_error::{BridgeError, ErrorReport, ErrorType};
pub use sidecar_bridge_protocol as protocol;

pub(crate) fn lock<T: ?Sized>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
