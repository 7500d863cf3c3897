use std::sync::atomic::{AtomicBool, Ordering};

/// Gate consulted before any call is proxied to the agent.
pub trait AuthProvider: Send + Sync + 'static {
    fn is_authenticated(&self) -> bool;
}

/// Authentication state toggled by the embedding host.
#[derive(Debug, Default)]
pub struct StaticAuth {
    authenticated: AtomicBool,
}

impl StaticAuth {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn set(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

impl AuthProvider for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}
