use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::backend::Backend;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<Backend>,
    /// `None` disables the record management API.
    pub admin_token: Option<Arc<Zeroizing<String>>>,
    /// Cancelled on server shutdown; requests run on child tokens.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(backend: Backend, admin_token: Option<String>, shutdown: CancellationToken) -> Self {
        Self {
            backend: Arc::new(backend),
            admin_token: admin_token
                .filter(|t| !t.is_empty())
                .map(|t| Arc::new(Zeroizing::new(t))),
            shutdown,
        }
    }

    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
