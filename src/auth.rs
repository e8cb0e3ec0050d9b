//! Bearer-token session shared by the remote client and the CLI.

use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::store::DurableStore;

/// Storage key holding the access token.
pub const TOKEN_KEY: &str = "access_token";

/// The current access token, optionally persisted across restarts.
///
/// Cloning yields another handle to the same token.
#[derive(Clone)]
pub struct Session {
    token: Arc<RwLock<Option<String>>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl Session {
    /// A session that lives only in memory.
    pub fn ephemeral() -> Self {
        Self {
            token: Arc::new(RwLock::new(None)),
            store: None,
        }
    }

    /// A session backed by durable storage; loads any saved token.
    pub fn persistent(store: Arc<dyn DurableStore>) -> Self {
        let token = match store.get(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "failed to read saved access token");
                None
            }
        };
        Self {
            token: Arc::new(RwLock::new(token)),
            store: Some(store),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        if let Some(store) = &self.store {
            if let Err(e) = store.set(TOKEN_KEY, &token) {
                warn!(error = %e, "failed to persist access token");
            }
        }
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    /// Forget the token locally (logout or a 401 from the server).
    pub fn clear(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(TOKEN_KEY) {
                warn!(error = %e, "failed to remove persisted access token");
            }
        }
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
        debug!("session cleared");
    }
}
