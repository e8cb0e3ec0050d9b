//! Mindo sync: client-side engine keeping a local item mirror in step with the
//! Mindo server.

pub mod auth;
pub mod engine;
pub mod error;
pub mod extract;
pub mod query;
pub mod remote;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::StoreError;
use crate::store::FileStore;

/// Page size used when none is given.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Default API base when `MINDO_API_URL` is unset.
pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";

/// Resolve the API base URL from env var or default.
pub fn resolve_api_base() -> String {
    match std::env::var("MINDO_API_URL") {
        Ok(url) if !url.trim().is_empty() => url.trim().to_string(),
        _ => DEFAULT_API_URL.to_string(),
    }
}

/// Resolve the local data directory from env var or default location.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("MINDO_DATA_DIR") {
        return PathBuf::from(path);
    }

    let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.join("mindo")
}

/// Open or create the durable store rooted at `path`.
pub fn init_store(path: &Path) -> Result<Arc<FileStore>, StoreError> {
    let store = FileStore::open(path)?;
    tracing::debug!(dir = %store.dir().display(), "opened local store");
    Ok(Arc::new(store))
}
