use shelfmark_core::CacheStore;

use crate::error::{CatalogError, Result};

/// Run a cache store call on the blocking pool. Every store call takes the
/// SQLite connection mutex and may hit disk.
pub(crate) async fn blocking<T, F>(store: &CacheStore, op: F) -> Result<T>
where
    F: FnOnce(&CacheStore) -> shelfmark_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| CatalogError::StoreTask(e.to_string()))?
        .map_err(CatalogError::from)
}
