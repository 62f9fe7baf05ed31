//! `almacen-client`
//!
//! **Responsibility:** the resilient data-access layer of the
//! point-of-sale client.
//!
//! This crate provides:
//! - Connection health monitoring with hysteresis on recovery
//! - Debounced, cancellable, paginated product search with
//!   stale-response suppression
//! - A persistent local product cache consulted when the backend is
//!   unreachable
//!
//! The view layer is a **thin shell** around this crate: it forwards raw
//! input events in and renders the published snapshots out.

pub mod cache;
pub mod connectivity;
pub mod remote;
pub mod search;

pub use cache::ProductCache;
pub use connectivity::{ConnectionMonitor, ConnectionState, ConnectionStatus, StatusSubscription};
pub use remote::{HttpCatalog, RemoteCatalog, RemoteError};
pub use search::{SearchController, SearchSnapshot};

use std::sync::Arc;

use almacen_core::ProductRecord;

/// The data-access services bundled for the embedding shell.
///
/// Created once at application start and passed by reference to
/// consumers; there is no global instance, so tests can wire several
/// independent layers.
#[derive(Clone)]
pub struct DataLayer {
    pub monitor: ConnectionMonitor,
    pub cache: ProductCache,
    pub search: SearchController,
}

impl DataLayer {
    /// Wire the layer over an arbitrary remote catalog.
    ///
    /// `link_up` seeds the monitor from the platform's low-level network
    /// flag; the first probe corrects it if it lied.
    pub fn new(remote: Arc<dyn RemoteCatalog>, cache: ProductCache, link_up: bool) -> Self {
        let monitor = ConnectionMonitor::new(Arc::clone(&remote), link_up);
        let search = SearchController::new(remote, cache.clone(), monitor.clone());
        Self {
            monitor,
            cache,
            search,
        }
    }

    /// The common HTTP-backed setup with the default cache location.
    pub fn over_http(api_url: impl Into<String>, token: Option<String>, link_up: bool) -> Self {
        let remote: Arc<dyn RemoteCatalog> = match token {
            Some(token) => Arc::new(HttpCatalog::with_token(api_url, token)),
            None => Arc::new(HttpCatalog::new(api_url)),
        };
        Self::new(remote, ProductCache::new(), link_up)
    }

    /// Exact barcode lookup against the local cache.
    ///
    /// The scan path keeps working offline; while online the cache is
    /// refreshed by every committed search page, so recently seen
    /// products resolve here too.
    pub async fn find_cached_by_code(&self, code: &str) -> Option<ProductRecord> {
        self.cache.find_by_code(code).await
    }
}
