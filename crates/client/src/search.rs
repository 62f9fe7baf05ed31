//! Debounced, cancellable, paginated product search.
//!
//! The controller turns a stream of raw filter-change and load-more events
//! into an always-current accumulated result set. Three mechanisms carry
//! the correctness load:
//!
//! - a debounce window collapsing keystroke bursts into one fetch,
//! - a cancellation token per in-flight request, cancelled on supersession,
//! - a monotonic generation counter compared at the single commit point,
//!   so a response issued under an older generation can never overwrite
//!   state owned by a newer one, no matter when it arrives.
//!
//! Source selection happens at fetch time from the monitor's last known
//! status: online goes to the remote catalog, offline to the local cache
//! with equivalent filter semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use almacen_core::{ProductRecord, ResultPage, SearchFilters};

use crate::cache::ProductCache;
use crate::connectivity::ConnectionMonitor;
use crate::remote::{RemoteCatalog, RemoteError};

/// Quiet interval after the last filter change before a fetch is issued.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);
/// Rows fetched per remote page.
const DEFAULT_PAGE_SIZE: u32 = 30;
/// Cap on rows served from the cache; offline results are a single page.
const OFFLINE_RESULT_LIMIT: u32 = 200;

/// State published to the view layer.
///
/// `last_error` carries the most recent recoverable fetch failure and is
/// cleared by the next successful commit.
#[derive(Debug, Clone, Default)]
pub struct SearchSnapshot {
    pub items: Vec<ProductRecord>,
    pub total: u64,
    pub has_more: bool,
    pub loading: bool,
    pub loading_more: bool,
    pub last_error: Option<RemoteError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Reset,
    Append,
}

/// Mutable state of the current search session.
#[derive(Debug)]
struct SessionState {
    filters: SearchFilters,
    next_offset: u32,
    fetching: bool,
    has_more: bool,
    total: u64,
    accumulated: Vec<ProductRecord>,
}

impl SessionState {
    fn empty() -> Self {
        Self {
            filters: SearchFilters::default(),
            next_offset: 0,
            fetching: false,
            has_more: false,
            total: 0,
            accumulated: Vec::new(),
        }
    }
}

/// Debounced, cancellable search over the product catalog.
///
/// Cheap to clone; all clones drive the same session. Event entry points
/// (`on_filter_change`, `on_load_more`) must be called from within the
/// runtime — they spawn the asynchronous work and return immediately.
#[derive(Clone)]
pub struct SearchController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    remote: Arc<dyn RemoteCatalog>,
    cache: ProductCache,
    monitor: ConnectionMonitor,
    page_size: u32,
    /// Generation counter; the highest value is the only session whose
    /// results may commit.
    latest: AtomicU64,
    session: Mutex<SessionState>,
    debounce: Mutex<Option<CancellationToken>>,
    inflight: Mutex<Option<CancellationToken>>,
    snapshot: watch::Sender<SearchSnapshot>,
}

impl SearchController {
    pub fn new(
        remote: Arc<dyn RemoteCatalog>,
        cache: ProductCache,
        monitor: ConnectionMonitor,
    ) -> Self {
        Self::with_page_size(remote, cache, monitor, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(
        remote: Arc<dyn RemoteCatalog>,
        cache: ProductCache,
        monitor: ConnectionMonitor,
        page_size: u32,
    ) -> Self {
        let (snapshot, _) = watch::channel(SearchSnapshot::default());
        Self {
            inner: Arc::new(ControllerInner {
                remote,
                cache,
                monitor,
                page_size: page_size.max(1),
                latest: AtomicU64::new(0),
                session: Mutex::new(SessionState::empty()),
                debounce: Mutex::new(None),
                inflight: Mutex::new(None),
                snapshot,
            }),
        }
    }

    /// Observable result stream for the view layer.
    pub fn results(&self) -> watch::Receiver<SearchSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// The user changed the filter state.
    ///
    /// Empty filters clear the results immediately without touching the
    /// network. Anything else restarts the debounce window; when it
    /// elapses quietly, a fresh session supersedes whatever was in flight
    /// and fetches page one.
    pub fn on_filter_change(&self, filters: SearchFilters) {
        if filters.is_empty() {
            self.inner.cancel_debounce();
            self.inner.clear();
            return;
        }

        let token = self.inner.arm_debounce();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(DEBOUNCE_WINDOW) => {
                    inner.begin_reset(filters, token).await;
                }
            }
        });
    }

    /// The view hit the bottom of the list.
    ///
    /// A no-op while a fetch is in flight, when the source reported the
    /// end of the result set, or when no filters are active — UI misuse
    /// must not corrupt the state machine.
    pub fn on_load_more(&self) {
        let (id, token, filters, offset) = {
            let Ok(mut session) = self.inner.session.lock() else {
                return;
            };
            if session.fetching || !session.has_more || session.filters.is_empty() {
                return;
            }
            session.fetching = true;
            let id = self.inner.next_generation();
            let token = self.inner.arm_inflight();
            (id, token, session.filters.clone(), session.next_offset)
        };

        self.inner.publish_fetching(FetchKind::Append);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner
                .run_fetch(id, filters, offset, FetchKind::Append, token)
                .await;
        });
    }
}

impl ControllerInner {
    /// Start the fetch for a new filter set: new generation, cursor at
    /// zero, previous in-flight request aborted.
    async fn begin_reset(self: &Arc<Self>, filters: SearchFilters, debounce: CancellationToken) {
        let (id, token) = {
            let Ok(mut session) = self.session.lock() else {
                return;
            };
            // The window can be cancelled between the timer firing and
            // this lock: a newer keystroke or a cleared filter box owns
            // the session now.
            if debounce.is_cancelled() {
                return;
            }
            session.filters = filters.clone();
            session.next_offset = 0;
            session.fetching = true;
            let id = self.next_generation();
            (id, self.arm_inflight())
        };

        self.publish_fetching(FetchKind::Reset);
        self.run_fetch(id, filters, 0, FetchKind::Reset, token).await;
    }

    async fn run_fetch(
        &self,
        id: u64,
        filters: SearchFilters,
        offset: u32,
        kind: FetchKind,
        cancel: CancellationToken,
    ) {
        // Last known status, not a fresh probe: a keystroke must not pay
        // for a health check.
        let online = self.monitor.status().status.is_online();

        let outcome = if online {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(generation = id, "fetch superseded, dropping request");
                    return;
                }
                result = self.remote.fetch_page(&filters, offset, self.page_size) => result,
            }
        } else {
            Ok(self.fallback_page(&filters).await)
        };

        match outcome {
            Ok(page) => self.commit(id, kind, offset, page, online).await,
            Err(err) => self.fail(id, err),
        }
    }

    /// Query the local cache with filter semantics equivalent to the
    /// remote catalog's. The cache has no pagination metadata: everything
    /// it matches comes back as one final page.
    async fn fallback_page(&self, filters: &SearchFilters) -> ResultPage {
        let mut items = self.cache.search(&filters.text, OFFLINE_RESULT_LIMIT).await;
        items.retain(|record| filters.matches(record));
        ResultPage::complete(items)
    }

    /// The single commit point. A response whose generation is no longer
    /// the latest is discarded wholesale — it must not even touch the
    /// loading flags, which now belong to a newer session.
    async fn commit(&self, id: u64, kind: FetchKind, offset: u32, page: ResultPage, from_remote: bool) {
        let snapshot = {
            let Ok(mut session) = self.session.lock() else {
                return;
            };
            if self.latest.load(Ordering::SeqCst) != id {
                tracing::debug!(generation = id, "stale response discarded at commit");
                return;
            }

            session.fetching = false;
            // Advance by the received count, pre-dedup; total/has_more are
            // advisory and never reconciled against the accumulated length.
            session.next_offset = offset + page.items.len() as u32;
            session.total = page.total;
            session.has_more = page.has_more;
            match kind {
                FetchKind::Reset => session.accumulated = page.items.clone(),
                FetchKind::Append => merge_page(&mut session.accumulated, page.items.clone()),
            }

            SearchSnapshot {
                items: session.accumulated.clone(),
                total: session.total,
                has_more: session.has_more,
                loading: false,
                loading_more: false,
                last_error: None,
            }
        };

        self.snapshot.send_replace(snapshot);

        if from_remote && !page.items.is_empty() {
            // Opportunistically refresh the offline fallback.
            self.cache.save_all(&page.items).await;
        }
    }

    /// A genuine transport failure: recoverable. Accumulated results stay
    /// intact and the session returns to idle so the same debounce and
    /// load-more paths can retry.
    fn fail(&self, id: u64, err: RemoteError) {
        let snapshot = {
            let Ok(mut session) = self.session.lock() else {
                return;
            };
            if self.latest.load(Ordering::SeqCst) != id {
                return;
            }
            session.fetching = false;

            tracing::warn!(error = %err, "product fetch failed");
            SearchSnapshot {
                items: session.accumulated.clone(),
                total: session.total,
                has_more: session.has_more,
                loading: false,
                loading_more: false,
                last_error: Some(err),
            }
        };

        self.snapshot.send_replace(snapshot);
    }

    /// Empty filters: abandon everything and publish a blank snapshot.
    fn clear(&self) {
        let Ok(mut session) = self.session.lock() else {
            return;
        };
        // Invalidate any response still in flight before wiping state.
        self.latest.fetch_add(1, Ordering::SeqCst);
        self.cancel_inflight();
        *session = SessionState::empty();
        drop(session);

        self.snapshot.send_replace(SearchSnapshot::default());
    }

    fn next_generation(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn cancel_debounce(&self) {
        if let Ok(mut slot) = self.debounce.lock() {
            if let Some(prev) = slot.take() {
                prev.cancel();
            }
        }
    }

    fn arm_debounce(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.debounce.lock() {
            if let Some(prev) = slot.replace(token.clone()) {
                prev.cancel();
            }
        }
        token
    }

    fn cancel_inflight(&self) {
        if let Ok(mut slot) = self.inflight.lock() {
            if let Some(prev) = slot.take() {
                prev.cancel();
            }
        }
    }

    fn arm_inflight(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.inflight.lock() {
            if let Some(prev) = slot.replace(token.clone()) {
                prev.cancel();
            }
        }
        token
    }

    fn publish_fetching(&self, kind: FetchKind) {
        self.snapshot.send_modify(|snap| match kind {
            FetchKind::Reset => snap.loading = true,
            FetchKind::Append => snap.loading_more = true,
        });
    }
}

/// Concatenate an appended page onto the accumulated set.
///
/// A product already present keeps its position but takes the appended
/// page's version (the collection may have mutated between pages); new
/// products append in page order.
fn merge_page(accumulated: &mut Vec<ProductRecord>, page: Vec<ProductRecord>) {
    for item in page {
        match accumulated.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => accumulated.push(item),
        }
    }
}
