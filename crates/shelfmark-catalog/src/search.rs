use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use shelfmark_core::{AppConfig, CacheStore, CachedBook, CatalogSource, NormalizedBook};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dedup::{dedup_keys, merge};
use crate::error::{CatalogError, Result};
use crate::normalize::Normalizer;
use crate::relevance::{rank, score};
use crate::sources::CatalogAdapter;
use crate::store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Local cache, then primary, then secondary only if still short.
    #[default]
    Hybrid,
    /// Local cache, then both catalogs concurrently.
    FanOut,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub author: Option<String>,
    pub limit: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            author: None,
            limit,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Store id; present only for hits served from the local cache.
    pub id: Option<Uuid>,
    pub stale: bool,
    pub score: f64,
    #[serde(flatten)]
    pub book: NormalizedBook,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    /// Catalogs that were queried, in order.
    pub consulted: Vec<CatalogSource>,
    pub failures: Vec<String>,
    /// Every consulted catalog failed and only local hits are returned.
    pub degraded: bool,
}

/// Hybrid local/primary/secondary search over injected adapters.
pub struct SearchOrchestrator {
    store: CacheStore,
    primary: Arc<dyn CatalogAdapter>,
    secondary: Arc<dyn CatalogAdapter>,
    normalizer: Normalizer,
    strategy: SearchStrategy,
    min_results: usize,
    request_timeout: Duration,
}

impl SearchOrchestrator {
    pub fn new(
        store: CacheStore,
        primary: Arc<dyn CatalogAdapter>,
        secondary: Arc<dyn CatalogAdapter>,
        normalizer: Normalizer,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            primary,
            secondary,
            normalizer,
            strategy: SearchStrategy::default(),
            min_results: config.search.min_results,
            request_timeout: Duration::from_secs(config.catalogs.request_timeout_secs),
        }
    }

    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let (query, limit) = (request.query.clone(), request.limit);
        let local = store::blocking(&self.store, move |s| s.search_local(&query, limit)).await?;
        let mut outcome = SearchOutcome::default();

        if local.len() >= self.min_results {
            debug!(query = %request.query, local = local.len(), "served from local cache");
            outcome.hits = self.assemble(request, local, Vec::new());
            return Ok(outcome);
        }

        let fetched = match self.strategy {
            SearchStrategy::Hybrid => self.hybrid(request, &local, &mut outcome).await,
            SearchStrategy::FanOut => self.fan_out(request, &mut outcome).await,
        };

        if outcome.failures.len() == outcome.consulted.len() {
            if local.is_empty() {
                return Err(CatalogError::AllSourcesUnavailable {
                    query: request.query.clone(),
                    failures: outcome.failures,
                });
            }
            warn!(query = %request.query, "all catalogs failed, serving local hits only");
            outcome.degraded = true;
        }

        outcome.hits = self.assemble(request, local, fetched);
        Ok(outcome)
    }

    async fn hybrid(
        &self,
        request: &SearchRequest,
        local: &[CachedBook],
        outcome: &mut SearchOutcome,
    ) -> Vec<NormalizedBook> {
        let Some(mut books) = self.fetch(self.primary.as_ref(), request, outcome).await else {
            return self
                .fetch(self.secondary.as_ref(), request, outcome)
                .await
                .unwrap_or_default();
        };

        let have = local.len() + fresh(local, books.clone()).len();
        if have >= self.min_results {
            debug!(query = %request.query, have, "primary sufficient, secondary skipped");
            return books;
        }
        if let Some(more) = self.fetch(self.secondary.as_ref(), request, outcome).await {
            books.extend(more);
        }
        books
    }

    async fn fan_out(&self, request: &SearchRequest, outcome: &mut SearchOutcome) -> Vec<NormalizedBook> {
        let mut primary_outcome = SearchOutcome::default();
        let mut secondary_outcome = SearchOutcome::default();
        let (primary, secondary) = tokio::join!(
            self.fetch(self.primary.as_ref(), request, &mut primary_outcome),
            self.fetch(self.secondary.as_ref(), request, &mut secondary_outcome),
        );
        for part in [primary_outcome, secondary_outcome] {
            outcome.consulted.extend(part.consulted);
            outcome.failures.extend(part.failures);
        }
        primary.into_iter().chain(secondary).flatten().collect()
    }

    /// One catalog query under the request timeout. Failures are recorded and
    /// become `None`. An unreadable response counts as an empty answer, and
    /// malformed records are skipped individually.
    async fn fetch(
        &self,
        adapter: &dyn CatalogAdapter,
        request: &SearchRequest,
        outcome: &mut SearchOutcome,
    ) -> Option<Vec<NormalizedBook>> {
        let source = adapter.source();
        outcome.consulted.push(source);

        let result = timeout(
            self.request_timeout,
            adapter.search(&request.query, request.limit, request.author.as_deref()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(CatalogError::unavailable(
                source,
                format!("timed out after {:?}", self.request_timeout),
            ))
        });

        match result {
            Ok(raws) => Some(
                raws.iter()
                    .filter_map(|raw| match self.normalizer.normalize(raw) {
                        Ok(book) => Some(book),
                        Err(e) => {
                            warn!(%source, error = %e, "dropping record");
                            None
                        }
                    })
                    .collect(),
            ),
            Err(e @ CatalogError::MalformedUpstreamResponse { .. }) => {
                warn!(%source, query = %request.query, error = %e, "unreadable catalog response, treating as no results");
                Some(Vec::new())
            }
            Err(e) => {
                warn!(%source, query = %request.query, error = %e, "catalog search failed");
                outcome.failures.push(e.to_string());
                None
            }
        }
    }

    /// Local hits first (ranked among themselves), then deduplicated fetched
    /// hits that do not collide with a local record, ranked by score.
    fn assemble(&self, request: &SearchRequest, local: Vec<CachedBook>, fetched: Vec<NormalizedBook>) -> Vec<SearchHit> {
        let author = request.author.as_deref();
        let fresh = fresh(&local, fetched);

        let mut local_hits: Vec<SearchHit> = local
            .into_iter()
            .map(|cached| SearchHit {
                id: Some(cached.record.id),
                stale: cached.stale,
                score: score(&cached.record.book, &request.query, author),
                book: cached.record.book,
            })
            .collect();
        local_hits.sort_by(|a, b| b.score.total_cmp(&a.score));

        let fresh_hits = rank(fresh, &request.query, author)
            .into_iter()
            .map(|(book, score)| SearchHit {
                id: None,
                stale: false,
                score,
                book,
            });

        let mut hits = local_hits;
        hits.extend(fresh_hits);
        hits.truncate(request.limit);
        hits
    }
}

/// Deduplicated fetched books minus any that collide with a local record.
fn fresh(local: &[CachedBook], fetched: Vec<NormalizedBook>) -> Vec<NormalizedBook> {
    let local_keys: HashSet<String> = local
        .iter()
        .flat_map(|c| dedup_keys(&c.record.book))
        .collect();
    merge(fetched)
        .into_iter()
        .filter(|b| !dedup_keys(b).iter().any(|k| local_keys.contains(k)))
        .collect()
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed(SearchOutcome),
    /// A newer search from the same session started before this one finished.
    Superseded,
}

/// Per-caller search sequencing: starting a search aborts the previous one, and
/// a completion is only delivered if no newer search has started since.
pub struct SearchSession {
    orchestrator: Arc<SearchOrchestrator>,
    sequence: AtomicU64,
    in_flight: Mutex<Option<AbortHandle>>,
}

impl SearchSession {
    pub fn new(orchestrator: Arc<SearchOrchestrator>) -> Self {
        Self {
            orchestrator,
            sequence: AtomicU64::new(0),
            in_flight: Mutex::new(None),
        }
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(AtomicOrdering::SeqCst)
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SessionOutcome> {
        let (ticket, handle) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            let ticket = self.sequence.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            let orchestrator = Arc::clone(&self.orchestrator);
            let handle = tokio::spawn(async move { orchestrator.search(&request).await });
            if let Some(previous) = in_flight.replace(handle.abort_handle()) {
                previous.abort();
            }
            (ticket, handle)
        };

        let joined = handle.await;
        if self.current_sequence() != ticket {
            debug!(ticket, "search superseded, discarding result");
            return Ok(SessionOutcome::Superseded);
        }
        match joined {
            Ok(result) => result.map(SessionOutcome::Completed),
            Err(e) if e.is_cancelled() => Ok(SessionOutcome::Superseded),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}
