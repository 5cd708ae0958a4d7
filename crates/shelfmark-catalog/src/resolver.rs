use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shelfmark_core::{
    AppConfig, CacheRecord, CacheStore, CachedBook, IdentityKeys, NormalizedBook, UpsertOptions,
};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::dedup::merge;
use crate::error::{CatalogError, Result};
use crate::normalize::Normalizer;
use crate::sources::{CatalogAdapter, RawRecord};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedFrom {
    /// Fresh cache hit; no upstream call made.
    Cache,
    /// Fetched and written through to the store.
    Upstream,
    /// Upstream unavailable or empty; the stale cached record is served as-is.
    StaleCache,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolved {
    pub record: CacheRecord,
    pub from: ResolvedFrom,
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

struct Fetched {
    book: Option<NormalizedBook>,
    failures: Vec<String>,
    attempted: usize,
}

impl Fetched {
    fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failures.len() == self.attempted
    }
}

/// Identity resolution against the cache with write-through from both catalogs.
pub struct BookResolver {
    store: CacheStore,
    primary: Arc<dyn CatalogAdapter>,
    secondary: Arc<dyn CatalogAdapter>,
    normalizer: Normalizer,
    request_timeout: Duration,
    batch_delay: Duration,
}

impl BookResolver {
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
            request_timeout: Duration::from_secs(config.catalogs.request_timeout_secs),
            batch_delay: Duration::from_millis(config.catalogs.batch_delay_ms),
        }
    }

    /// Serve a fresh cached record, or fetch both catalogs concurrently, merge,
    /// and upsert. `force` refetches fresh records and overwrites curated fields.
    pub async fn resolve(&self, keys: &IdentityKeys, force: bool) -> Result<Resolved> {
        let lookup_keys = keys.clone();
        let cached = store::blocking(&self.store, move |s| s.find_by_identity(&lookup_keys)).await?;
        if let Some(hit) = &cached
            && !hit.stale
            && !force
        {
            return Ok(Resolved {
                record: hit.record.clone(),
                from: ResolvedFrom::Cache,
                stale: false,
            });
        }

        let lookup = with_cached_keys(keys, cached.as_ref());
        let fetched = self.fetch(&lookup).await;
        let all_failed = fetched.all_failed();

        match (fetched.book, cached) {
            (Some(book), _) => {
                let keys = keys.clone();
                let record =
                    store::blocking(&self.store, move |s| s.upsert(&keys, &book, UpsertOptions { force })).await?;
                Ok(Resolved {
                    record,
                    from: ResolvedFrom::Upstream,
                    stale: false,
                })
            }
            (None, Some(hit)) => {
                debug!(id = %hit.record.id, "upstream had nothing, serving cached record");
                Ok(Resolved {
                    record: hit.record,
                    from: ResolvedFrom::StaleCache,
                    stale: hit.stale,
                })
            }
            (None, None) if all_failed => {
                Err(CatalogError::AllSourcesUnavailable {
                    query: describe(&lookup),
                    failures: fetched.failures,
                })
            }
            (None, None) => Err(CatalogError::NotFound {
                catalog: self.primary.source(),
                key: describe(&lookup),
            }),
        }
    }

    /// Explicit list-add of a search hit.
    pub async fn persist(&self, book: &NormalizedBook) -> Result<CacheRecord> {
        let book = book.clone();
        store::blocking(&self.store, move |s| {
            s.upsert(&book.identity_keys(), &book, UpsertOptions::default())
        })
        .await
    }

    /// Refresh up to `limit` stale records, one at a time with a fixed pause
    /// between upstream calls.
    pub async fn refresh_stale(&self, limit: usize) -> Result<RefreshReport> {
        let stale = store::blocking(&self.store, move |s| s.stale_records(limit)).await?;
        let mut report = RefreshReport::default();

        for (i, record) in stale.iter().enumerate() {
            if i > 0 {
                sleep(self.batch_delay).await;
            }
            let keys = record.book.identity_keys();
            let fetched = self.fetch(&keys).await;
            let all_failed = fetched.all_failed();
            match fetched.book {
                Some(book) => match store::blocking(&self.store, move |s| {
                    s.upsert(&keys, &book, UpsertOptions::default())
                })
                .await
                {
                    Ok(_) => report.refreshed += 1,
                    Err(e) => {
                        warn!(id = %record.id, error = %e, "refresh write failed");
                        report.failed += 1;
                    }
                },
                None if all_failed => report.failed += 1,
                None => report.unchanged += 1,
            }
        }

        info!(
            refreshed = report.refreshed,
            unchanged = report.unchanged,
            failed = report.failed,
            "stale refresh finished"
        );
        Ok(report)
    }

    /// Query both catalogs concurrently; each branch's failure is recorded and
    /// treated as an empty result. An unreadable response is a plain miss for
    /// that catalog, not a failure.
    async fn fetch(&self, keys: &IdentityKeys) -> Fetched {
        let secondary_key = keys.secondary_catalog_key.as_deref();
        let isbn = keys.isbn13.as_deref().or(keys.isbn10.as_deref());
        let primary_lookup = match (&keys.primary_catalog_key, isbn) {
            (Some(key), _) => Some(Lookup::Key(key.as_str())),
            (None, Some(isbn)) => Some(Lookup::Isbn(isbn)),
            (None, None) => None,
        };
        let secondary_lookup = match (isbn, secondary_key) {
            (Some(isbn), _) => Some(Lookup::Isbn(isbn)),
            (None, Some(key)) => Some(Lookup::Key(key)),
            (None, None) => None,
        };

        let (primary, secondary) = tokio::join!(
            self.lookup(self.primary.as_ref(), primary_lookup),
            self.lookup(self.secondary.as_ref(), secondary_lookup),
        );

        let mut fetched = Fetched {
            book: None,
            failures: Vec::new(),
            attempted: 0,
        };
        let mut candidates = Vec::new();
        for (source, result) in [(self.primary.source(), primary), (self.secondary.source(), secondary)] {
            match result {
                None => {}
                Some(Ok(None)) => fetched.attempted += 1,
                Some(Ok(Some(raw))) => {
                    fetched.attempted += 1;
                    match self.normalizer.normalize(&raw) {
                        Ok(book) => candidates.push(book),
                        Err(e) => warn!(%source, error = %e, "dropping record"),
                    }
                }
                Some(Err(e @ CatalogError::MalformedUpstreamResponse { .. })) => {
                    fetched.attempted += 1;
                    warn!(%source, error = %e, "unreadable catalog response, treating as not found");
                }
                Some(Err(e)) => {
                    fetched.attempted += 1;
                    warn!(%source, error = %e, "catalog lookup failed");
                    fetched.failures.push(e.to_string());
                }
            }
        }
        fetched.book = merge(candidates).into_iter().next();
        fetched
    }

    async fn lookup(&self, adapter: &dyn CatalogAdapter, lookup: Option<Lookup<'_>>) -> Option<Result<Option<RawRecord>>> {
        let lookup = lookup?;
        let source = adapter.source();
        let call = async {
            match lookup {
                Lookup::Key(key) => adapter.get_by_identity(key).await,
                Lookup::Isbn(isbn) => adapter.search_by_isbn(isbn).await,
            }
        };
        Some(timeout(self.request_timeout, call).await.unwrap_or_else(|_| {
            Err(CatalogError::unavailable(source, format!("timed out after {:?}", self.request_timeout)))
        }))
    }
}

#[derive(Clone, Copy)]
enum Lookup<'a> {
    Key(&'a str),
    Isbn(&'a str),
}

fn with_cached_keys(keys: &IdentityKeys, cached: Option<&CachedBook>) -> IdentityKeys {
    let Some(cached) = cached else {
        return keys.clone();
    };
    let book = &cached.record.book;
    IdentityKeys {
        isbn13: keys.isbn13.clone().or_else(|| book.isbn13.clone()),
        isbn10: keys.isbn10.clone().or_else(|| book.isbn10.clone()),
        primary_catalog_key: keys
            .primary_catalog_key
            .clone()
            .or_else(|| book.primary_catalog_key.clone()),
        secondary_catalog_key: keys
            .secondary_catalog_key
            .clone()
            .or_else(|| book.secondary_catalog_key.clone()),
    }
}

fn describe(keys: &IdentityKeys) -> String {
    keys.ordered()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
