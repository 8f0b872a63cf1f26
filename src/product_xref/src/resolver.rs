//! Resilient name resolution: cache, then live source, then placeholder.
//!
//! [`NameResolver::resolve`] never fails. It reports which branch produced the
//! name as a [`Resolution`]:
//! 1. `Cached` when the ledger holds a real (non-placeholder) name that is synced;
//! 2. `Fetched` when the source for the product's feed answered within the retry
//!    budget (the name is written through to the ledger);
//! 3. otherwise the last-known-good cached name, flagged stale, or a
//!    `Placeholder` embedding the product id and the needs-refresh marker.
//!
//! Database work runs on the blocking pool; fetches are bounded by
//! `fetch_timeout`, and a timeout counts as a transient failure.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use diesel::SqliteConnection;
use name_source::{FetchError, FetchedName, NameSource};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    cancel::CancelToken,
    db::Store,
    ledger::{
        CachedAttributes, Identifiers, Ledger, LedgerError, NAME_CACHE_COMPONENT, NameUpdate,
        SourceKind,
    },
    models::xref::{SyncStatus, XrefRecord},
    placeholder::{is_placeholder, placeholder_name},
    retry::{RetryContext, RetryError, RetryPolicy, handle_with_fallback},
};

/// Why resolution fell back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No source registered for the product's feed.
    NoSource,
    NotFound,
    /// Transient failures on every attempt.
    Exhausted,
    Fatal,
    Cancelled,
}

/// Which branch produced a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "branch", rename_all = "snake_case")]
pub enum Resolution {
    Cached {
        name: String,
        brand: Option<String>,
        /// Served as last-known-good after a failed refresh.
        stale: bool,
    },
    Fetched {
        name: String,
        brand: Option<String>,
    },
    Placeholder {
        name: String,
        reason: FallbackReason,
    },
}

impl Resolution {
    pub fn name(&self) -> &str {
        match self {
            Resolution::Cached { name, .. }
            | Resolution::Fetched { name, .. }
            | Resolution::Placeholder { name, .. } => name,
        }
    }

    pub fn into_name(self) -> String {
        match self {
            Resolution::Cached { name, .. }
            | Resolution::Fetched { name, .. }
            | Resolution::Placeholder { name, .. } => name,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Resolution::Placeholder { .. })
    }
}

/// A cached name usable as-is (`fresh`) or only as a fallback.
struct CacheHit {
    name: String,
    brand: Option<String>,
    fresh: bool,
}

impl CacheHit {
    fn from_record(rec: &XrefRecord) -> Option<Self> {
        let name = rec.name.as_deref().filter(|n| !is_placeholder(n))?;
        Some(CacheHit {
            name: name.to_string(),
            brand: rec.brand.clone(),
            fresh: rec.status() == SyncStatus::Synced,
        })
    }
}

pub struct NameResolver {
    store: Store,
    sources: HashMap<SourceKind, Arc<dyn NameSource>>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    cancel: CancelToken,
}

impl NameResolver {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sources: HashMap::new(),
            retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(10),
            cancel: CancelToken::never(),
        }
    }

    /// Registers the live source for products of `kind`, replacing any previous one.
    pub fn with_source(mut self, kind: SourceKind, source: Arc<dyn NameSource>) -> Self {
        self.sources.insert(kind, source);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Token raced against retry backoff sleeps.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Display name for `product_id`; never fails.
    pub async fn get_name(&self, product_id: &str, source: SourceKind) -> String {
        self.resolve(product_id, source).await.into_name()
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, product_id: &str, source: SourceKind) -> Resolution {
        let pid = product_id.trim().to_string();

        let cached = {
            let pid = pid.clone();
            self.with_conn(move |conn| Ok(Ledger::find_by_any(conn, &pid)?))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "cache lookup failed, treating as miss");
                    None
                })
        };
        let hit = cached.as_ref().and_then(CacheHit::from_record);
        if let Some(h) = hit.as_ref().filter(|h| h.fresh) {
            debug!("cache hit");
            return Resolution::Cached {
                name: h.name.clone(),
                brand: h.brand.clone(),
                stale: false,
            };
        }

        let reason = match self.fetch(&pid, source).await {
            Ok(fetched) => {
                self.write_through(&pid, source, &fetched).await;
                return Resolution::Fetched {
                    name: fetched.name,
                    brand: fetched.brand,
                };
            }
            Err(reason) => reason,
        };

        if cached.is_some() && matches!(reason, FallbackReason::NotFound | FallbackReason::Fatal) {
            self.mark_failed(&pid).await;
        }

        match hit {
            Some(h) => {
                info!(?reason, "refresh failed, serving last-known-good name");
                Resolution::Cached {
                    name: h.name,
                    brand: h.brand,
                    stale: true,
                }
            }
            None => {
                info!(?reason, "no usable name, serving placeholder");
                Resolution::Placeholder {
                    name: placeholder_name(&pid),
                    reason,
                }
            }
        }
    }

    async fn fetch(&self, pid: &str, kind: SourceKind) -> Result<FetchedName, FallbackReason> {
        let Some(source) = self.sources.get(&kind) else {
            debug!("no name source registered");
            return Err(FallbackReason::NoSource);
        };
        let ctx = RetryContext::new("resolve_name")
            .with("product_id", pid)
            .with("source", kind.as_str())
            .with("name_source", source.label());
        let timeout = self.fetch_timeout;

        let result = self
            .retry
            .execute(&ctx, &self.store, &self.cancel, |attempt| {
                let source = Arc::clone(source);
                let pid = pid.to_string();
                async move {
                    debug!(attempt, "fetching name");
                    match tokio::time::timeout(timeout, source.fetch_name(&pid)).await {
                        Ok(res) => res,
                        Err(_) => Err(FetchError::Transient(format!(
                            "fetch timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    }
                }
            })
            .await;

        result.map_err(|e| match e {
            RetryError::Cancelled { .. } => FallbackReason::Cancelled,
            RetryError::Exhausted { .. } => FallbackReason::Exhausted,
            RetryError::Fatal {
                last: FetchError::NotFound(_),
                ..
            } => FallbackReason::NotFound,
            RetryError::Fatal { .. } => FallbackReason::Fatal,
        })
    }

    /// Caches `fetched`, creating the ledger record from the feed identifier when
    /// none exists yet. Failures are logged; the caller already has its answer.
    async fn write_through(&self, pid: &str, kind: SourceKind, fetched: &FetchedName) {
        let pid = pid.to_string();
        let name = fetched.name.clone();
        let brand = fetched.brand.clone();
        let res = self
            .with_conn(move |conn| {
                let mut updated = Ledger::update_cached_name(conn, &pid, &name, brand.as_deref())?;
                if !updated {
                    Ledger::upsert(
                        conn,
                        &Identifiers::default().with(kind.column(), pid.as_str()),
                        &CachedAttributes::default(),
                    )?;
                    updated = Ledger::update_cached_name(conn, &pid, &name, brand.as_deref())?;
                }
                Ledger::record_source_sync(conn, NAME_CACHE_COMPONENT, true)?;
                Ok(updated)
            })
            .await;
        match res {
            Ok(true) => debug!("name written through to ledger"),
            Ok(false) => warn!("write-through matched no ledger record"),
            Err(e) => warn!(error = %e, "write-through failed"),
        }
    }

    async fn mark_failed(&self, pid: &str) {
        let pid = pid.to_string();
        if let Err(e) = self
            .with_conn(move |conn| Ok(Ledger::update_sync_status(conn, &pid, SyncStatus::Failed)?))
            .await
        {
            warn!(error = %e, "could not mark record failed");
        }
    }

    /// Writes many resolved names through at once; returns how many records changed.
    ///
    /// A bad item (blank name, database error) is recorded and skipped. Items with
    /// no ledger record are skipped silently.
    pub async fn update_cache_from_api_response(&self, items: Vec<NameUpdate>) -> usize {
        let store = self.store.clone();
        let res = self
            .with_conn(move |conn| {
                let mut updated = 0;
                for item in &items {
                    match Ledger::update_cached_name(
                        conn,
                        &item.product_id,
                        &item.name,
                        item.brand.as_deref(),
                    ) {
                        Ok(true) => updated += 1,
                        Ok(false) => debug!(product_id = %item.product_id, "no ledger record for item"),
                        Err(e) => {
                            let ctx = RetryContext::new("update_cache_from_api_response")
                                .with("product_id", item.product_id.as_str());
                            handle_with_fallback(&ledger_failure(e), &ctx, &store, ());
                        }
                    }
                }
                if updated > 0 {
                    Ledger::record_source_sync(conn, NAME_CACHE_COMPONENT, true)?;
                }
                Ok(updated)
            })
            .await;
        res.unwrap_or_else(|e| {
            warn!(error = %e, "bulk cache update failed");
            0
        })
    }

    /// Demotes names synced more than `max_age` ago to `pending`; they stay cached
    /// as fallback and are refreshed on next resolution.
    pub async fn clear_stale_cache(&self, max_age: chrono::Duration) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - max_age;
        let n = self
            .with_conn(move |conn| Ok(Ledger::demote_stale(conn, cutoff)?))
            .await?;
        info!(demoted = n, "stale cache entries demoted");
        Ok(n)
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.connect()?;
            f(&mut conn)
        })
        .await
        .context("database task panicked")?
    }
}

fn ledger_failure(e: LedgerError) -> anyhow::Error {
    match e {
        LedgerError::Database(db) => anyhow::Error::new(db),
        other => anyhow::anyhow!("invalid input: {other}"),
    }
}
