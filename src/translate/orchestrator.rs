//! Read path and background fills.
//! A lookup answers from the store or returns the empty fallback immediately.
//! On a miss the caller that wins `reserve` spawns a detached fill: engine call
//! (bounded by a timeout), validation, `complete`, then `prune_empty`.
//! Fill failures are logged and leave the placeholder; once it is older than
//! the placeholder TTL, one later reader reclaims it and fires a new fill.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::key::{normalize_usage_keys, CacheKey, OutputSpec, TranslationKey};
use super::store::{CacheStore, Completion, ReserveResult};
use super::{EngineRequest, Translation, TranslationEngine};
use crate::error::{EngineError, StoreError};
use crate::metrics::{metric_names, MetricsRegistry};

#[derive(Debug, Clone)]
pub struct FillSettings {
    /// Upper bound on one engine call; exceeding it counts as a failure.
    pub engine_timeout: Duration,
    /// Age after which a placeholder may be reclaimed and refilled.
    pub placeholder_ttl: Duration,
}

impl Default for FillSettings {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_secs(30),
            placeholder_ttl: Duration::from_secs(300),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn CacheStore>,
    engine: Arc<dyn TranslationEngine>,
    metrics: Arc<MetricsRegistry>,
    tasks: TaskTracker,
    settings: FillSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        engine: Arc<dyn TranslationEngine>,
        metrics: Arc<MetricsRegistry>,
        mut settings: FillSettings,
    ) -> Self {
        // A placeholder younger than the fill bound may still have a fill running.
        if settings.placeholder_ttl < settings.engine_timeout {
            warn!(
                ttl_ms = settings.placeholder_ttl.as_millis() as u64,
                timeout_ms = settings.engine_timeout.as_millis() as u64,
                "placeholder ttl below engine timeout, raising it"
            );
            settings.placeholder_ttl = settings.engine_timeout;
        }
        Self {
            store,
            engine,
            metrics,
            tasks: TaskTracker::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Background tasks (fills and key merges) still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Cached translation for `key`, or the empty fallback. Never waits on the
    /// engine and never fails: store errors read as a miss.
    pub fn lookup_or_fill<S: AsRef<str>>(
        &self,
        key: &TranslationKey,
        output: &OutputSpec,
        usage_keys: &[S],
    ) -> Translation {
        if key.content.is_blank() {
            return Translation::default();
        }
        let usage = normalize_usage_keys(usage_keys);

        let timer = self.metrics.timer(metric_names::LOOKUP);
        let found = self.store.lookup(key);
        timer.stop();

        let record = match found {
            Ok(record) => record,
            Err(e) => {
                warn!(code = "STORE_UNAVAILABLE", error = %e, key = %key.key, "lookup failed, serving fallback");
                self.metrics.increment(metric_names::STORE_UNAVAILABLE);
                return Translation::default();
            }
        };

        match record {
            Some(record) if !record.is_placeholder() => {
                self.metrics.increment(metric_names::CACHE_HIT);
                if !usage.is_subset(&record.usage_keys) {
                    self.spawn_merge(key.key.clone(), usage);
                }
                return Translation {
                    text: record.translated_text,
                    parts: record.translated_parts,
                };
            }
            Some(_) => {
                self.metrics.increment(metric_names::CACHE_MISS);
                self.retry_if_stale(key, output, usage);
            }
            None => {
                self.metrics.increment(metric_names::CACHE_MISS);
                self.claim_and_fill(key, output, usage);
            }
        }
        Translation::default()
    }

    fn claim_and_fill(&self, key: &TranslationKey, output: &OutputSpec, usage: BTreeSet<String>) {
        // Without a runtime the fill could never run, so leave the key unclaimed.
        let Some(handle) = runtime_handle() else {
            return;
        };
        match self.store.reserve(key) {
            Ok(ReserveResult::Created) => self.spawn_fill(&handle, key, output, usage),
            Ok(ReserveResult::AlreadyExists) => {
                self.metrics.increment(metric_names::FILL_SKIPPED_IN_FLIGHT);
                debug!(key = %key.key, "fill already claimed");
                self.merge_onto_placeholder(key, usage);
            }
            Err(e) => {
                warn!(code = "STORE_UNAVAILABLE", error = %e, key = %key.key, "reserve failed");
                self.metrics.increment(metric_names::STORE_UNAVAILABLE);
            }
        }
    }

    fn retry_if_stale(&self, key: &TranslationKey, output: &OutputSpec, usage: BTreeSet<String>) {
        let Some(handle) = runtime_handle() else {
            return;
        };
        match self.store.reclaim_stale(&key.key, self.settings.placeholder_ttl) {
            Ok(true) => {
                info!(key = %key.key, "reclaimed stale placeholder, refilling");
                self.spawn_fill(&handle, key, output, usage);
            }
            Ok(false) => {
                self.metrics.increment(metric_names::FILL_SKIPPED_IN_FLIGHT);
                debug!(key = %key.key, "fill in flight");
                self.merge_onto_placeholder(key, usage);
            }
            Err(e) => {
                warn!(code = "STORE_UNAVAILABLE", error = %e, key = %key.key, "reclaim failed");
                self.metrics.increment(metric_names::STORE_UNAVAILABLE);
            }
        }
    }

    fn spawn_fill(
        &self,
        handle: &Handle,
        key: &TranslationKey,
        output: &OutputSpec,
        usage: BTreeSet<String>,
    ) {
        self.metrics.increment(metric_names::FILL_STARTED);
        let fill_id = uuid::Uuid::new_v4();
        let span = info_span!("fill", key = %key.key, %fill_id);
        let job = FillJob {
            store: Arc::clone(&self.store),
            engine: Arc::clone(&self.engine),
            metrics: Arc::clone(&self.metrics),
            timeout: self.settings.engine_timeout,
            key: key.clone(),
            output: output.clone(),
            usage,
        };
        self.tasks.spawn_on(job.run().instrument(span), handle);
    }

    /// Record this caller's usage keys on the in-flight entry so `preload` sees them
    /// once the fill lands.
    fn merge_onto_placeholder(&self, key: &TranslationKey, usage: BTreeSet<String>) {
        if !usage.is_empty() {
            self.spawn_merge(key.key.clone(), usage);
        }
    }

    fn spawn_merge(&self, key: CacheKey, usage: BTreeSet<String>) {
        let Some(handle) = runtime_handle() else {
            return;
        };
        let store = Arc::clone(&self.store);
        self.tasks.spawn_on(
            async move {
                let target = key.clone();
                let merged = blocking(&store, move |store| store.merge_keys(&target, &usage)).await;
                if let Err(e) = merged {
                    warn!(code = "STORE_UNAVAILABLE", error = %e, key = %key, "usage key merge failed");
                }
            },
            &handle,
        );
    }

    /// Wait for every background task spawned so far (and any they race with).
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Close the task tracker for good and wait for in-flight work.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        info!("orchestrator drained");
    }
}

/// Run a store call on the blocking pool; the store holds its lock across SQLite work.
async fn blocking<T, F>(store: &Arc<dyn CacheStore>, op: F) -> Result<T, StoreError>
where
    F: FnOnce(&dyn CacheStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("store task failed: {e}"))))
}

fn runtime_handle() -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            warn!("no async runtime, background fill skipped");
            None
        }
    }
}

/// Everything one detached fill needs; owns no per-request state.
struct FillJob {
    store: Arc<dyn CacheStore>,
    engine: Arc<dyn TranslationEngine>,
    metrics: Arc<MetricsRegistry>,
    timeout: Duration,
    key: TranslationKey,
    output: OutputSpec,
    usage: BTreeSet<String>,
}

impl FillJob {
    async fn run(self) {
        let timer = self.metrics.timer(metric_names::FILL);
        let request = EngineRequest {
            flat_text: self.key.content.flat_text().to_string(),
            path_mapping: self.key.content.path_mapping().to_string(),
            output: self.output.clone(),
        };

        let response = match tokio::time::timeout(self.timeout, self.engine.translate(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout),
        }
        .and_then(|resp| resp.validate(&request).map(|()| resp));

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                warn!(code = e.code(), error = %e, "fill failed, placeholder kept for retry");
                self.metrics.increment(metric_names::FILL_FAILED);
                return;
            }
        };

        let completion = Completion {
            text: response.text,
            parts: response.parts,
            produced_by: self.engine.name().to_string(),
            usage_keys: self.usage,
        };
        let key = self.key.clone();
        let written = blocking(&self.store, move |store| store.complete(&key, &completion)).await;
        if let Err(e) = written {
            warn!(code = "STORE_UNAVAILABLE", error = %e, "fill write-back failed");
            self.metrics.increment(metric_names::FILL_FAILED);
            return;
        }
        let cache_key = self.key.key.clone();
        let pruned = blocking(&self.store, move |store| store.prune_empty(&cache_key)).await;
        if let Err(e) = pruned {
            warn!(code = "STORE_UNAVAILABLE", error = %e, "placeholder prune failed");
        }

        self.metrics.increment(metric_names::FILL_COMPLETED);
        let elapsed = timer.stop();
        info!(elapsed_ms = elapsed.as_millis() as u64, "fill completed");
    }
}
