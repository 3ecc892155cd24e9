//! lingocache: content-addressed translation cache.
//! Rendered content is keyed by its structure and target locale, served from a
//! persistent store, and filled in the background by a translation engine.

pub mod config;
pub mod error;
pub mod metrics;
pub mod translate;

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::Config;
pub use error::{ClientError, ConfigError, EngineError, Error, StoreError};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use translate::client::{ClientCache, FetchRequest, HttpRemote, RemoteCache};
pub use translate::fragment::Node;
pub use translate::key::{CacheKey, Formality, OutputSpec};
pub use translate::service::{
    CacheSnapshot, FixedLocale, LocaleResolver, TranslateOptions, TranslationService,
};
pub use translate::{Translation, TranslationEngine};

use translate::chat_engine::ChatEngine;
use translate::orchestrator::{FillSettings, Orchestrator};
use translate::sqlite_store::SqliteStore;
use translate::store::CacheStore;

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter))
}

/// Install the global fmt subscriber. `RUST_LOG` overrides `default_filter`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_filter))
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

/// Same as [`init_tracing`] with one JSON object per line.
pub fn init_json_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter(default_filter))
        .with_target(true)
        .with_current_span(true)
        .try_init();
}

/// Everything a host process needs: store, engine, orchestrator, service,
/// plus the periodic stale-placeholder sweep.
pub struct CacheRuntime {
    store: Arc<SqliteStore>,
    orchestrator: Arc<Orchestrator>,
    service: Arc<TranslationService>,
    metrics: Arc<MetricsRegistry>,
    config: Config,
    sweep_cancel: CancellationToken,
    sweep_task: Option<JoinHandle<()>>,
}

impl CacheRuntime {
    /// Open the store at `config.store.path` and the chat engine from `config.engine`.
    pub fn open(config: Config, locale: Arc<dyn LocaleResolver>) -> Result<Self, Error> {
        config.validate()?;
        let engine = Arc::new(ChatEngine::from_config(&config.engine)?);
        Self::with_engine(config, engine, locale)
    }

    /// Like [`CacheRuntime::open`] with a caller-supplied engine.
    pub fn with_engine(
        config: Config,
        engine: Arc<dyn TranslationEngine>,
        locale: Arc<dyn LocaleResolver>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let engine_timeout = config.engine.fill_timeout().ok_or(ConfigError::Invalid {
            field: "engine.timeout_secs",
            reason: "timeout times attempts overflows".into(),
        })?;
        let store = Arc::new(SqliteStore::open(&config.store.path)?);
        let metrics = Arc::new(MetricsRegistry::new());
        let settings = FillSettings {
            engine_timeout,
            placeholder_ttl: config.store.placeholder_ttl(),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            engine.clone(),
            metrics.clone(),
            settings,
        ));
        let service = Arc::new(TranslationService::new(
            orchestrator.clone(),
            locale,
            config.locale.source.clone(),
        ));

        let sweep_cancel = CancellationToken::new();
        let sweep_task = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(sweep_loop(
                store.clone(),
                config.clone(),
                sweep_cancel.clone(),
            ))),
            Err(_) => {
                warn!("no async runtime, stale placeholder sweep disabled");
                None
            }
        };

        info!(
            path = %config.store.path.display(),
            engine = engine.name(),
            source = %config.locale.source,
            "translation cache opened"
        );
        Ok(Self {
            store,
            orchestrator,
            service,
            metrics,
            config,
            sweep_cancel,
            sweep_task,
        })
    }

    /// Load `path` and open.
    pub fn open_path(path: &Path, locale: Arc<dyn LocaleResolver>) -> Result<Self, Error> {
        Self::open(Config::load(path)?, locale)
    }

    pub fn service(&self) -> &Arc<TranslationService> {
        &self.service
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A client cache talking to this runtime in-process.
    pub fn client_cache(&self, locale: Arc<dyn LocaleResolver>) -> ClientCache {
        ClientCache::new(
            self.orchestrator.clone(),
            locale,
            self.config.locale.source.clone(),
            self.config.client.clone(),
        )
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the sweep, wait for in-flight fills, then close the store.
    pub async fn close(self) -> Result<(), Error> {
        let Self {
            store,
            orchestrator,
            service,
            sweep_cancel,
            sweep_task,
            ..
        } = self;

        sweep_cancel.cancel();
        if let Some(task) = sweep_task {
            let _ = task.await;
        }
        orchestrator.shutdown().await;
        drop(service);
        drop(orchestrator);

        match Arc::try_unwrap(store) {
            Ok(store) => store.close()?,
            Err(_) => warn!("store still shared at close, connection closes on last drop"),
        }
        info!("translation cache closed");
        Ok(())
    }
}

async fn sweep_loop(store: Arc<SqliteStore>, config: Config, cancel: CancellationToken) {
    let ttl = config.store.placeholder_ttl();
    let mut ticker = tokio::time::interval(config.store.cleanup_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.prune_stale_placeholders(ttl)).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => info!(removed, "stale placeholders swept"),
                    Ok(Err(e)) => warn!(code = "STORE_UNAVAILABLE", error = %e, "placeholder sweep failed"),
                    Err(e) => warn!(error = %e, "placeholder sweep task failed"),
                }
            }
        }
    }
}
