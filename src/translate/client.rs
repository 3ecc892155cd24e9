//! Client-held mirror of the key -> translation map.
//! Views ask synchronously and get either the cached translation or their own
//! original content. An unseen key is fetched from the orchestrator in the
//! background and re-queried until a fill lands; subscribers are then woken
//! through a version counter so they can re-render.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::fragment::{deserialize, serialize, Node};
use super::key::{CacheKey, Content, OutputSpec, TranslationKey};
use super::orchestrator::Orchestrator;
use super::service::{effective_output, CacheSnapshot, LocaleResolver, TranslateOptions};
use super::Translation;
use crate::config::ClientConfig;
use crate::error::ClientError;

/// Wire payload of a client re-query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub content: Content,
    pub output: OutputSpec,
    #[serde(default)]
    pub usage_keys: Vec<String>,
}

/// The orchestrator as seen from a client.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Translation, ClientError>;
}

/// Same-process access, also the handler body behind an HTTP route.
#[async_trait]
impl RemoteCache for Orchestrator {
    async fn fetch(&self, request: &FetchRequest) -> Result<Translation, ClientError> {
        let key = TranslationKey::new(request.content.clone(), &request.output);
        Ok(self.lookup_or_fill(&key, &request.output, request.usage_keys.as_slice()))
    }
}

/// POSTs a JSON [`FetchRequest`] and expects a JSON [`Translation`].
pub struct HttpRemote {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRemote {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RemoteCache for HttpRemote {
    async fn fetch(&self, request: &FetchRequest) -> Result<Translation, ClientError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status().as_u16()));
        }
        resp.json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

enum Slot {
    Pending,
    Ready(Translation),
}

struct Shared {
    entries: Mutex<LruCache<CacheKey, Slot>>,
    remote: Arc<dyn RemoteCache>,
    locale: Arc<dyn LocaleResolver>,
    source_locale: String,
    config: ClientConfig,
    version: watch::Sender<u64>,
}

impl Shared {
    fn publish(&self, key: CacheKey, translation: Translation) {
        self.entries.lock().put(key, Slot::Ready(translation));
        self.version.send_modify(|v| *v += 1);
    }
}

/// Cheap to clone; clones share one map.
#[derive(Clone)]
pub struct ClientCache {
    shared: Arc<Shared>,
}

impl ClientCache {
    pub fn new(
        remote: Arc<dyn RemoteCache>,
        locale: Arc<dyn LocaleResolver>,
        source_locale: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(LruCache::new(capacity)),
                remote,
                locale,
                source_locale: source_locale.into(),
                config,
                version,
            }),
        }
    }

    /// Version bumps every time a translation arrives.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.version.subscribe()
    }

    /// Seed the map with a server-side preload.
    pub fn hydrate(&self, snapshot: CacheSnapshot) {
        if snapshot.is_empty() {
            return;
        }
        {
            let mut entries = self.shared.entries.lock();
            for (key, translation) in snapshot.entries {
                entries.put(key, Slot::Ready(translation));
            }
        }
        self.shared.version.send_modify(|v| *v += 1);
    }

    /// Translated text, or `text` while unavailable. Never blocks.
    pub fn get_translated_text(&self, text: &str, options: &TranslateOptions) -> String {
        if text.trim().is_empty() {
            return text.to_string();
        }
        let Some(output) = self.target(options) else {
            return text.to_string();
        };
        let key = TranslationKey::new(Content::plain(text), &output);
        match self.lookup(key, output, options) {
            Some(translation) => translation.text,
            None => text.to_string(),
        }
    }

    /// Fragment with translated leaves, or a copy of `fragment` while unavailable.
    pub fn get_translated_fragment(&self, fragment: &Node, options: &TranslateOptions) -> Node {
        let serialized = serialize(fragment);
        if serialized.is_empty() {
            return fragment.clone();
        }
        let Some(output) = self.target(options) else {
            return fragment.clone();
        };
        let key = TranslationKey::new(serialized.into(), &output);
        match self.lookup(key, output, options) {
            Some(translation) => deserialize(&translation.parts, fragment),
            None => fragment.clone(),
        }
    }

    /// `None` when the target is the source language.
    fn target(&self, options: &TranslateOptions) -> Option<OutputSpec> {
        let output = effective_output(&options.output, self.shared.locale.as_ref());
        if output.canonical().is_source(&self.shared.source_locale) {
            None
        } else {
            Some(output)
        }
    }

    fn lookup(
        &self,
        key: TranslationKey,
        output: OutputSpec,
        options: &TranslateOptions,
    ) -> Option<Translation> {
        {
            let mut entries = self.shared.entries.lock();
            match entries.get(&key.key) {
                Some(Slot::Ready(translation)) => return Some(translation.clone()),
                Some(Slot::Pending) => return None,
                None => {
                    entries.put(key.key.clone(), Slot::Pending);
                }
            }
        }

        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime, client fetch skipped");
            self.shared.entries.lock().pop(&key.key);
            return None;
        };
        let request = FetchRequest {
            content: key.content,
            output,
            usage_keys: options.usage_keys.clone(),
        };
        handle.spawn(poll(Arc::clone(&self.shared), key.key, request));
        None
    }
}

/// Re-query until a real translation arrives, then publish it. After
/// `max_polls` empty answers the key is forgotten so a later display retries.
async fn poll(shared: Arc<Shared>, key: CacheKey, request: FetchRequest) {
    let attempts = shared.config.max_polls.max(1);
    for attempt in 1..=attempts {
        match shared.remote.fetch(&request).await {
            Ok(translation) if !translation.is_fallback() => {
                debug!(key = %key, attempt, "client translation arrived");
                shared.publish(key, translation);
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(key = %key, attempt, error = %e, "client fetch failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(shared.config.poll_interval()).await;
        }
    }
    debug!(key = %key, "no translation after polling, forgetting key");
    shared.entries.lock().pop(&key);
}
