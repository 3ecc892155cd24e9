//! Stub engines and shared store checks for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{EngineRequest, EngineResponse, TranslationEngine};
use crate::error::EngineError;

enum Behavior {
    Uppercase,
    Fixed(EngineResponse),
    Fail,
}

/// Call-counting engine with a configurable reply and delay.
pub struct StubEngine {
    calls: AtomicUsize,
    delay: Duration,
    behavior: Behavior,
}

impl StubEngine {
    /// Upper-cases every leaf; always a valid response.
    pub fn uppercase() -> Self {
        Self::with(Behavior::Uppercase)
    }

    pub fn fixed(text: &str, parts: &[(&str, &str)]) -> Self {
        Self::with(Behavior::Fixed(EngineResponse {
            text: text.to_string(),
            parts: parts
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }))
    }

    pub fn failing() -> Self {
        Self::with(Behavior::Fail)
    }

    fn with(behavior: Behavior) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            behavior,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranslationEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    async fn translate(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            Behavior::Fixed(resp) => Ok(resp.clone()),
            Behavior::Fail => Err(EngineError::Http("connection refused".into())),
            Behavior::Uppercase => {
                if request.path_mapping.is_empty() {
                    return Ok(EngineResponse {
                        text: request.flat_text.to_uppercase(),
                        parts: BTreeMap::new(),
                    });
                }
                let parts: BTreeMap<String, String> = mapping_leaves(&request.path_mapping)
                    .into_iter()
                    .map(|(id, text)| (id, text.to_uppercase()))
                    .collect();
                let text = parts.values().cloned().collect::<String>();
                Ok(EngineResponse { text, parts })
            }
        }
    }
}

/// `(id, text)` pairs of a path mapping.
pub fn mapping_leaves(path_mapping: &str) -> Vec<(String, String)> {
    static LEAF: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)<(\d+|p[\d.]+)>(.*?)</(?:\d+|p[\d.]+)>").expect("static leaf pattern")
    });
    LEAF.captures_iter(path_mapping)
        .map(|c| (c[1].to_string(), unescape(&c[2])))
        .collect()
}

fn unescape(segment: &str) -> String {
    segment
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Behavior every `CacheStore` implementation must share.
pub mod conformance {
    use std::collections::BTreeSet;
    use std::sync::Barrier;
    use std::time::Duration;

    use crate::translate::key::{Content, OutputSpec, TranslationKey};
    use crate::translate::store::{CacheStore, Completion, ReserveResult};

    pub fn key(text: &str, locale: &str) -> TranslationKey {
        TranslationKey::new(Content::plain(text), &OutputSpec::for_locale(locale))
    }

    pub fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    pub fn completion(text: &str, usage: &[&str]) -> Completion {
        Completion {
            text: text.to_string(),
            parts: Default::default(),
            produced_by: "stub".to_string(),
            usage_keys: keys(usage),
        }
    }

    pub fn reserve_is_create_if_absent(store: &dyn CacheStore) {
        let k = key("Hello", "fr");
        assert_eq!(store.reserve(&k).unwrap(), ReserveResult::Created);
        assert_eq!(store.reserve(&k).unwrap(), ReserveResult::AlreadyExists);
        let record = store.lookup(&k).unwrap().expect("placeholder exists");
        assert!(record.is_placeholder());
        assert!(record.translated_text.is_empty());
    }

    pub fn placeholder_lifecycle_leaves_one_completed_record(store: &dyn CacheStore) {
        let k = key("Hello", "fr");
        assert!(store.lookup(&k).unwrap().is_none());
        assert_eq!(store.reserve(&k).unwrap(), ReserveResult::Created);
        store.complete(&k, &completion("Bonjour", &["Home"])).unwrap();
        assert_eq!(store.prune_empty(&k.key).unwrap(), 0);

        let record = store.lookup(&k).unwrap().expect("completed record");
        assert_eq!(record.produced_by.as_deref(), Some("stub"));
        assert_eq!(record.translated_text, "Bonjour");
        assert_eq!(record.usage_keys, keys(&["home"]));
        assert!(record.updated_at >= record.created_at);
        assert_eq!(store.reserve(&k).unwrap(), ReserveResult::AlreadyExists);
    }

    pub fn merge_keys_is_order_independent(a: &dyn CacheStore, b: &dyn CacheStore) {
        let k = key("Hello", "fr");
        for store in [a, b] {
            store.complete(&k, &completion("Bonjour", &["nav"])).unwrap();
        }
        a.merge_keys(&k.key, &keys(&["Footer", "x"])).unwrap();
        a.merge_keys(&k.key, &keys(&["about", "X"])).unwrap();
        b.merge_keys(&k.key, &keys(&["about", "X"])).unwrap();
        b.merge_keys(&k.key, &keys(&["Footer", "x"])).unwrap();

        let left = a.lookup(&k).unwrap().unwrap().usage_keys;
        let right = b.lookup(&k).unwrap().unwrap().usage_keys;
        assert_eq!(left, right);
        assert_eq!(left, keys(&["about", "footer", "nav", "x"]));
    }

    pub fn prune_empty_keeps_completed_records(store: &dyn CacheStore) {
        let pending = key("pending", "fr");
        let done = key("done", "fr");
        store.reserve(&pending).unwrap();
        store.complete(&done, &completion("fait", &[])).unwrap();

        assert_eq!(store.prune_empty(&pending.key).unwrap(), 1);
        assert_eq!(store.prune_empty(&done.key).unwrap(), 0);
        assert!(store.lookup(&pending).unwrap().is_none());
        assert!(store.lookup(&done).unwrap().is_some());
    }

    pub fn reclaim_only_takes_stale_placeholders(store: &dyn CacheStore) {
        let k = key("Hello", "fr");
        assert!(!store.reclaim_stale(&k.key, Duration::ZERO).unwrap());
        store.reserve(&k).unwrap();
        assert!(!store.reclaim_stale(&k.key, Duration::from_secs(3600)).unwrap());
        assert!(store.reclaim_stale(&k.key, Duration::ZERO).unwrap());

        store.complete(&k, &completion("Bonjour", &[])).unwrap();
        assert!(!store.reclaim_stale(&k.key, Duration::ZERO).unwrap());
    }

    pub fn usage_key_query_returns_completed_matches(store: &dyn CacheStore) {
        let nav = key("Home", "de");
        let footer = key("Imprint", "de");
        let pending = key("Later", "de");
        store.complete(&nav, &completion("Startseite", &["nav"])).unwrap();
        store.complete(&footer, &completion("Impressum", &["footer"])).unwrap();
        store.reserve(&pending).unwrap();
        store.merge_keys(&pending.key, &keys(&["nav"])).unwrap();

        let found = store.records_for_usage_keys(&keys(&["nav"])).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].translated_text, "Startseite");

        let both = store
            .records_for_usage_keys(&keys(&["nav", "footer"]))
            .unwrap();
        assert_eq!(both.len(), 2);
        assert!(store.records_for_usage_keys(&keys(&["none"])).unwrap().is_empty());
    }

    pub fn stale_placeholder_sweep(store: &dyn CacheStore) {
        let pending = key("pending", "fr");
        let done = key("done", "fr");
        store.reserve(&pending).unwrap();
        store.complete(&done, &completion("fait", &[])).unwrap();

        assert_eq!(store.prune_stale_placeholders(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.prune_stale_placeholders(Duration::ZERO).unwrap(), 1);
        assert!(store.lookup(&pending).unwrap().is_none());
        assert!(store.lookup(&done).unwrap().is_some());
    }

    pub fn concurrent_reserve_has_one_winner(store: &dyn CacheStore) {
        let k = key("contended", "ja");
        let barrier = Barrier::new(8);
        let created = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        store.reserve(&k).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|r| *r == ReserveResult::Created)
                .count()
        });
        assert_eq!(created, 1);
    }
}
