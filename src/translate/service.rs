//! Entry points for the rendering layer: translate a leaf, translate a
//! fragment, preload a page's known translations. All of them degrade to the
//! original content whenever a translation is not (yet) available.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::fragment::{deserialize, serialize, Node};
use super::key::{normalize_usage_keys, CacheKey, Content, OutputSpec, TranslationKey};
use super::orchestrator::Orchestrator;
use super::Translation;

/// Resolves the current locale of a request or client.
pub trait LocaleResolver: Send + Sync {
    fn resolve(&self) -> Option<String>;
}

/// Always the same locale.
pub struct FixedLocale(pub String);

impl LocaleResolver for FixedLocale {
    fn resolve(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    pub output: OutputSpec,
    /// Call-site tags recorded on the entry; never part of the key.
    pub usage_keys: Vec<String>,
}

impl TranslateOptions {
    pub fn new(output: OutputSpec) -> Self {
        Self {
            output,
            usage_keys: Vec::new(),
        }
    }

    pub fn with_usage_key(mut self, key: impl Into<String>) -> Self {
        self.usage_keys.push(key.into());
        self
    }
}

/// Translations known for a set of usage keys, keyed by cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: BTreeMap<CacheKey, Translation>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output spec with the locale filled from the resolver when unset.
pub fn effective_output(output: &OutputSpec, resolver: &dyn LocaleResolver) -> OutputSpec {
    output.clone().or_locale(resolver.resolve())
}

pub struct TranslationService {
    orchestrator: Arc<Orchestrator>,
    locale: Arc<dyn LocaleResolver>,
    source_locale: String,
}

impl TranslationService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        locale: Arc<dyn LocaleResolver>,
        source_locale: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            locale,
            source_locale: source_locale.into(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Translated text, or `text` itself.
    pub fn translate_leaf(&self, text: &str, options: &TranslateOptions) -> String {
        if text.trim().is_empty() {
            return text.to_string();
        }
        let output = effective_output(&options.output, self.locale.as_ref());
        if output.canonical().is_source(&self.source_locale) {
            return text.to_string();
        }
        let key = TranslationKey::new(Content::plain(text), &output);
        let translation = self
            .orchestrator
            .lookup_or_fill(&key, &output, options.usage_keys.as_slice());
        if translation.is_fallback() {
            text.to_string()
        } else {
            translation.text
        }
    }

    /// Fragment with translated leaves, or a copy of `fragment`.
    pub fn translate_fragment(&self, fragment: &Node, options: &TranslateOptions) -> Node {
        let serialized = serialize(fragment);
        if serialized.is_empty() {
            return fragment.clone();
        }
        let output = effective_output(&options.output, self.locale.as_ref());
        if output.canonical().is_source(&self.source_locale) {
            return fragment.clone();
        }
        let key = TranslationKey::new(serialized.into(), &output);
        let translation = self
            .orchestrator
            .lookup_or_fill(&key, &output, options.usage_keys.as_slice());
        if translation.is_fallback() {
            fragment.clone()
        } else {
            deserialize(&translation.parts, fragment)
        }
    }

    /// Completed translations tagged with any of `usage_keys`, for hydrating a client.
    pub fn preload<S: AsRef<str>>(&self, usage_keys: &[S]) -> CacheSnapshot {
        let keys = normalize_usage_keys(usage_keys);
        if keys.is_empty() {
            return CacheSnapshot::default();
        }
        match self.orchestrator.store().records_for_usage_keys(&keys) {
            Ok(records) => CacheSnapshot {
                entries: records
                    .into_iter()
                    .map(|r| {
                        (
                            r.key,
                            Translation {
                                text: r.translated_text,
                                parts: r.translated_parts,
                            },
                        )
                    })
                    .collect(),
            },
            Err(e) => {
                warn!(code = "STORE_UNAVAILABLE", error = %e, "preload failed, empty snapshot");
                CacheSnapshot::default()
            }
        }
    }
}
