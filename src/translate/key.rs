//! Canonical cache keys.
//! Key: `v1:` + blake3 hex of (content kind | flat text | path mapping | locale | formality).
//! Only allowlisted output fields take part, so extra engine options never
//! fragment the cache, and server and client derive the same key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::fragment::Serialized;

/// Locale assumed when an output spec names none.
pub const BASE_LOCALE: &str = "en-US";

/// Bumped whenever the key material layout changes.
pub const KEY_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Formality {
    #[default]
    Formal,
    Informal,
}

impl Formality {
    pub fn as_str(self) -> &'static str {
        match self {
            Formality::Formal => "formal",
            Formality::Informal => "informal",
        }
    }
}

/// Requested output. Fields beyond `locale` and `formality` reach the engine
/// but are not part of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formality: Option<Formality>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OutputSpec {
    pub fn for_locale(locale: impl Into<String>) -> Self {
        Self {
            locale: Some(locale.into()),
            ..Self::default()
        }
    }

    pub fn with_formality(mut self, formality: Formality) -> Self {
        self.formality = Some(formality);
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Fill a missing locale from `fallback` (e.g. a request's resolved locale).
    pub fn or_locale(mut self, fallback: Option<String>) -> Self {
        if self.locale.is_none() {
            self.locale = fallback;
        }
        self
    }

    pub fn canonical(&self) -> CanonicalSpec {
        CanonicalSpec {
            locale: canonical_locale(self.locale.as_deref().unwrap_or(BASE_LOCALE)),
            formality: self.formality.unwrap_or_default(),
        }
    }
}

/// The allowlisted, defaulted subset of an [`OutputSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalSpec {
    pub locale: String,
    pub formality: Formality,
}

impl CanonicalSpec {
    /// Primary language subtag, e.g. `de` for `de-CH`.
    pub fn language(&self) -> &str {
        self.locale.split('-').next().unwrap_or_default()
    }

    /// Whether the target is the language content is authored in.
    pub fn is_source(&self, source_locale: &str) -> bool {
        let source = canonical_locale(source_locale);
        let source_lang = source.split('-').next().unwrap_or_default();
        self.language() == source_lang
    }
}

/// Case-normalize an IETF tag: language lower, script title, region upper.
/// `_` separators are accepted. A blank tag becomes [`BASE_LOCALE`].
pub fn canonical_locale(tag: &str) -> String {
    let subtags: Vec<&str> = tag
        .split(['-', '_'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let Some((language, rest)) = subtags.split_first() else {
        return BASE_LOCALE.to_string();
    };

    let mut out = language.to_ascii_lowercase();
    for subtag in rest {
        out.push('-');
        let is_alpha = subtag.chars().all(|c| c.is_ascii_alphabetic());
        let is_digit = subtag.chars().all(|c| c.is_ascii_digit());
        if subtag.len() == 4 && is_alpha {
            let mut chars = subtag.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(&chars.as_str().to_ascii_lowercase());
            }
        } else if (subtag.len() == 2 && is_alpha) || (subtag.len() == 3 && is_digit) {
            out.push_str(&subtag.to_ascii_uppercase());
        } else {
            out.push_str(&subtag.to_ascii_lowercase());
        }
    }
    out
}

/// Content addressed by the cache: a plain leaf or a serialized fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    Plain {
        text: String,
    },
    Structured {
        flat_text: String,
        path_mapping: String,
    },
}

impl Content {
    pub fn plain(text: impl Into<String>) -> Self {
        Content::Plain { text: text.into() }
    }

    pub fn flat_text(&self) -> &str {
        match self {
            Content::Plain { text } => text,
            Content::Structured { flat_text, .. } => flat_text,
        }
    }

    /// Empty for plain content.
    pub fn path_mapping(&self) -> &str {
        match self {
            Content::Plain { .. } => "",
            Content::Structured { path_mapping, .. } => path_mapping,
        }
    }

    /// Nothing to translate.
    pub fn is_blank(&self) -> bool {
        self.flat_text().trim().is_empty()
    }

    fn kind(&self) -> &'static str {
        match self {
            Content::Plain { .. } => "plain",
            Content::Structured { .. } => "structured",
        }
    }
}

impl From<Serialized> for Content {
    fn from(s: Serialized) -> Self {
        Content::Structured {
            flat_text: s.flat_text,
            path_mapping: s.path_mapping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute the key. Every field is length-prefixed so boundaries are unambiguous.
    pub fn compute(content: &Content, spec: &CanonicalSpec) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in [
            content.kind(),
            content.flat_text(),
            content.path_mapping(),
            spec.locale.as_str(),
            spec.formality.as_str(),
        ] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        CacheKey(format!("{KEY_VERSION}:{}", hasher.finalize().to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuild from a stored key string.
    pub fn from_stored(raw: String) -> Self {
        CacheKey(raw)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the store needs to address one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationKey {
    pub key: CacheKey,
    pub content: Content,
    pub spec: CanonicalSpec,
}

impl TranslationKey {
    pub fn new(content: Content, spec: &OutputSpec) -> Self {
        let spec = spec.canonical();
        Self {
            key: CacheKey::compute(&content, &spec),
            content,
            spec,
        }
    }
}

/// Lower-case, trim, dedupe and sort usage keys. Blank keys are dropped.
pub fn normalize_usage_keys<S: AsRef<str>>(keys: &[S]) -> BTreeSet<String> {
    keys.iter()
        .map(|k| k.as_ref().trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}
