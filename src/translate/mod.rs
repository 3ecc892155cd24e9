//! Translation cache subsystem.
//! Content is serialized, keyed, looked up in a persistent store and, on a miss,
//! filled in the background by a translation engine. Readers never wait on the engine.

pub mod chat_engine;
pub mod client;
pub mod fragment;
pub mod key;
pub mod orchestrator;
pub mod service;
pub mod sqlite_store;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use key::OutputSpec;

/// A translation as surfaced to callers. Empty `text` means "not available yet,
/// show the original content".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub text: String,
    #[serde(default)]
    pub parts: BTreeMap<String, String>,
}

impl Translation {
    pub fn is_fallback(&self) -> bool {
        self.text.is_empty()
    }
}

/// Request handed to a translation engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineRequest {
    pub flat_text: String,
    pub path_mapping: String,
    pub output: OutputSpec,
}

/// Engine reply in the required `{text, parts}` shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineResponse {
    pub text: String,
    #[serde(default)]
    pub parts: BTreeMap<String, String>,
}

impl EngineResponse {
    /// Check the response against the request it answers.
    pub fn validate(&self, request: &EngineRequest) -> Result<(), EngineError> {
        if self.text.trim().is_empty() {
            return Err(EngineError::Malformed("empty translated text".into()));
        }
        if request.path_mapping.is_empty() {
            if !self.parts.is_empty() {
                return Err(EngineError::Malformed(
                    "parts returned for plain content".into(),
                ));
            }
            return Ok(());
        }

        if self.parts.is_empty() {
            return Err(EngineError::Malformed("missing parts for fragment".into()));
        }
        let ids = fragment::leaf_ids(&request.path_mapping);
        if let Some(unknown) = self.parts.keys().find(|id| !ids.contains(*id)) {
            return Err(EngineError::Malformed(format!("unknown part id `{unknown}`")));
        }
        if !parts_cover_text(&self.text, &self.parts) {
            return Err(EngineError::Malformed(
                "translated text not covered by parts".into(),
            ));
        }
        Ok(())
    }
}

/// Every non-whitespace character of `text` occurs in the concatenated parts
/// at least as often as in `text`.
pub fn parts_cover_text(text: &str, parts: &BTreeMap<String, String>) -> bool {
    let mut available: HashMap<char, usize> = HashMap::new();
    for c in parts.values().flat_map(|p| p.chars()) {
        if !c.is_whitespace() {
            *available.entry(c).or_insert(0) += 1;
        }
    }
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        match available.get_mut(&c) {
            Some(n) if *n > 0 => *n -= 1,
            _ => return false,
        }
    }
    true
}

/// Adapter seam for translation backends.
#[async_trait]
pub trait TranslationEngine: Send + Sync {
    /// Name recorded as `producedBy` on records this engine completes.
    fn name(&self) -> &str;

    async fn translate(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError>;
}
