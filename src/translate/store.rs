//! Persistent cache store contract and an in-memory implementation.
//! One record per cache key. A record without `produced_by` is a placeholder:
//! it claims in-flight work and is never surfaced as a translation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::key::{normalize_usage_keys, CacheKey, CanonicalSpec, Content, TranslationKey};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRecord {
    pub key: CacheKey,
    pub content: Content,
    pub spec: CanonicalSpec,
    pub translated_text: String,
    pub translated_parts: BTreeMap<String, String>,
    /// Engine name; `None` marks a placeholder.
    pub produced_by: Option<String>,
    pub usage_keys: BTreeSet<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

impl TranslationRecord {
    pub fn placeholder(key: &TranslationKey, now: i64) -> Self {
        Self {
            key: key.key.clone(),
            content: key.content.clone(),
            spec: key.spec.clone(),
            translated_text: String::new(),
            translated_parts: BTreeMap::new(),
            produced_by: None,
            usage_keys: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.produced_by.is_none()
    }
}

/// Outcome of the mutual-exclusion primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveResult {
    /// This caller owns the fill.
    Created,
    /// A record already exists; someone else owns (or finished) the fill.
    AlreadyExists,
}

/// A real translation written back by a fill.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub parts: BTreeMap<String, String>,
    pub produced_by: String,
    pub usage_keys: BTreeSet<String>,
}

/// Durable key -> record storage. Implementations must make `reserve` and
/// `reclaim_stale` atomic so exactly one concurrent caller wins.
pub trait CacheStore: Send + Sync {
    /// Most recent record for the exact content and canonical spec.
    fn lookup(&self, key: &TranslationKey) -> Result<Option<TranslationRecord>, StoreError>;

    /// Create a placeholder if no record exists.
    fn reserve(&self, key: &TranslationKey) -> Result<ReserveResult, StoreError>;

    /// Update-or-create the record with a real translation.
    fn complete(&self, key: &TranslationKey, completion: &Completion) -> Result<(), StoreError>;

    /// Set union into `usage_keys` (case-insensitive). No-op without a record.
    fn merge_keys(&self, key: &CacheKey, keys: &BTreeSet<String>) -> Result<(), StoreError>;

    /// Delete the key's record only if it is still a placeholder.
    fn prune_empty(&self, key: &CacheKey) -> Result<usize, StoreError>;

    /// Refresh a placeholder untouched for at least `older_than`. Returns true
    /// for the single caller that took it over.
    fn reclaim_stale(&self, key: &CacheKey, older_than: Duration) -> Result<bool, StoreError>;

    /// Completed records tagged with any of `keys`.
    fn records_for_usage_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<TranslationRecord>, StoreError>;

    /// Delete every placeholder untouched for at least `older_than`.
    fn prune_stale_placeholders(&self, older_than: Duration) -> Result<usize, StoreError>;
}

/// Current time as Unix timestamp (milliseconds).
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub(crate) fn cutoff_millis(older_than: Duration) -> i64 {
    now_millis() - older_than.as_millis() as i64
}

/// In-process store. Atomic under its lock, lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<CacheKey, TranslationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryStore {
    fn lookup(&self, key: &TranslationKey) -> Result<Option<TranslationRecord>, StoreError> {
        let records = self.records.lock();
        Ok(records
            .get(&key.key)
            .filter(|r| r.content == key.content && r.spec == key.spec)
            .cloned())
    }

    fn reserve(&self, key: &TranslationKey) -> Result<ReserveResult, StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&key.key) {
            return Ok(ReserveResult::AlreadyExists);
        }
        records.insert(key.key.clone(), TranslationRecord::placeholder(key, now_millis()));
        Ok(ReserveResult::Created)
    }

    fn complete(&self, key: &TranslationKey, completion: &Completion) -> Result<(), StoreError> {
        let now = now_millis();
        let mut records = self.records.lock();
        let record = records
            .entry(key.key.clone())
            .or_insert_with(|| TranslationRecord::placeholder(key, now));
        record.translated_text = completion.text.clone();
        record.translated_parts = completion.parts.clone();
        record.produced_by = Some(completion.produced_by.clone());
        record
            .usage_keys
            .extend(normalize_usage_keys(&completion.usage_keys.iter().collect::<Vec<_>>()));
        record.updated_at = now;
        Ok(())
    }

    fn merge_keys(&self, key: &CacheKey, keys: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(key) {
            record
                .usage_keys
                .extend(normalize_usage_keys(&keys.iter().collect::<Vec<_>>()));
        }
        Ok(())
    }

    fn prune_empty(&self, key: &CacheKey) -> Result<usize, StoreError> {
        let mut records = self.records.lock();
        match records.get(key) {
            Some(record) if record.is_placeholder() => {
                records.remove(key);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn reclaim_stale(&self, key: &CacheKey, older_than: Duration) -> Result<bool, StoreError> {
        let cutoff = cutoff_millis(older_than);
        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(record) if record.is_placeholder() && record.updated_at <= cutoff => {
                record.updated_at = now_millis();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn records_for_usage_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<TranslationRecord>, StoreError> {
        let records = self.records.lock();
        let mut found: Vec<TranslationRecord> = records
            .values()
            .filter(|r| !r.is_placeholder() && !r.usage_keys.is_disjoint(keys))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    fn prune_stale_placeholders(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = cutoff_millis(older_than);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !(r.is_placeholder() && r.updated_at <= cutoff));
        Ok(before - records.len())
    }
}
