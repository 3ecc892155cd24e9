//! Persistent translation store backed by SQLite.
//! One row per cache key; usage keys live in a side table so merges are
//! plain insert-or-ignore set unions. The primary key on `cache_key` is the
//! unique constraint that makes `reserve` an atomic insert-if-absent.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use super::key::{normalize_usage_keys, CacheKey, CanonicalSpec, Content, Formality, TranslationKey};
use super::store::{
    cutoff_millis, now_millis, CacheStore, Completion, ReserveResult, TranslationRecord,
};
use crate::error::StoreError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS translations (
        cache_key TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        locale TEXT NOT NULL,
        formality TEXT NOT NULL,
        translated_text TEXT NOT NULL DEFAULT '',
        translated_parts TEXT NOT NULL DEFAULT '{}',
        produced_by TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_translations_placeholders
        ON translations(updated_at) WHERE produced_by IS NULL;
    CREATE TABLE IF NOT EXISTS usage_keys (
        cache_key TEXT NOT NULL REFERENCES translations(cache_key) ON DELETE CASCADE,
        usage_key TEXT NOT NULL,
        PRIMARY KEY (cache_key, usage_key)
    );
    CREATE INDEX IF NOT EXISTS idx_usage_keys_usage ON usage_keys(usage_key);
";

const RECORD_COLUMNS: &str = "t.cache_key, t.content, t.locale, t.formality, t.translated_text,
     t.translated_parts, t.produced_by, t.created_at, t.updated_at";

/// SQLite-backed translation store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Columns as read, before JSON/enum decoding.
struct RawRecord {
    cache_key: String,
    content: String,
    locale: String,
    formality: String,
    translated_text: String,
    translated_parts: String,
    produced_by: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            cache_key: row.get(0)?,
            content: row.get(1)?,
            locale: row.get(2)?,
            formality: row.get(3)?,
            translated_text: row.get(4)?,
            translated_parts: row.get(5)?,
            produced_by: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self, usage_keys: BTreeSet<String>) -> Result<TranslationRecord, StoreError> {
        let content: Content =
            serde_json::from_str(&self.content).map_err(|e| StoreError::Decode {
                field: "content",
                reason: e.to_string(),
            })?;
        let translated_parts: BTreeMap<String, String> =
            serde_json::from_str(&self.translated_parts).map_err(|e| StoreError::Decode {
                field: "translated_parts",
                reason: e.to_string(),
            })?;
        let formality = match self.formality.as_str() {
            "formal" => Formality::Formal,
            "informal" => Formality::Informal,
            other => {
                return Err(StoreError::Decode {
                    field: "formality",
                    reason: format!("unknown value `{other}`"),
                })
            }
        };
        Ok(TranslationRecord {
            key: CacheKey::from_stored(self.cache_key),
            content,
            spec: CanonicalSpec {
                locale: self.locale,
                formality,
            },
            translated_text: self.translated_text,
            translated_parts,
            produced_by: self.produced_by,
            usage_keys,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn encode_content(content: &Content) -> Result<String, StoreError> {
    serde_json::to_string(content).map_err(|e| StoreError::Encode {
        field: "content",
        reason: e.to_string(),
    })
}

fn read_usage_keys(conn: &Connection, cache_key: &str) -> Result<BTreeSet<String>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT usage_key FROM usage_keys WHERE cache_key = ?1 ORDER BY usage_key",
    )?;
    let keys = stmt
        .query_map(params![cache_key], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(keys)
}

fn insert_usage_keys(
    conn: &Connection,
    cache_key: &str,
    keys: &BTreeSet<String>,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO usage_keys (cache_key, usage_key)
         SELECT ?1, ?2 WHERE EXISTS (SELECT 1 FROM translations WHERE cache_key = ?1)",
    )?;
    for usage_key in normalize_usage_keys(&keys.iter().collect::<Vec<_>>()) {
        stmt.execute(params![cache_key, usage_key])?;
    }
    Ok(())
}

impl SqliteStore {
    /// Open (or create) the store database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;

        // WAL mode for better concurrent read performance
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), "translation store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Close the underlying connection, surfacing any pending error.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn
            .into_inner()
            .close()
            .map_err(|(_, e)| StoreError::Sqlite(e))?;
        info!("translation store closed");
        Ok(())
    }
}

impl CacheStore for SqliteStore {
    fn lookup(&self, key: &TranslationKey) -> Result<Option<TranslationRecord>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM translations t
                     WHERE t.cache_key = ?1 ORDER BY t.updated_at DESC LIMIT 1"
                ),
                params![key.key.as_str()],
                RawRecord::from_row,
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let usage_keys = read_usage_keys(&conn, &raw.cache_key)?;
        let record = raw.decode(usage_keys)?;
        if record.content != key.content || record.spec != key.spec {
            debug!(key = %key.key, "stored record does not match requested content");
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn reserve(&self, key: &TranslationKey) -> Result<ReserveResult, StoreError> {
        let content = encode_content(&key.content)?;
        let now = now_millis();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO translations
             (cache_key, content, locale, formality, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                key.key.as_str(),
                content,
                key.spec.locale,
                key.spec.formality.as_str(),
                now
            ],
        )?;
        Ok(if inserted == 1 {
            ReserveResult::Created
        } else {
            ReserveResult::AlreadyExists
        })
    }

    fn complete(&self, key: &TranslationKey, completion: &Completion) -> Result<(), StoreError> {
        let content = encode_content(&key.content)?;
        let parts = serde_json::to_string(&completion.parts).map_err(|e| StoreError::Encode {
            field: "translated_parts",
            reason: e.to_string(),
        })?;
        let now = now_millis();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO translations
             (cache_key, content, locale, formality, translated_text, translated_parts,
              produced_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(cache_key) DO UPDATE SET
                translated_text = excluded.translated_text,
                translated_parts = excluded.translated_parts,
                produced_by = excluded.produced_by,
                updated_at = excluded.updated_at",
            params![
                key.key.as_str(),
                content,
                key.spec.locale,
                key.spec.formality.as_str(),
                completion.text,
                parts,
                completion.produced_by,
                now
            ],
        )?;
        insert_usage_keys(&tx, key.key.as_str(), &completion.usage_keys)?;
        tx.commit()?;
        Ok(())
    }

    fn merge_keys(&self, key: &CacheKey, keys: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        insert_usage_keys(&tx, key.as_str(), keys)?;
        tx.commit()?;
        Ok(())
    }

    fn prune_empty(&self, key: &CacheKey) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM translations WHERE cache_key = ?1 AND produced_by IS NULL",
            params![key.as_str()],
        )?;
        Ok(removed)
    }

    fn reclaim_stale(&self, key: &CacheKey, older_than: Duration) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE translations SET updated_at = ?2
             WHERE cache_key = ?1 AND produced_by IS NULL AND updated_at <= ?3",
            params![key.as_str(), now_millis(), cutoff_millis(older_than)],
        )?;
        Ok(updated == 1)
    }

    fn records_for_usage_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<TranslationRecord>, StoreError> {
        let keys = normalize_usage_keys(&keys.iter().collect::<Vec<_>>());
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT {RECORD_COLUMNS} FROM translations t
             JOIN usage_keys u ON u.cache_key = t.cache_key
             WHERE t.produced_by IS NOT NULL AND u.usage_key IN ({placeholders})
             ORDER BY t.cache_key"
        ))?;
        let raws = stmt
            .query_map(params_from_iter(keys.iter()), RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter()
            .map(|raw| {
                let usage_keys = read_usage_keys(&conn, &raw.cache_key)?;
                raw.decode(usage_keys)
            })
            .collect()
    }

    fn prune_stale_placeholders(&self, older_than: Duration) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM translations WHERE produced_by IS NULL AND updated_at <= ?1",
            params![cutoff_millis(older_than)],
        )?;
        if removed > 0 {
            info!(removed, "stale placeholders pruned");
        }
        Ok(removed)
    }
}
