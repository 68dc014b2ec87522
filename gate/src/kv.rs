//! The 4-method KV contract (§6) plus two implementations: an in-memory map
//! for tests and local runs, and a SQLite-backed store for anything that
//! needs to survive a restart.
//!
//! Neither implementation runs a background reaper; expired entries are
//! simply skipped (and opportunistically dropped) the next time they are
//! read, mirroring how Cloudflare Workers KV's eventual-consistency model
//! is treated by callers: you never rely on an entry vanishing exactly on
//! schedule, only on it being gone by the time you next look.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ListResult {
    pub keys: Vec<KeyEntry>,
    pub list_complete: bool,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub expiration_ttl: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    async fn list(&self, opts: ListOptions) -> Result<ListResult, KvError>;
}

struct MemoryEntry {
    value: String,
    expires_at: Option<u64>,
}

/// Process-local KV backed by a sorted map, guarded by a single mutex.
/// Fine for the gate's access pattern: every call is already I/O-shaped
/// (async trait) so lock hold time is microseconds.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().unwrap();
        let expired = matches!(entries.get(key), Some(e) if e.expires_at.is_some_and(|t| t <= now_secs()));
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> Result<(), KvError> {
        let expires_at = opts.expiration_ttl.map(|ttl| now_secs() + ttl);
        self.entries.lock().unwrap().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult, KvError> {
        let now = now_secs();
        let mut entries = self.entries.lock().unwrap();
        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired_keys {
            entries.remove(&key);
        }

        let prefix = opts.prefix.unwrap_or_default();
        let mut matching: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        matching.sort();

        let start = match &opts.cursor {
            Some(cursor) => matching.iter().position(|k| k == cursor).map(|i| i + 1).unwrap_or(0),
            None => 0,
        };
        let limit = opts.limit.unwrap_or(1000);
        let page: Vec<String> = matching.iter().skip(start).take(limit).cloned().collect();
        let list_complete = start + page.len() >= matching.len();
        let cursor = if list_complete { None } else { page.last().cloned() };

        Ok(ListResult {
            keys: page.into_iter().map(|name| KeyEntry { name }).collect(),
            list_complete,
            cursor,
        })
    }
}

/// SQLite-backed KV, for operators who want the proof store to survive a
/// restart without standing up an external KV service.
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let row = sqlx::query("SELECT value, expires_at FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        let expires_at: Option<i64> = row.try_get("expires_at").map_err(|e| KvError::Backend(e.to_string()))?;
        if let Some(exp) = expires_at {
            if (exp as u64) <= now_secs() {
                let _ = self.delete(key).await;
                return Ok(None);
            }
        }
        let value: String = row.try_get("value").map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> Result<(), KvError> {
        let expires_at = opts.expiration_ttl.map(|ttl| (now_secs() + ttl) as i64);
        sqlx::query(
            "INSERT INTO kv (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult, KvError> {
        let now = now_secs() as i64;
        sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        let prefix = opts.prefix.unwrap_or_default();
        let like_pattern = format!("{}%", prefix.replace('%', "\\%"));
        let start_after = opts.cursor.unwrap_or_default();
        let limit = opts.limit.unwrap_or(1000) as i64;

        let rows = sqlx::query(
            "SELECT key FROM kv WHERE key LIKE ? ESCAPE '\\' AND key > ? ORDER BY key LIMIT ?",
        )
        .bind(&like_pattern)
        .bind(&start_after)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KvError::Backend(e.to_string()))?;

        let mut names: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("key").unwrap_or_default())
            .collect();
        let list_complete = names.len() as i64 <= limit;
        if !list_complete {
            names.truncate(limit as usize);
        }
        let cursor = if list_complete { None } else { names.last().cloned() };

        Ok(ListResult {
            keys: names.into_iter().map(|name| KeyEntry { name }).collect(),
            list_complete,
            cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let kv = MemoryKv::new();
        kv.put("proofs:1:abcdef", "{}", PutOptions::default()).await.unwrap();
        assert_eq!(kv.get("proofs:1:abcdef").await.unwrap(), Some("{}".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let kv = MemoryKv::new();
        kv.put(
            "ratelimit:1.2.3.4:0",
            "1",
            PutOptions { expiration_ttl: Some(0) },
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(kv.get("ratelimit:1.2.3.4:0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_respects_prefix_and_pagination() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.put(&format!("proofs:{i}"), "{}", PutOptions::default()).await.unwrap();
        }
        kv.put("metrics:0", "{}", PutOptions::default()).await.unwrap();

        let first = kv
            .list(ListOptions {
                prefix: Some("proofs:".into()),
                cursor: None,
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(first.keys.len(), 2);
        assert!(!first.list_complete);

        let second = kv
            .list(ListOptions {
                prefix: Some("proofs:".into()),
                cursor: first.cursor,
                limit: Some(10),
            })
            .await
            .unwrap();
        assert_eq!(second.keys.len(), 3);
        assert!(second.list_complete);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let kv = MemoryKv::new();
        kv.put("k", "v", PutOptions::default()).await.unwrap();
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
