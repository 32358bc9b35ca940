//! Namespaced key-value persistence.
//!
//! Values are stored as serialized JSON in the SQLite `kv` table under
//! `<prefix>:<key>`, so several clients (or unrelated data) can share one
//! database file without colliding. A short-lived in-memory cache keeps
//! recently read or written values to avoid re-reading and re-parsing them.
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use ai_tutor::storage::Storage;
//! use std::time::Duration;
//!
//! let storage = Storage::open_path("./data/tutor.sqlite".as_ref(), "ai_tutor", Duration::from_secs(5)).await?;
//! storage.set("lastTopic", &"sound").await?;
//! let topic: Option<String> = storage.get("lastTopic").await?;
//! assert_eq!(topic.as_deref(), Some("sound"));
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::db;
use crate::listeners::lock;
use crate::migrate;

struct Cached {
    value: Value,
    expires_at: Instant,
}

pub struct Storage {
    pool: SqlitePool,
    prefix: String,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, Cached>>,
}

impl Storage {
    /// Open (creating if needed) the store configured in `[storage]`.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_path(
            &config.storage.path,
            &config.storage.prefix,
            Duration::from_millis(config.storage.cache_ttl_ms),
        )
        .await
    }

    pub async fn open_path(path: &Path, prefix: &str, cache_ttl: Duration) -> Result<Self> {
        let pool = db::connect_path(path)
            .await
            .with_context(|| format!("Failed to open local store: {}", path.display()))?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self {
            pool,
            prefix: prefix.to_string(),
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Half-open key range `[prefix:, prefix;)` covering exactly this
    /// namespace. SQLite compares TEXT bytewise, so this holds for any
    /// prefix, including non-ASCII ones.
    fn namespace_range(&self) -> (String, String) {
        (self.full_key(""), format!("{};", self.prefix))
    }

    fn cache_put(&self, full_key: String, value: Value) {
        if self.cache_ttl.is_zero() {
            return;
        }
        lock(&self.cache).insert(
            full_key,
            Cached {
                value,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }

    fn cache_get(&self, full_key: &str) -> Option<Value> {
        let mut cache = lock(&self.cache);
        match cache.get(full_key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                cache.remove(full_key);
                None
            }
            None => None,
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let full_key = self.full_key(key);
        let json = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize value for '{}'", key))?;
        let text = serde_json::to_string(&json)?;

        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(&full_key)
        .bind(&text)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.cache_put(full_key, json);
        Ok(())
    }

    /// Read and deserialize `key`. Returns `Ok(None)` when absent and an
    /// error when the stored data does not parse as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.full_key(key);

        let value = match self.cache_get(&full_key) {
            Some(v) => v,
            None => {
                let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
                    .bind(&full_key)
                    .fetch_optional(&self.pool)
                    .await?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let text: String = row.get("value");
                let value: Value = serde_json::from_str(&text)
                    .with_context(|| format!("Corrupt stored value for '{}'", key))?;
                self.cache_put(full_key, value.clone());
                value
            }
        };

        let typed = serde_json::from_value(value)
            .with_context(|| format!("Stored value for '{}' has unexpected shape", key))?;
        Ok(Some(typed))
    }

    /// Like [`get`](Self::get) but never fails: absent or unreadable data
    /// yields `default`.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key).await {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(key, error = %e, "ignoring unreadable stored value");
                default
            }
        }
    }

    /// Returns whether the key existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        lock(&self.cache).remove(&full_key);
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(&full_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Keys in this namespace, without the prefix, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let (start, end) = self.namespace_range();
        let rows = sqlx::query("SELECT key FROM kv WHERE key >= ? AND key < ? ORDER BY key")
            .bind(&start)
            .bind(&end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let key: String = row.get("key");
                key[start.len()..].to_string()
            })
            .collect())
    }

    /// Delete every key in this namespace. Other prefixes are untouched.
    pub async fn clear(&self) -> Result<u64> {
        let (start, end) = self.namespace_range();
        lock(&self.cache).clear();
        let result = sqlx::query("DELETE FROM kv WHERE key >= ? AND key < ?")
            .bind(&start)
            .bind(&end)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    async fn write_raw(&self, key: &str, text: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, 0)")
            .bind(self.full_key(key))
            .bind(text)
            .execute(&self.pool)
            .await?;
        lock(&self.cache).remove(&self.full_key(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir, prefix: &str, ttl: Duration) -> Storage {
        Storage::open_path(&tmp.path().join("store.sqlite"), prefix, ttl)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn roundtrip_json_values() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, "ai_tutor", Duration::ZERO).await;

        let values = vec![
            json!(null),
            json!(true),
            json!(42),
            json!(-3.5),
            json!("text with \"quotes\" and ünïcode"),
            json!([1, "two", {"three": [3]}]),
            json!({"theme": "dark", "nested": {"list": [], "empty": {}}}),
        ];
        for (i, value) in values.iter().enumerate() {
            let key = format!("k{}", i);
            storage.set(&key, value).await.unwrap();
            let back: Value = storage.get(&key).await.unwrap().unwrap();
            assert_eq!(&back, value);
        }
    }

    #[tokio::test]
    async fn cached_and_uncached_reads_agree() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, "ai_tutor", Duration::from_millis(50)).await;
        let value = json!({"autoScroll": false});
        storage.set("prefs", &value).await.unwrap();

        let cached: Value = storage.get("prefs").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let fresh: Value = storage.get("prefs").await.unwrap().unwrap();
        assert_eq!(cached, value);
        assert_eq!(fresh, value);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, "ai_tutor", Duration::ZERO).await;
        let v: Option<String> = storage.get("absent").await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn corrupt_value_errors_but_get_or_defaults() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, "ai_tutor", Duration::ZERO).await;
        storage.write_raw("broken", "{not json").await.unwrap();

        assert!(storage.get::<Value>("broken").await.is_err());
        let v: u32 = storage.get_or("broken", 7).await;
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn prefixes_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let a = open(&tmp, "ai_tutor", Duration::ZERO).await;
        let b = open(&tmp, "aiXtutor", Duration::ZERO).await;

        a.set("one", &1).await.unwrap();
        a.set("two", &2).await.unwrap();
        b.set("one", &100).await.unwrap();

        assert_eq!(a.keys().await.unwrap(), vec!["one", "two"]);
        assert_eq!(b.keys().await.unwrap(), vec!["one"]);

        assert_eq!(a.clear().await.unwrap(), 2);
        assert!(a.keys().await.unwrap().is_empty());
        assert_eq!(b.get::<i32>("one").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn non_ascii_prefix_lists_and_clears() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp, "tütor", Duration::ZERO).await;
        let neighbour = open(&tmp, "tütorX", Duration::ZERO).await;

        store.set("one", &1).await.unwrap();
        store.set("two", &2).await.unwrap();
        neighbour.set("one", &10).await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["one", "two"]);
        assert_eq!(store.clear().await.unwrap(), 2);
        assert_eq!(store.get::<i32>("two").await.unwrap(), None);
        assert_eq!(neighbour.get::<i32>("one").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn remove_reports_existence_and_evicts_cache() {
        let tmp = TempDir::new().unwrap();
        let storage = open(&tmp, "ai_tutor", Duration::from_secs(60)).await;
        storage.set("k", &"v").await.unwrap();
        assert!(storage.remove("k").await.unwrap());
        assert!(!storage.remove("k").await.unwrap());
        assert_eq!(storage.get::<String>("k").await.unwrap(), None);
    }
}
