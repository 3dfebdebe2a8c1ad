use crate::persistence::LOCK_TIMEOUT_SECS;
use crate::types::{now, Candle};
use anyhow::{bail, Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_rusqlite::Connection;

/// Durable store backing everything the engine keeps across restarts:
/// namespaced JSON KV, advisory locks, and per-series candle tables.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).await.context("open sqlite")?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await.context("open sqlite")?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|c| {
                c.execute_batch(
                    r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS kv (
  namespace TEXT NOT NULL,
  key TEXT NOT NULL,
  value_json TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS locks (
  namespace TEXT NOT NULL,
  key TEXT NOT NULL,
  holder TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS candles (
  series TEXT NOT NULL,
  time INTEGER NOT NULL,
  open REAL NOT NULL,
  high REAL NOT NULL,
  low REAL NOT NULL,
  close REAL NOT NULL,
  volume REAL NOT NULL,
  PRIMARY KEY (series, time)
);

CREATE TABLE IF NOT EXISTS candle_state (
  series TEXT PRIMARY KEY,
  state_json TEXT NOT NULL
);
"#,
                )?;
                Ok(())
            })
            .await
            .context("init schema")
    }

    pub async fn get<T: DeserializeOwned>(&self, ns: &str, key: &str) -> Result<Option<T>> {
        let ns = ns.to_string();
        let key = key.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |c| {
                let v = c
                    .query_row(
                        "SELECT value_json FROM kv WHERE namespace = ?1 AND key = ?2",
                        params![ns, key],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(v)
            })
            .await
            .context("kv get")?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json).context("kv decode")?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<()> {
        let ns = ns.to_string();
        let key = key.to_string();
        let json = serde_json::to_string(value).context("kv encode")?;
        let ts = now();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO kv (namespace, key, value_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(namespace, key) DO UPDATE SET
                       value_json = excluded.value_json,
                       updated_at = excluded.updated_at",
                    params![ns, key, json, ts],
                )?;
                Ok(())
            })
            .await
            .context("kv put")
    }

    pub async fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let ns = ns.to_string();
        let key = key.to_string();
        self.conn
            .call(move |c| {
                c.execute(
                    "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![ns, key],
                )?;
                Ok(())
            })
            .await
            .context("kv delete")
    }

    pub async fn keys(&self, ns: &str) -> Result<Vec<String>> {
        let ns = ns.to_string();
        self.conn
            .call(move |c| {
                let mut stmt =
                    c.prepare("SELECT key FROM kv WHERE namespace = ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![ns], |r| r.get::<_, String>(0))?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("kv keys")
    }

    /// All decoded records in a namespace. Rows that no longer decode are
    /// skipped rather than failing the whole read.
    pub async fn get_all<T: DeserializeOwned>(&self, ns: &str) -> Result<HashMap<String, T>> {
        let ns = ns.to_string();
        let rows: Vec<(String, String)> = self
            .conn
            .call(move |c| {
                let mut stmt =
                    c.prepare("SELECT key, value_json FROM kv WHERE namespace = ?1")?;
                let rows = stmt.query_map(params![ns], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("kv scan")?;

        let mut out = HashMap::new();
        for (key, json) in rows {
            match serde_json::from_str(&json) {
                Ok(v) => {
                    out.insert(key, v);
                }
                Err(e) => tracing::warn!(key, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    /// Single attempt at the advisory lock. Expired rows are reclaimed
    /// first so a crashed holder cannot wedge the key forever.
    pub async fn try_lock(&self, ns: &str, key: &str, holder: &str) -> Result<bool> {
        let ns = ns.to_string();
        let key = key.to_string();
        let holder = holder.to_string();
        let ts = now();
        self.conn
            .call(move |c| {
                c.execute("DELETE FROM locks WHERE expires_at <= ?1", params![ts])?;
                let r = c.execute(
                    "INSERT INTO locks (namespace, key, holder, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![ns, key, holder, ts + LOCK_TIMEOUT_SECS],
                );
                match r {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .context("try lock")
    }

    /// Acquire with retries; gives up after the lock timeout elapses.
    pub async fn lock(&self, ns: &str, key: &str, holder: &str) -> Result<()> {
        let deadline = now() + LOCK_TIMEOUT_SECS;
        loop {
            if self.try_lock(ns, key, holder).await? {
                return Ok(());
            }
            if now() >= deadline {
                bail!("lock timeout on {ns}/{key}");
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    pub async fn unlock(&self, ns: &str, key: &str, holder: &str) -> Result<()> {
        let ns = ns.to_string();
        let key = key.to_string();
        let holder = holder.to_string();
        self.conn
            .call(move |c| {
                c.execute(
                    "DELETE FROM locks WHERE namespace = ?1 AND key = ?2 AND holder = ?3",
                    params![ns, key, holder],
                )?;
                Ok(())
            })
            .await
            .context("unlock")
    }

    /// Append candles to a series. Duplicate timestamps are ignored so a
    /// replayed batch is harmless.
    pub async fn append_candles(&self, series: &str, candles: &[Candle]) -> Result<usize> {
        let series = series.to_string();
        let candles = candles.to_vec();
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                let mut inserted = 0usize;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO candles
                         (series, time, open, high, low, close, volume)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )?;
                    for k in &candles {
                        inserted += stmt.execute(params![
                            series, k.time, k.open, k.high, k.low, k.close, k.volume
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await
            .context("append candles")
    }

    pub async fn load_candles(&self, series: &str) -> Result<Vec<Candle>> {
        let series = series.to_string();
        self.conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT time, open, high, low, close, volume
                     FROM candles WHERE series = ?1 ORDER BY time ASC",
                )?;
                let rows = stmt.query_map(params![series], |r| {
                    Ok(Candle {
                        time: r.get(0)?,
                        open: r.get(1)?,
                        high: r.get(2)?,
                        low: r.get(3)?,
                        close: r.get(4)?,
                        volume: r.get(5)?,
                    })
                })?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load candles")
    }

    pub async fn last_candle_time(&self, series: &str) -> Result<Option<i64>> {
        let series = series.to_string();
        self.conn
            .call(move |c| {
                let v = c
                    .query_row(
                        "SELECT MAX(time) FROM candles WHERE series = ?1",
                        params![series],
                        |r| r.get::<_, Option<i64>>(0),
                    )
                    .optional()?;
                Ok(v.flatten())
            })
            .await
            .context("last candle time")
    }

    /// Wipe a series before a full rebuild.
    pub async fn clear_candles(&self, series: &str) -> Result<()> {
        let series = series.to_string();
        self.conn
            .call(move |c| {
                c.execute("DELETE FROM candles WHERE series = ?1", params![series])?;
                c.execute(
                    "DELETE FROM candle_state WHERE series = ?1",
                    params![series],
                )?;
                Ok(())
            })
            .await
            .context("clear candles")
    }

    pub async fn put_candle_state(&self, series: &str, state: &serde_json::Value) -> Result<()> {
        let series = series.to_string();
        let json = state.to_string();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO candle_state (series, state_json) VALUES (?1, ?2)
                     ON CONFLICT(series) DO UPDATE SET state_json = excluded.state_json",
                    params![series, json],
                )?;
                Ok(())
            })
            .await
            .context("put candle state")
    }

    pub async fn get_candle_state(&self, series: &str) -> Result<Option<serde_json::Value>> {
        let series = series.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |c| {
                let v = c
                    .query_row(
                        "SELECT state_json FROM candle_state WHERE series = ?1",
                        params![series],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(v)
            })
            .await
            .context("get candle state")?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json).context("state decode")?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NS_BOTS;

    fn bar(time: i64) -> Candle {
        Candle { time, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 3.0 }
    }

    #[tokio::test]
    async fn kv_roundtrip_and_delete() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.put(NS_BOTS, "b1", &vec![1, 2, 3]).await.unwrap();
        let got: Option<Vec<i32>> = store.get(NS_BOTS, "b1").await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));
        assert_eq!(store.keys(NS_BOTS).await.unwrap(), vec!["b1"]);

        store.delete(NS_BOTS, "b1").await.unwrap();
        let got: Option<Vec<i32>> = store.get(NS_BOTS, "b1").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let path = path.to_string_lossy().to_string();

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.put(NS_BOTS, "b1", &"hello".to_string()).await.unwrap();
            store.append_candles("s", &[bar(0)]).await.unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let got: Option<String> = store.get(NS_BOTS, "b1").await.unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
        assert_eq!(store.load_candles("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.put("a", "k", &1i64).await.unwrap();
        store.put("b", "k", &2i64).await.unwrap();
        let a: Option<i64> = store.get("a", "k").await.unwrap();
        let b: Option<i64> = store.get("b", "k").await.unwrap();
        assert_eq!((a, b), (Some(1), Some(2)));
    }

    #[tokio::test]
    async fn advisory_lock_is_exclusive() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(store.try_lock("bots", "b1", "w1").await.unwrap());
        assert!(!store.try_lock("bots", "b1", "w2").await.unwrap());
        store.unlock("bots", "b1", "w1").await.unwrap();
        assert!(store.try_lock("bots", "b1", "w2").await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimable() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        // Plant a lock row that expired in the past.
        let ts = now() - 1;
        store
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO locks (namespace, key, holder, expires_at)
                     VALUES ('bots', 'b1', 'dead', ?1)",
                    params![ts],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.try_lock("bots", "b1", "w2").await.unwrap());
    }

    #[tokio::test]
    async fn candle_series_is_append_only_and_deduped() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let first = store
            .append_candles("binance:BTC:USDT:1h", &[bar(0), bar(3600)])
            .await
            .unwrap();
        assert_eq!(first, 2);
        // Replaying an overlapping batch only lands the new bar.
        let second = store
            .append_candles("binance:BTC:USDT:1h", &[bar(3600), bar(7200)])
            .await
            .unwrap();
        assert_eq!(second, 1);

        let all = store.load_candles("binance:BTC:USDT:1h").await.unwrap();
        assert_eq!(all.iter().map(|c| c.time).collect::<Vec<_>>(), vec![0, 3600, 7200]);
        assert_eq!(
            store.last_candle_time("binance:BTC:USDT:1h").await.unwrap(),
            Some(7200)
        );
    }
}
