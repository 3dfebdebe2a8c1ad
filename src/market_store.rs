use crate::exchange::{ExResult, Exchange, ExchangeError};
use crate::persistence::SqliteStore;
use crate::types::{interval_secs, Candle, MarketId};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Append-only OHLCV series for one (exchange, market, interval), persisted
/// in sqlite and mirrored in memory for windowed reads. The interval is
/// fixed per store and cross-checked against the stored series.
pub struct MarketStore {
    pub id: MarketId,
    interval_secs: i64,
    candles: Vec<Candle>,
    /// Rows appended since the last persist call.
    dirty_from: usize,
}

impl MarketStore {
    fn series_key(id: &MarketId) -> String {
        format!("{}:{}:{}", id.exchange, id.pair, id.interval)
    }

    /// Load from sqlite, verifying the stored series. A series that fails
    /// the integrity check is wiped so the next update rebuilds it from
    /// the exchange.
    pub async fn load(store: &SqliteStore, id: MarketId) -> Result<Self> {
        let step = interval_secs(&id.interval)?;
        let key = Self::series_key(&id);
        let candles = store.load_candles(&key).await?;

        if let Err(reason) = Self::verify(&candles, step) {
            tracing::warn!(series = %key, reason, "candle series failed integrity check; rebuilding");
            store.clear_candles(&key).await?;
            return Ok(Self { id, interval_secs: step, candles: Vec::new(), dirty_from: 0 });
        }

        let dirty_from = candles.len();
        Ok(Self { id, interval_secs: step, candles, dirty_from })
    }

    /// Integrity: strictly increasing times, spacing a multiple of the
    /// interval (gaps are fine, regressions and misaligned bars are not).
    fn verify(candles: &[Candle], step: i64) -> Result<(), &'static str> {
        for pair in candles.windows(2) {
            let dt = pair[1].time - pair[0].time;
            if dt <= 0 {
                return Err("non-increasing timestamps");
            }
            if dt % step != 0 {
                return Err("misaligned bar spacing");
            }
        }
        Ok(())
    }

    pub fn interval_secs(&self) -> i64 {
        self.interval_secs
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last_time(&self) -> Option<i64> {
        self.candles.last().map(|c| c.time)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.candles.last().map(|c| c.close)
    }

    /// Pull candles newer than the stored tail and append them. Returns
    /// (new candle count, whether the series advanced).
    pub async fn update(&mut self, exchange: &Arc<dyn Exchange>) -> ExResult<(usize, bool)> {
        let since = self.last_time().unwrap_or(0);
        let fresh = match exchange
            .update_ohlc(&self.id.pair, &self.id.interval, since)
            .await
        {
            Ok(candles) => candles,
            Err(ExchangeError::NoNewCandles) => return Ok((0, false)),
            Err(e) => return Err(e),
        };

        let mut appended = 0usize;
        for c in fresh {
            if c.time <= since {
                continue;
            }
            if let Some(last) = self.candles.last() {
                if c.time <= last.time {
                    continue;
                }
            }
            self.candles.push(c);
            appended += 1;
        }
        Ok((appended, appended > 0))
    }

    /// Last `count` candles ending `offset` bars before the present.
    /// Asking for more history than exists returns what is there.
    pub fn get_window(&self, count: usize, offset: usize) -> &[Candle] {
        let end = self.candles.len().saturating_sub(offset);
        let start = end.saturating_sub(count);
        &self.candles[start..end]
    }

    /// {time -> field} projection for external queries.
    pub fn historical_to_dict(&self, field: &str) -> HashMap<i64, f64> {
        self.candles
            .iter()
            .map(|c| {
                let v = match field {
                    "open" => c.open,
                    "high" => c.high,
                    "low" => c.low,
                    "volume" => c.volume,
                    _ => c.close,
                };
                (c.time, v)
            })
            .collect()
    }

    /// Flush rows appended since the last persist.
    pub async fn persist(&mut self, store: &SqliteStore) -> Result<()> {
        let key = Self::series_key(&self.id);
        let pending = &self.candles[self.dirty_from..];
        if !pending.is_empty() {
            store.append_candles(&key, pending).await?;
        }
        self.dirty_from = self.candles.len();
        let state = serde_json::json!({
            "last_time": self.last_time(),
            "interval_secs": self.interval_secs,
        });
        store.put_candle_state(&key, &state).await?;
        Ok(())
    }
}
