#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tradefleet::exchange::{ExResult, Exchange, ExchangeError};
use tradefleet::types::{
    now, Candle, Credentials, Filter, FilledOrder, LimitDetails, Pair, PriceDict, Side,
    UserMetrics,
};

pub const MOCK_FEE: f64 = 0.001;

/// Synthetic venue backed by a scripted candle series and a movable spot
/// price. Market orders fill instantly at the spot price with a 0.1% fee
/// (base-denominated on buys, quote-denominated on sells). Limit orders
/// report whatever fill fractions the test scripts per txid.
pub struct MockExchange {
    pub candles: Mutex<HashMap<Pair, Vec<Candle>>>,
    pub spot: Mutex<f64>,
    pub limit_fills: Mutex<HashMap<String, Vec<LimitDetails>>>,
    pub market_order_log: Mutex<Vec<(Pair, Side, f64)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub native_stops: bool,
    pub filters_calls: std::sync::atomic::AtomicUsize,
}

impl MockExchange {
    pub fn new(spot: f64) -> Self {
        Self {
            candles: Mutex::new(HashMap::new()),
            spot: Mutex::new(spot),
            limit_fills: Mutex::new(HashMap::new()),
            market_order_log: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            native_stops: true,
            filters_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn set_spot(&self, price: f64) {
        *self.spot.lock().unwrap() = price;
    }

    pub fn seed_candles(&self, pair: Pair, candles: Vec<Candle>) {
        self.candles.lock().unwrap().insert(pair, candles);
    }

    pub fn script_fill(&self, txid: &str, details: LimitDetails) {
        self.limit_fills
            .lock()
            .unwrap()
            .entry(txid.to_string())
            .or_default()
            .push(details);
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn update_ohlc(&self, pair: &Pair, _interval: &str, since: i64) -> ExResult<Vec<Candle>> {
        let out: Vec<Candle> = self
            .candles
            .lock()
            .unwrap()
            .get(pair)
            .map(|v| v.iter().filter(|c| c.time > since).copied().collect())
            .unwrap_or_default();
        if out.is_empty() {
            return Err(ExchangeError::NoNewCandles);
        }
        Ok(out)
    }

    async fn balance(&self, _: &Credentials) -> ExResult<HashMap<String, f64>> {
        Ok(HashMap::new())
    }

    async fn market_prices(&self) -> ExResult<PriceDict> {
        Ok(PriceDict::new())
    }

    async fn filters(&self) -> ExResult<HashMap<Pair, Filter>> {
        self.filters_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(HashMap::new())
    }

    async fn check_auth(&self, _: &Credentials) -> bool {
        true
    }

    async fn market_order(
        &self,
        _: &Credentials,
        pair: &Pair,
        side: Side,
        volume: f64,
    ) -> ExResult<FilledOrder> {
        let price = *self.spot.lock().unwrap();
        self.market_order_log
            .lock()
            .unwrap()
            .push((pair.clone(), side, volume));

        let fill = match side {
            // Fee taken from the bought base amount.
            Side::Buy => FilledOrder {
                side,
                price,
                volume,
                tok_diff: volume * (1.0 - MOCK_FEE),
                cur_diff: -(volume * price),
                fee: volume * MOCK_FEE,
                fee_asset: pair.base.clone(),
                date: now(),
            },
            // Fee taken from the quote proceeds.
            Side::Sell => FilledOrder {
                side,
                price,
                volume,
                tok_diff: -volume,
                cur_diff: volume * price * (1.0 - MOCK_FEE),
                fee: volume * price * MOCK_FEE,
                fee_asset: pair.quote.clone(),
                date: now(),
            },
        };
        Ok(fill)
    }

    async fn limit_order(
        &self,
        _: &Credentials,
        _: &Pair,
        _: Side,
        _: f64,
        _: f64,
        cid: Option<&str>,
    ) -> ExResult<String> {
        Ok(cid.unwrap_or("mock-limit").to_string())
    }

    async fn stoploss_order(
        &self,
        _: &Credentials,
        _: &Pair,
        _: f64,
        _: f64,
        cid: Option<&str>,
    ) -> ExResult<String> {
        Ok(cid.unwrap_or("mock-stop").to_string())
    }

    async fn limit_details(&self, _: &Credentials, _: &Pair, txid: &str) -> ExResult<LimitDetails> {
        let mut fills = self.limit_fills.lock().unwrap();
        match fills.get_mut(txid) {
            Some(q) if !q.is_empty() => Ok(q.remove(0)),
            _ => Ok(LimitDetails { exec_volume: 0.0, exec_fraction: 0.0, price: 0.0, date: now() }),
        }
    }

    async fn cancel_order(&self, _: &Credentials, _: &Pair, txid: &str) -> ExResult<()> {
        self.cancelled.lock().unwrap().push(txid.to_string());
        Ok(())
    }

    fn supports_native_stoploss(&self) -> bool {
        self.native_stops
    }

    fn fee_rate(&self) -> f64 {
        MOCK_FEE
    }
}

pub fn creds() -> Credentials {
    Credentials::from_parts(&["key".into(), "secret".into()]).unwrap()
}

pub fn metrics(tok: f64, cur: f64) -> UserMetrics {
    UserMetrics::new(tok, cur)
}

/// A closed hourly candle series anchored at a fixed start in the recent
/// past, one bar per step, with the given closes. Because the start is
/// fixed, re-seeding a longer series extends it forward in time.
pub fn hourly_series(closes: &[f64]) -> Vec<Candle> {
    let start = (now() / 3600 - 48) * 3600;
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| Candle {
            time: start + i as i64 * 3600,
            open: *close,
            high: close * 1.01,
            low: close * 0.99,
            close: *close,
            volume: 1.0,
        })
        .collect()
}
