pub mod binance;
pub mod bitpanda;
pub mod bitvavo;
pub mod cache;
pub mod coinbase;
pub mod filters;
pub mod kraken;
pub mod signer;
pub mod transport;

use crate::types::{Candle, Credentials, Filter, FilledOrder, LimitDetails, Pair, PriceDict, Side};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use transport::Transport;

/// Normalized error taxonomy shared by every exchange client. The engine's
/// recovery policy keys off these kinds, never off raw HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("failed-exchange-auth: {0}")]
    Auth(String),
    #[error("insufficient-balance: {0}")]
    InsufficientBalance(String),
    #[error("failed-exchange-funds: {0}")]
    Funds(String),
    #[error("failed-exchange-ratelimit: {0}")]
    RateLimit(String),
    #[error("failed-exchange-internal: {0}")]
    Internal(String),
    #[error("failed-exchange-call: {0}")]
    Call(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("no-new-candles")]
    NoNewCandles,
}

impl ExchangeError {
    /// Rate-limit errors back off without consuming the bot error budget.
    pub fn is_ratelimit(&self) -> bool {
        matches!(self, ExchangeError::RateLimit(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Auth(_) => "failed-exchange-auth",
            ExchangeError::InsufficientBalance(_) => "insufficient-balance",
            ExchangeError::Funds(_) => "failed-exchange-funds",
            ExchangeError::RateLimit(_) => "failed-exchange-ratelimit",
            ExchangeError::Internal(_) => "failed-exchange-internal",
            ExchangeError::Call(_) => "failed-exchange-call",
            ExchangeError::OrderNotFound(_) => "order-not-found",
            ExchangeError::NoNewCandles => "no-new-candles",
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            ExchangeError::RateLimit(e.to_string())
        } else if e.status().map(|s| s.is_server_error()).unwrap_or(false) {
            ExchangeError::Internal(e.to_string())
        } else {
            ExchangeError::Call(e.to_string())
        }
    }
}

pub type ExResult<T> = Result<T, ExchangeError>;

/// Uniform capability set over heterogeneous exchange REST APIs.
/// Implementations are stateless per call; credentials come in per
/// invocation.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Incremental candle pull starting strictly after `since` (unix
    /// seconds). The still-open candle must already be dropped.
    async fn update_ohlc(&self, pair: &Pair, interval: &str, since: i64) -> ExResult<Vec<Candle>>;

    async fn balance(&self, creds: &Credentials) -> ExResult<HashMap<String, f64>>;

    async fn market_prices(&self) -> ExResult<PriceDict>;

    async fn filters(&self) -> ExResult<HashMap<Pair, Filter>>;

    async fn check_auth(&self, creds: &Credentials) -> bool;

    async fn market_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        side: Side,
        volume: f64,
    ) -> ExResult<FilledOrder>;

    async fn limit_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        side: Side,
        volume: f64,
        price: f64,
        client_order_id: Option<&str>,
    ) -> ExResult<String>;

    async fn stoploss_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        volume: f64,
        stop_price: f64,
        client_order_id: Option<&str>,
    ) -> ExResult<String>;

    async fn limit_details(
        &self,
        creds: &Credentials,
        pair: &Pair,
        txid: &str,
    ) -> ExResult<LimitDetails>;

    async fn cancel_order(&self, creds: &Credentials, pair: &Pair, txid: &str) -> ExResult<()>;

    /// Whether the venue accepts stop-loss orders natively; otherwise the
    /// engine synthesizes the trigger off the candle low.
    fn supports_native_stoploss(&self) -> bool {
        true
    }

    /// Taker fee fraction applied when crediting partial fills.
    fn fee_rate(&self) -> f64 {
        0.001
    }
}

/// Client-assigned order id, used as the local txid on venues that can
/// address orders by client id. The broker/agent tag is hex-encoded into
/// the leading characters so the result is always a valid 32-char simple
/// uuid (Coinbase rejects anything else as a `client_oid`).
pub fn new_client_order_id(broker_tag: Option<&str>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    match broker_tag {
        Some(tag) => {
            let prefix = hex::encode(&tag.as_bytes()[..tag.len().min(4)]);
            format!("{}{}", prefix, &id[prefix.len()..])
        }
        None => id,
    }
}

/// Build the client for a configured exchange name.
pub fn build_exchange(name: &str, transport: Arc<Transport>) -> anyhow::Result<Arc<dyn Exchange>> {
    let ex: Arc<dyn Exchange> = match name.to_lowercase().as_str() {
        "binance" => Arc::new(binance::Binance::new(transport)),
        "kraken" => Arc::new(kraken::Kraken::new(transport)),
        "bitpanda" => Arc::new(bitpanda::BitpandaPro::new(transport)),
        "bitvavo" => Arc::new(bitvavo::Bitvavo::new(transport)),
        "coinbase" => Arc::new(coinbase::CoinbasePro::new(transport)),
        other => anyhow::bail!("unknown exchange: {other}"),
    };
    Ok(ex)
}

/// JSON numbers arrive as strings on most venues; accept either.
pub(crate) fn json_f64(v: &serde_json::Value) -> f64 {
    match v {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub(crate) fn field_f64(obj: &serde_json::Value, key: &str) -> f64 {
    obj.get(key).map(json_f64).unwrap_or(0.0)
}

pub(crate) fn field_str<'a>(obj: &'a serde_json::Value, key: &str) -> &'a str {
    obj.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// Decimal precision implied by a step string like "0.00100000" -> 3.
/// Whole-number steps quantize to integer lots (0 digits).
pub(crate) fn denom_from_step(step: &str) -> Option<u32> {
    let step = step.trim();
    if step.is_empty() || step.parse::<f64>().map(|v| v <= 0.0).unwrap_or(true) {
        return None;
    }
    match step.split_once('.') {
        None => Some(0),
        Some((_, frac)) => {
            let trimmed = frac.trim_end_matches('0');
            Some(trimmed.len() as u32)
        }
    }
}

/// Split a concatenated symbol ("BTCUSDT") into a pair using the known
/// quote-asset suffixes.
pub(crate) fn split_concat_symbol(symbol: &str) -> Option<Pair> {
    const QUOTES: [&str; 8] = ["USDT", "BUSD", "USDC", "TUSD", "BTC", "ETH", "EUR", "USD"];
    for quote in QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(Pair::new(base, quote));
            }
        }
    }
    None
}

/// Drop the still-open bar: anything whose interval has not elapsed yet.
pub(crate) fn drop_open_candle(mut candles: Vec<Candle>, interval_secs: i64, now: i64) -> Vec<Candle> {
    while let Some(last) = candles.last() {
        if last.time + interval_secs > now {
            candles.pop();
        } else {
            break;
        }
    }
    candles
}
