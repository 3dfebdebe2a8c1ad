use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix time in whole seconds.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A base:quote trading pair, canonical form "BTC:USDT".
/// Exchange-specific spellings (concatenation, altnames) live at the
/// exchange-client boundary only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self { base: base.to_uppercase(), quote: quote.to_uppercase() }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (base, quote) = s
            .split_once(':')
            .with_context(|| format!("pair without colon: {s}"))?;
        if base.is_empty() || quote.is_empty() {
            bail!("malformed pair: {s}");
        }
        Ok(Self::new(base, quote))
    }

    /// "BTCUSDT" spelling used by the Binance family.
    pub fn concat(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// "BTC-USDT" spelling used by Coinbase and Bitvavo.
    pub fn dashed(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    pub fn reversed(&self) -> Pair {
        Pair { base: self.quote.clone(), quote: self.base.clone() }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.base, self.quote)
    }
}

impl TryFrom<String> for Pair {
    type Error = anyhow::Error;
    fn try_from(s: String) -> Result<Self> {
        Pair::parse(&s)
    }
}

impl From<Pair> for String {
    fn from(p: Pair) -> String {
        p.to_string()
    }
}

/// (exchange, pair, candle-interval) identity of one market clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketId {
    pub exchange: String,
    pub pair: Pair,
    pub interval: String,
}

impl MarketId {
    pub fn new(exchange: &str, pair: Pair, interval: &str) -> Self {
        Self { exchange: exchange.to_string(), pair, interval: interval.to_string() }
    }

    pub fn interval_secs(&self) -> Result<i64> {
        interval_secs(&self.interval)
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exchange, self.pair, self.interval)
    }
}

/// Parse "1m", "4h", "1d" style intervals into seconds.
pub fn interval_secs(interval: &str) -> Result<i64> {
    if interval.len() < 2 {
        bail!("bad interval: {interval}");
    }
    let (num, unit) = interval.split_at(interval.len() - 1);
    let n: i64 = num.parse().with_context(|| format!("bad interval: {interval}"))?;
    let mult = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        _ => bail!("bad interval unit: {interval}"),
    };
    Ok(n * mult)
}

/// OHLCV bar. `time` is the bar start in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Limit,
    StopLoss,
    Market,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Limit => write!(f, "limit"),
            OrderKind::StopLoss => write!(f, "stop_loss"),
            OrderKind::Market => write!(f, "market"),
        }
    }
}

/// One open order mirrored locally. Market orders are synchronous and never
/// appear in `open_orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub kind: OrderKind,
    pub side: Side,
    pub orig_volume: f64,
    pub remaining_volume: f64,
    pub price: f64,
    pub create_time: i64,
    pub expire_time: i64,
    /// None while the order is only known locally (in-flight).
    pub exchange_txid: Option<String>,
}

impl Order {
    pub fn executed_volume(&self) -> f64 {
        self.orig_volume - self.remaining_volume
    }
}

/// Exchange response for a synchronous market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledOrder {
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    /// Net change to the base-asset balance, fee already subtracted where
    /// the fee is base-denominated.
    pub tok_diff: f64,
    /// Net change to the quote-asset balance, fee already subtracted where
    /// the fee is quote-denominated.
    pub cur_diff: f64,
    pub fee: f64,
    pub fee_asset: String,
    pub date: i64,
}

/// Result of polling an open limit/stop order on the exchange.
#[derive(Debug, Clone, Copy)]
pub struct LimitDetails {
    pub exec_volume: f64,
    pub exec_fraction: f64,
    pub price: f64,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub date: i64,
    pub price: f64,
    pub kind: OrderKind,
    pub side: Side,
    pub amount: f64,
    pub fee: f64,
    pub fee_asset: String,
    /// Fractional portfolio change since the previous trade.
    pub change: f64,
}

/// Per-bot portfolio accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMetrics {
    /// (base, quote) balances at bot start.
    pub starting_balance: (f64, f64),
    /// Free quote-asset balance.
    pub cur_balance: f64,
    /// Free base-asset balance.
    pub tok_balance: f64,
    pub portfolio_value: f64,
    pub max_balance: f64,
    pub min_balance: f64,
    pub in_fees: f64,
    pub trade_log: Vec<TradeRecord>,
    /// Local txid -> order.
    pub open_orders: HashMap<String, Order>,
    pub last_trade_attempt: i64,
}

impl UserMetrics {
    pub fn new(tok: f64, cur: f64) -> Self {
        Self {
            starting_balance: (tok, cur),
            cur_balance: cur,
            tok_balance: tok,
            portfolio_value: cur,
            max_balance: cur,
            min_balance: cur,
            in_fees: 0.0,
            trade_log: Vec::new(),
            open_orders: HashMap::new(),
            last_trade_attempt: 0,
        }
    }

    /// Portfolio value: free balances plus open-order reservations.
    /// BUY reservations are valued at the order price, SELL reservations at
    /// the current price.
    pub fn portfolio(&self, current_price: f64) -> f64 {
        let mut v = self.cur_balance + self.tok_balance * current_price;
        for order in self.open_orders.values() {
            v += match order.side {
                Side::Buy => order.remaining_volume * order.price,
                Side::Sell => order.remaining_volume * current_price,
            };
        }
        v
    }

    /// Clamp minor fee-rounding negatives for user-facing values.
    pub fn clamped_balances(&self) -> (f64, f64) {
        (self.tok_balance.max(0.0), self.cur_balance.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossCfg {
    /// Fraction of the starting portfolio below which the bot closes out.
    pub stop: f64,
    pub trailing: bool,
    pub starting_portfolio: f64,
    pub highest_portfolio: f64,
}

impl StopLossCfg {
    /// Effective stop fraction; a trailing stop ratchets up with the
    /// highest portfolio seen.
    pub fn effective_fraction(&self) -> f64 {
        if self.trailing && self.starting_portfolio > 0.0 {
            (self.highest_portfolio / self.starting_portfolio) * self.stop
        } else {
            self.stop
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub user: String,
    pub enabled: bool,
    pub exchange: String,
    pub market: Pair,
    /// Candle interval, e.g. "4h".
    pub candles: String,
    pub strategy: String,
    #[serde(default)]
    pub strategy_params: serde_json::Value,
    pub state: UserMetrics,
    pub stop_loss: Option<StopLossCfg>,
    pub start_time: i64,
    pub stop_time: Option<i64>,
    pub starting_price: f64,
    pub bah_roi: f64,
    pub billing_start_portfolio: f64,
    /// Strategy-opaque serialized state.
    #[serde(default)]
    pub internal_state: Option<String>,
    /// Notifier hooks, consumed by external delivery services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter_tokens: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_tokens: Option<Vec<String>>,
}

impl Bot {
    pub fn market_id(&self) -> MarketId {
        MarketId::new(&self.exchange, self.market.clone(), &self.candles)
    }

    pub fn disable(&mut self, at: i64) {
        self.enabled = false;
        self.stop_time = Some(at);
    }
}

/// Per-market order constraints. Denoms are decimal precisions (fractional
/// digit counts), not tick sizes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Filter {
    pub min_lot: Option<f64>,
    pub min_notional: Option<f64>,
    pub price_denom: Option<u32>,
    pub lot_denom: Option<u32>,
}

/// Last-known price per pair. Conversion approximations only, never sizing.
pub type PriceDict = HashMap<Pair, f64>;

/// Exchange API credentials: `[key, secret, (passphrase)]` per user.
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: secrecy::SecretString,
    pub passphrase: Option<secrecy::SecretString>,
}

impl Credentials {
    pub fn from_parts(parts: &[String]) -> Result<Self> {
        match parts {
            [key, secret] => Ok(Self {
                key: key.clone(),
                secret: secrecy::SecretString::new(secret.clone()),
                passphrase: None,
            }),
            [key, secret, passphrase] => Ok(Self {
                key: key.clone(),
                secret: secrecy::SecretString::new(secret.clone()),
                passphrase: Some(secrecy::SecretString::new(passphrase.clone())),
            }),
            _ => bail!("credentials must be [key, secret, (passphrase)]"),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Stored user record: per-exchange API credentials as raw part lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// exchange name -> [key, secret, (passphrase)].
    #[serde(default)]
    pub api_keys: HashMap<String, Vec<String>>,
}

impl UserProfile {
    pub fn credentials_for(&self, exchange: &str) -> Option<Result<Credentials>> {
        self.api_keys
            .get(exchange)
            .map(|parts| Credentials::from_parts(parts))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub severity: String,
    pub title: String,
    pub body: String,
    pub time: i64,
}

impl Notification {
    pub fn system(title: &str, body: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            severity: "system".into(),
            title: title.into(),
            body: body.into(),
            time: now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_parse_roundtrip() {
        let p = Pair::parse("btc:usdt").unwrap();
        assert_eq!(p.to_string(), "BTC:USDT");
        assert_eq!(p.concat(), "BTCUSDT");
        assert_eq!(p.dashed(), "BTC-USDT");
        assert!(Pair::parse("BTCUSDT").is_err());
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(interval_secs("1m").unwrap(), 60);
        assert_eq!(interval_secs("4h").unwrap(), 14_400);
        assert_eq!(interval_secs("1d").unwrap(), 86_400);
        assert!(interval_secs("4x").is_err());
    }

    #[test]
    fn portfolio_counts_reservations() {
        let mut m = UserMetrics::new(0.0, 100.0);
        m.cur_balance = 50.0;
        m.open_orders.insert(
            "tx1".into(),
            Order {
                kind: OrderKind::Limit,
                side: Side::Buy,
                orig_volume: 1.0,
                remaining_volume: 1.0,
                price: 50.0,
                create_time: 0,
                expire_time: i64::MAX,
                exchange_txid: None,
            },
        );
        // 50 cash + 1 reserved buy at price 50
        assert!((m.portfolio(123.0) - 100.0).abs() < 1e-9);
    }

    fn bot() -> Bot {
        Bot {
            id: "b1".into(),
            user: "u1".into(),
            enabled: true,
            exchange: "binance".into(),
            market: Pair::new("BTC", "USDT"),
            candles: "1h".into(),
            strategy: "rsi".into(),
            strategy_params: serde_json::Value::Null,
            state: UserMetrics::new(0.0, 1.0),
            stop_loss: None,
            start_time: 0,
            stop_time: None,
            starting_price: 1.0,
            bah_roi: 0.0,
            billing_start_portfolio: 1.0,
            internal_state: None,
            twitter_tokens: None,
            telegram_tokens: None,
        }
    }

    #[test]
    fn notifier_tokens_are_optional_on_the_wire() {
        let json = serde_json::to_string(&bot()).unwrap();
        assert!(!json.contains("twitter_tokens"));
        // Records written before the fields existed still load.
        let legacy: Bot = serde_json::from_str(&json).unwrap();
        assert!(legacy.telegram_tokens.is_none());

        let mut with = bot();
        with.telegram_tokens = Some(vec!["tok".into()]);
        let back: Bot = serde_json::from_str(&serde_json::to_string(&with).unwrap()).unwrap();
        assert_eq!(back.telegram_tokens.as_deref(), Some(&["tok".to_string()][..]));
    }

    #[test]
    fn trailing_fraction_ratchets() {
        let sl = StopLossCfg {
            stop: 0.5,
            trailing: true,
            starting_portfolio: 100.0,
            highest_portfolio: 200.0,
        };
        assert!((sl.effective_fraction() - 1.0).abs() < 1e-12);
    }
}
