use crate::exchange::signer::sign_hmac_sha256_hex;
use crate::exchange::transport::{map_http_status, Method, RequestSpec, Transport};
use crate::exchange::{
    drop_open_candle, field_f64, field_str, json_f64, split_concat_symbol, ExResult, Exchange,
    ExchangeError,
};
use crate::types::{
    interval_secs, now, Candle, Credentials, Filter, FilledOrder, LimitDetails, Pair, PriceDict,
    Side,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const HOST: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 5_000;
const KLINE_PAGE: usize = 1000;
/// Cursor safety stop: at most this many pages per update.
const MAX_PAGES: usize = 20;

/// Binance-family client: concatenated symbols, HMAC-SHA256 query
/// signatures, `X-MBX-APIKEY` header auth.
pub struct Binance {
    transport: Arc<Transport>,
    host: String,
}

impl Binance {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport, host: HOST.to_string() }
    }

    pub fn with_host(transport: Arc<Transport>, host: &str) -> Self {
        Self { transport, host: host.to_string() }
    }

    fn spec(&self, method: Method, path: &str, weight: u32) -> RequestSpec {
        let base = match method {
            Method::Get => RequestSpec::get(&self.host, path, "binance"),
            Method::Post => RequestSpec::post(&self.host, path, "binance"),
            Method::Delete => RequestSpec::delete(&self.host, path, "binance"),
        };
        base.weight(weight).budget(1200, Duration::from_secs(60))
    }

    /// Signed query: params + timestamp + recvWindow, HMAC appended.
    /// Re-signed on every call.
    fn signed_query(
        &self,
        creds: &Credentials,
        mut params: BTreeMap<String, String>,
    ) -> ExResult<String> {
        params.insert("timestamp".into(), (now() * 1000).to_string());
        params.insert("recvWindow".into(), RECV_WINDOW_MS.to_string());
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let sig = sign_hmac_sha256_hex(&creds.secret, &query)?;
        Ok(format!("{query}&signature={sig}"))
    }

    async fn signed(
        &self,
        creds: &Credentials,
        method: Method,
        path: &str,
        weight: u32,
        params: BTreeMap<String, String>,
    ) -> ExResult<Value> {
        let query = self.signed_query(creds, params)?;
        let spec = self
            .spec(method, path, weight)
            .query(query)
            .header("X-MBX-APIKEY", creds.key.clone());
        let resp = self.transport.request(spec).await?;
        if resp.is_success() {
            return Ok(resp.body);
        }
        Err(map_binance_error(resp.status, &resp.body))
    }

    fn parse_kline(row: &Value) -> Option<Candle> {
        let arr = row.as_array()?;
        Some(Candle {
            time: arr.first()?.as_i64()? / 1000,
            open: json_f64(arr.get(1)?),
            high: json_f64(arr.get(2)?),
            low: json_f64(arr.get(3)?),
            close: json_f64(arr.get(4)?),
            volume: json_f64(arr.get(5)?),
        })
    }
}

/// Refine HTTP errors with Binance's numeric error codes.
fn map_binance_error(status: u16, body: &Value) -> ExchangeError {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
    let msg = field_str(body, "msg").to_string();
    match code {
        -1003 => ExchangeError::RateLimit(msg),
        -2010 if msg.to_lowercase().contains("insufficient") => {
            ExchangeError::InsufficientBalance(msg)
        }
        -2010 => ExchangeError::Funds(msg),
        -2011 | -2013 => ExchangeError::OrderNotFound(msg),
        -2014 | -2015 | -1022 => ExchangeError::Auth(msg),
        _ => map_http_status(status, body),
    }
}

#[async_trait]
impl Exchange for Binance {
    fn name(&self) -> &str {
        "binance"
    }

    async fn update_ohlc(&self, pair: &Pair, interval: &str, since: i64) -> ExResult<Vec<Candle>> {
        let step = interval_secs(interval).map_err(|e| ExchangeError::Call(e.to_string()))?;
        let mut out: Vec<Candle> = Vec::new();
        let mut cursor_ms = (since + 1) * 1000;

        for _ in 0..MAX_PAGES {
            let query = format!(
                "symbol={}&interval={}&startTime={}&limit={}",
                pair.concat(),
                interval,
                cursor_ms,
                KLINE_PAGE
            );
            let spec = self.spec(Method::Get, "/api/v3/klines", 2).query(query);
            let body = self.transport.request_ok(spec).await?;
            let rows = body.as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                break;
            }
            let page_len = rows.len();
            for row in &rows {
                if let Some(c) = Self::parse_kline(row) {
                    cursor_ms = (c.time + 1) * 1000;
                    out.push(c);
                }
            }
            if page_len < KLINE_PAGE {
                break;
            }
        }

        let out = drop_open_candle(out, step, now());
        if out.is_empty() {
            return Err(ExchangeError::NoNewCandles);
        }
        Ok(out)
    }

    async fn balance(&self, creds: &Credentials) -> ExResult<HashMap<String, f64>> {
        let body = self
            .signed(creds, Method::Get, "/api/v3/account", 10, BTreeMap::new())
            .await?;
        let mut balances = HashMap::new();
        for entry in body
            .get("balances")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
        {
            let asset = field_str(entry, "asset").to_string();
            let free = field_f64(entry, "free");
            if free > 0.0 {
                balances.insert(asset, free);
            }
        }
        Ok(balances)
    }

    async fn market_prices(&self) -> ExResult<PriceDict> {
        let spec = self.spec(Method::Get, "/api/v3/ticker/price", 2);
        let body = self.transport.request_ok(spec).await?;
        let mut prices = PriceDict::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            if let Some(pair) = split_concat_symbol(field_str(row, "symbol")) {
                prices.insert(pair, field_f64(row, "price"));
            }
        }
        Ok(prices)
    }

    async fn filters(&self) -> ExResult<HashMap<Pair, Filter>> {
        let spec = self.spec(Method::Get, "/api/v3/exchangeInfo", 20);
        let body = self.transport.request_ok(spec).await?;
        let mut out = HashMap::new();
        for sym in body
            .get("symbols")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
        {
            let Some(pair) = split_concat_symbol(field_str(sym, "symbol")) else {
                continue;
            };
            let mut filter = Filter::default();
            for f in sym.get("filters").and_then(Value::as_array).unwrap_or(&Vec::new()) {
                match field_str(f, "filterType") {
                    "PRICE_FILTER" => {
                        filter.price_denom =
                            crate::exchange::denom_from_step(field_str(f, "tickSize"));
                    }
                    "LOT_SIZE" => {
                        filter.lot_denom =
                            crate::exchange::denom_from_step(field_str(f, "stepSize"));
                        let min_qty = field_f64(f, "minQty");
                        if min_qty > 0.0 {
                            filter.min_lot = Some(min_qty);
                        }
                    }
                    "MIN_NOTIONAL" | "NOTIONAL" => {
                        let min = field_f64(f, "minNotional");
                        if min > 0.0 {
                            filter.min_notional = Some(min);
                        }
                    }
                    _ => {}
                }
            }
            out.insert(pair, filter);
        }
        Ok(out)
    }

    async fn check_auth(&self, creds: &Credentials) -> bool {
        self.balance(creds).await.is_ok()
    }

    async fn market_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        side: Side,
        volume: f64,
    ) -> ExResult<FilledOrder> {
        let mut params = BTreeMap::new();
        params.insert("symbol".into(), pair.concat());
        params.insert("side".into(), side.to_string());
        params.insert("type".into(), "MARKET".into());
        params.insert("quantity".into(), format!("{volume}"));
        params.insert("newOrderRespType".into(), "FULL".into());

        let body = self
            .signed(creds, Method::Post, "/api/v3/order", 1, params)
            .await?;

        let executed = field_f64(&body, "executedQty");
        let quote = field_f64(&body, "cummulativeQuoteQty");
        let price = if executed > 0.0 { quote / executed } else { 0.0 };

        let mut fee = 0.0;
        let mut fee_asset = String::new();
        for fill in body.get("fills").and_then(Value::as_array).unwrap_or(&Vec::new()) {
            fee += field_f64(fill, "commission");
            if fee_asset.is_empty() {
                fee_asset = field_str(fill, "commissionAsset").to_string();
            }
        }

        let (tok_diff, cur_diff) = match side {
            Side::Buy => {
                let base_fee = if fee_asset == pair.base { fee } else { 0.0 };
                (executed - base_fee, -quote)
            }
            Side::Sell => {
                let quote_fee = if fee_asset == pair.quote { fee } else { 0.0 };
                (-executed, quote - quote_fee)
            }
        };

        Ok(FilledOrder {
            side,
            price,
            volume: executed,
            tok_diff,
            cur_diff,
            fee,
            fee_asset,
            date: field_f64(&body, "transactTime") as i64 / 1000,
        })
    }

    async fn limit_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        side: Side,
        volume: f64,
        price: f64,
        client_order_id: Option<&str>,
    ) -> ExResult<String> {
        let mut params = BTreeMap::new();
        params.insert("symbol".into(), pair.concat());
        params.insert("side".into(), side.to_string());
        params.insert("type".into(), "LIMIT".into());
        params.insert("timeInForce".into(), "GTC".into());
        params.insert("quantity".into(), format!("{volume}"));
        params.insert("price".into(), format!("{price}"));
        if let Some(cid) = client_order_id {
            params.insert("newClientOrderId".into(), cid.to_string());
        }

        let body = self
            .signed(creds, Method::Post, "/api/v3/order", 1, params)
            .await?;
        // Echo our own id when we supplied one; cancel/query never has to
        // wait for the server-assigned id.
        Ok(client_order_id
            .map(str::to_string)
            .unwrap_or_else(|| field_f64(&body, "orderId").to_string()))
    }

    async fn stoploss_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        volume: f64,
        stop_price: f64,
        client_order_id: Option<&str>,
    ) -> ExResult<String> {
        let mut params = BTreeMap::new();
        params.insert("symbol".into(), pair.concat());
        params.insert("side".into(), Side::Sell.to_string());
        params.insert("type".into(), "STOP_LOSS".into());
        params.insert("quantity".into(), format!("{volume}"));
        params.insert("stopPrice".into(), format!("{stop_price}"));
        if let Some(cid) = client_order_id {
            params.insert("newClientOrderId".into(), cid.to_string());
        }

        let body = self
            .signed(creds, Method::Post, "/api/v3/order", 1, params)
            .await?;
        Ok(client_order_id
            .map(str::to_string)
            .unwrap_or_else(|| field_f64(&body, "orderId").to_string()))
    }

    async fn limit_details(
        &self,
        creds: &Credentials,
        pair: &Pair,
        txid: &str,
    ) -> ExResult<LimitDetails> {
        let mut params = BTreeMap::new();
        params.insert("symbol".into(), pair.concat());
        params.insert("origClientOrderId".into(), txid.to_string());

        let body = self
            .signed(creds, Method::Get, "/api/v3/order", 4, params)
            .await?;
        let orig = field_f64(&body, "origQty");
        let executed = field_f64(&body, "executedQty");
        let quote = field_f64(&body, "cummulativeQuoteQty");
        let price = if executed > 0.0 {
            quote / executed
        } else {
            field_f64(&body, "price")
        };
        Ok(LimitDetails {
            exec_volume: executed,
            exec_fraction: if orig > 0.0 { executed / orig } else { 0.0 },
            price,
            date: field_f64(&body, "updateTime") as i64 / 1000,
        })
    }

    async fn cancel_order(&self, creds: &Credentials, pair: &Pair, txid: &str) -> ExResult<()> {
        let mut params = BTreeMap::new();
        params.insert("symbol".into(), pair.concat());
        params.insert("origClientOrderId".into(), txid.to_string());

        match self
            .signed(creds, Method::Delete, "/api/v3/order", 1, params)
            .await
        {
            Ok(_) => Ok(()),
            // Already gone server-side counts as cancelled.
            Err(ExchangeError::OrderNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
