use crate::exchange::transport::{map_http_status, Method, RequestSpec, Transport};
use crate::exchange::{
    drop_open_candle, field_f64, field_str, ExResult, Exchange, ExchangeError,
};
use crate::types::{
    interval_secs, now, Candle, Credentials, Filter, FilledOrder, LimitDetails, Pair, PriceDict,
    Side,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const HOST: &str = "https://api.exchange.bitpanda.com";

/// Bitpanda Pro client: Bearer-token auth, ISO-8601 time ranges,
/// per-market decimal precisions, underscore instrument codes.
pub struct BitpandaPro {
    transport: Arc<Transport>,
    host: String,
}

fn instrument_code(pair: &Pair) -> String {
    format!("{}_{}", pair.base, pair.quote)
}

fn iso(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn parse_iso(s: &str) -> i64 {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

/// Candle granularity as (unit, period).
fn granularity(step: i64) -> (&'static str, i64) {
    if step % 86_400 == 0 {
        ("DAYS", step / 86_400)
    } else if step % 3600 == 0 {
        ("HOURS", step / 3600)
    } else {
        ("MINUTES", step / 60)
    }
}

fn map_bitpanda_error(status: u16, body: &Value) -> ExchangeError {
    let code = field_str(body, "error").to_string();
    match code.as_str() {
        "INSUFFICIENT_FUNDS" => ExchangeError::InsufficientBalance(code),
        "INSUFFICIENT_LIQUIDITY" => ExchangeError::Funds(code),
        "ORDER_NOT_FOUND" => ExchangeError::OrderNotFound(code),
        "INVALID_APIKEY" | "MISSING_APIKEY" | "APIKEY_REVOKED" | "UNAUTHORIZED" => {
            ExchangeError::Auth(code)
        }
        _ => map_http_status(status, body),
    }
}

impl BitpandaPro {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport, host: HOST.to_string() }
    }

    fn spec(&self, method: Method, path: &str) -> RequestSpec {
        let base = match method {
            Method::Get => RequestSpec::get(&self.host, path, "bitpanda"),
            Method::Post => RequestSpec::post(&self.host, path, "bitpanda"),
            Method::Delete => RequestSpec::delete(&self.host, path, "bitpanda"),
        };
        base.budget(120, Duration::from_secs(60))
    }

    async fn public(&self, path: &str, query: Option<String>) -> ExResult<Value> {
        let mut spec = self.spec(Method::Get, path);
        if let Some(q) = query {
            spec = spec.query(q);
        }
        let resp = self.transport.request(spec).await?;
        if resp.is_success() {
            Ok(resp.body)
        } else {
            Err(map_bitpanda_error(resp.status, &resp.body))
        }
    }

    /// The API token rides in the Authorization header; no request signing.
    async fn bearer(
        &self,
        creds: &Credentials,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ExResult<Value> {
        let mut spec = self
            .spec(method, path)
            .header("Authorization", format!("Bearer {}", creds.key));
        if let Some(b) = body {
            spec.headers.push(("content-type".into(), "application/json".into()));
            spec = spec.body(b.to_string());
        }
        let resp = self.transport.request(spec).await?;
        if resp.is_success() {
            Ok(resp.body)
        } else {
            Err(map_bitpanda_error(resp.status, &resp.body))
        }
    }

    /// The order detail and cancel routes only address server-assigned
    /// ids, so the server id is the local txid even when a client id was
    /// sent with the placement.
    fn order_txid(body: &Value) -> ExResult<String> {
        let oid = field_str(body, "order_id");
        if oid.is_empty() {
            return Err(ExchangeError::Call("order response without order_id".into()));
        }
        Ok(oid.to_string())
    }
}

#[async_trait]
impl Exchange for BitpandaPro {
    fn name(&self) -> &str {
        "bitpanda"
    }

    async fn update_ohlc(&self, pair: &Pair, interval: &str, since: i64) -> ExResult<Vec<Candle>> {
        let step = interval_secs(interval).map_err(|e| ExchangeError::Call(e.to_string()))?;
        let (unit, period) = granularity(step);
        let query = format!(
            "unit={}&period={}&from={}&to={}",
            unit,
            period,
            urlencoding::encode(&iso(since + 1)),
            urlencoding::encode(&iso(now())),
        );
        let body = self
            .public(
                &format!("/public/v1/candlesticks/{}", instrument_code(pair)),
                Some(query),
            )
            .await?;

        let mut out: Vec<Candle> = Vec::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            out.push(Candle {
                time: parse_iso(field_str(row, "time")),
                open: field_f64(row, "open"),
                high: field_f64(row, "high"),
                low: field_f64(row, "low"),
                close: field_f64(row, "close"),
                volume: field_f64(row, "volume"),
            });
        }
        out.retain(|c| c.time > since);
        out.sort_by_key(|c| c.time);

        let out = drop_open_candle(out, step, now());
        if out.is_empty() {
            return Err(ExchangeError::NoNewCandles);
        }
        Ok(out)
    }

    async fn balance(&self, creds: &Credentials) -> ExResult<HashMap<String, f64>> {
        let body = self
            .bearer(creds, Method::Get, "/public/v1/account/balances", None)
            .await?;
        let mut balances = HashMap::new();
        for row in body
            .get("balances")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
        {
            let available = field_f64(row, "available");
            if available > 0.0 {
                balances.insert(field_str(row, "currency_code").to_string(), available);
            }
        }
        Ok(balances)
    }

    async fn market_prices(&self) -> ExResult<PriceDict> {
        let body = self.public("/public/v1/market-ticker", None).await?;
        let mut prices = PriceDict::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let code = field_str(row, "instrument_code");
            let Some((base, quote)) = code.split_once('_') else { continue };
            let last = field_f64(row, "last_price");
            if last > 0.0 {
                prices.insert(Pair::new(base, quote), last);
            }
        }
        Ok(prices)
    }

    async fn filters(&self) -> ExResult<HashMap<Pair, Filter>> {
        let body = self.public("/public/v1/instruments", None).await?;
        let mut out = HashMap::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let base = row.get("base").map(|b| field_str(b, "code")).unwrap_or("");
            let quote = row.get("quote").map(|q| field_str(q, "code")).unwrap_or("");
            if base.is_empty() || quote.is_empty() {
                continue;
            }
            let min_size = field_f64(row, "min_size");
            out.insert(
                Pair::new(base, quote),
                Filter {
                    min_lot: None,
                    // min_size is quoted in the quote currency.
                    min_notional: (min_size > 0.0).then_some(min_size),
                    price_denom: row
                        .get("market_precision")
                        .and_then(Value::as_u64)
                        .map(|d| d as u32),
                    lot_denom: row
                        .get("amount_precision")
                        .and_then(Value::as_u64)
                        .map(|d| d as u32),
                },
            );
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
        let body = serde_json::json!({
            "instrument_code": instrument_code(pair),
            "side": side.to_string(),
            "type": "MARKET",
            "amount": format!("{volume}"),
        });
        let resp = self
            .bearer(creds, Method::Post, "/public/v1/account/orders", Some(body))
            .await?;
        let order_id = field_str(&resp, "order_id").to_string();

        // Market fills settle synchronously; read back the filled totals.
        let detail = self
            .bearer(
                creds,
                Method::Get,
                &format!("/public/v1/account/orders/{order_id}"),
                None,
            )
            .await?;
        let order = detail.get("order").cloned().unwrap_or(detail);
        let executed = field_f64(&order, "filled_amount");
        let price = field_f64(&order, "average_price");
        let quote = executed * price;
        let fee = quote * self.fee_rate();

        let (tok_diff, cur_diff) = match side {
            Side::Buy => (executed, -(quote + fee)),
            Side::Sell => (-executed, quote - fee),
        };

        Ok(FilledOrder {
            side,
            price,
            volume: executed,
            tok_diff,
            cur_diff,
            fee,
            fee_asset: pair.quote.clone(),
            date: parse_iso(field_str(&order, "time_last_updated")),
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
        let mut body = serde_json::json!({
            "instrument_code": instrument_code(pair),
            "side": side.to_string(),
            "type": "LIMIT",
            "amount": format!("{volume}"),
            "price": format!("{price}"),
        });
        if let Some(cid) = client_order_id {
            body["client_id"] = Value::String(cid.to_string());
        }
        let resp = self
            .bearer(creds, Method::Post, "/public/v1/account/orders", Some(body))
            .await?;
        Self::order_txid(&resp)
    }

    async fn stoploss_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        volume: f64,
        stop_price: f64,
        client_order_id: Option<&str>,
    ) -> ExResult<String> {
        let mut body = serde_json::json!({
            "instrument_code": instrument_code(pair),
            "side": "SELL",
            "type": "STOP",
            "amount": format!("{volume}"),
            "price": format!("{stop_price}"),
            "trigger_price": format!("{stop_price}"),
        });
        if let Some(cid) = client_order_id {
            body["client_id"] = Value::String(cid.to_string());
        }
        let resp = self
            .bearer(creds, Method::Post, "/public/v1/account/orders", Some(body))
            .await?;
        Self::order_txid(&resp)
    }

    async fn limit_details(
        &self,
        creds: &Credentials,
        _pair: &Pair,
        txid: &str,
    ) -> ExResult<LimitDetails> {
        let detail = self
            .bearer(
                creds,
                Method::Get,
                &format!("/public/v1/account/orders/{txid}"),
                None,
            )
            .await?;
        let order = detail.get("order").cloned().unwrap_or(detail);
        let orig = field_f64(&order, "amount");
        let executed = field_f64(&order, "filled_amount");
        let avg = field_f64(&order, "average_price");
        Ok(LimitDetails {
            exec_volume: executed,
            exec_fraction: if orig > 0.0 { executed / orig } else { 0.0 },
            price: if avg > 0.0 { avg } else { field_f64(&order, "price") },
            date: parse_iso(field_str(&order, "time_last_updated")),
        })
    }

    async fn cancel_order(&self, creds: &Credentials, _pair: &Pair, txid: &str) -> ExResult<()> {
        match self
            .bearer(
                creds,
                Method::Delete,
                &format!("/public/v1/account/orders/{txid}"),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::OrderNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn fee_rate(&self) -> f64 {
        0.0015
    }
}
