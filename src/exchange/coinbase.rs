use crate::exchange::signer::sign_hmac_sha256_b64;
use crate::exchange::transport::{map_http_status, Method, RequestSpec, Transport};
use crate::exchange::{
    drop_open_candle, field_f64, field_str, json_f64, ExResult, Exchange, ExchangeError,
};
use crate::types::{
    interval_secs, now, Candle, Credentials, Filter, FilledOrder, LimitDetails, Pair, PriceDict,
    Side,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const HOST: &str = "https://api.exchange.coinbase.com";
/// Granularities the candles endpoint accepts natively, seconds.
const NATIVE_GRANULARITIES: [i64; 6] = [60, 300, 900, 3600, 21_600, 86_400];
const CANDLE_PAGE: i64 = 300;
const MAX_PAGES: usize = 20;

/// Coinbase Pro client: HMAC-SHA256 over `timestamp|method|path|body`
/// with a base64 secret, passphrase header, dashed product ids.
/// Intervals the venue lacks (e.g. 4h) are resampled from 1h bars.
pub struct CoinbasePro {
    transport: Arc<Transport>,
    host: String,
}

fn product_id(pair: &Pair) -> String {
    pair.dashed()
}

fn iso(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn map_coinbase_error(status: u16, body: &Value) -> ExchangeError {
    let msg = field_str(body, "message").to_lowercase();
    if msg.contains("insufficient funds") {
        ExchangeError::InsufficientBalance(msg)
    } else if msg.contains("invalid api key") || msg.contains("invalid passphrase") {
        ExchangeError::Auth(msg)
    } else if msg.contains("not found") {
        ExchangeError::OrderNotFound(msg)
    } else {
        map_http_status(status, body)
    }
}

/// Aggregate fine bars into a coarser interval. Only complete buckets
/// (end already in the past) survive.
pub(crate) fn resample(candles: &[Candle], to_secs: i64, now: i64) -> Vec<Candle> {
    let mut buckets: Vec<Candle> = Vec::new();
    for c in candles {
        let bucket_start = c.time - c.time.rem_euclid(to_secs);
        match buckets.last_mut() {
            Some(last) if last.time == bucket_start => {
                last.high = last.high.max(c.high);
                last.low = last.low.min(c.low);
                last.close = c.close;
                last.volume += c.volume;
            }
            _ => buckets.push(Candle { time: bucket_start, ..*c }),
        }
    }
    buckets.retain(|b| b.time + to_secs <= now);
    buckets
}

impl CoinbasePro {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport, host: HOST.to_string() }
    }

    fn spec(&self, method: Method, path: &str) -> RequestSpec {
        let base = match method {
            Method::Get => RequestSpec::get(&self.host, path, "coinbase"),
            Method::Post => RequestSpec::post(&self.host, path, "coinbase"),
            Method::Delete => RequestSpec::delete(&self.host, path, "coinbase"),
        };
        base.budget(10, Duration::from_secs(1))
            .header("User-Agent", "tradefleet".to_string())
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
            Err(map_coinbase_error(resp.status, &resp.body))
        }
    }

    async fn signed(
        &self,
        creds: &Credentials,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ExResult<Value> {
        let timestamp = now().to_string();
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let method_str = match method {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        };
        let payload = format!("{timestamp}{method_str}{path}{body_str}");
        let sig = sign_hmac_sha256_b64(&creds.secret, &payload)?;
        let passphrase = creds
            .passphrase
            .as_ref()
            .map(|p| p.expose_secret().clone())
            .ok_or_else(|| ExchangeError::Auth("coinbase requires a passphrase".into()))?;

        let mut spec = self
            .spec(method, path)
            .header("CB-ACCESS-KEY", creds.key.clone())
            .header("CB-ACCESS-SIGN", sig)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", passphrase);
        if let Some(b) = body {
            spec.headers.push(("content-type".into(), "application/json".into()));
            spec = spec.body(b.to_string());
        }
        let resp = self.transport.request(spec).await?;
        if resp.is_success() {
            Ok(resp.body)
        } else {
            Err(map_coinbase_error(resp.status, &resp.body))
        }
    }

    /// Candle rows are [time, low, high, open, close, volume], newest
    /// first, max 300 per page.
    async fn fetch_native(
        &self,
        pair: &Pair,
        granularity: i64,
        since: i64,
    ) -> ExResult<Vec<Candle>> {
        let mut out: Vec<Candle> = Vec::new();
        let mut cursor = since + 1;

        for _ in 0..MAX_PAGES {
            let end = cursor + granularity * CANDLE_PAGE;
            let query = format!(
                "granularity={}&start={}&end={}",
                granularity,
                urlencoding::encode(&iso(cursor)),
                urlencoding::encode(&iso(end.min(now() + granularity))),
            );
            let body = self
                .public(&format!("/products/{}/candles", product_id(pair)), Some(query))
                .await?;
            let mut page: Vec<Candle> = Vec::new();
            for row in body.as_array().unwrap_or(&Vec::new()) {
                let Some(arr) = row.as_array() else { continue };
                if arr.len() < 6 {
                    continue;
                }
                page.push(Candle {
                    time: arr[0].as_i64().unwrap_or(0),
                    low: json_f64(&arr[1]),
                    high: json_f64(&arr[2]),
                    open: json_f64(&arr[3]),
                    close: json_f64(&arr[4]),
                    volume: json_f64(&arr[5]),
                });
            }
            page.retain(|c| c.time > since);
            page.sort_by_key(|c| c.time);
            let advanced = page.last().map(|c| c.time + 1);
            out.extend(page);
            match advanced {
                Some(next) if next > cursor && end < now() => cursor = next,
                _ => break,
            }
        }
        out.dedup_by_key(|c| c.time);
        Ok(out)
    }
}

#[async_trait]
impl Exchange for CoinbasePro {
    fn name(&self) -> &str {
        "coinbase"
    }

    async fn update_ohlc(&self, pair: &Pair, interval: &str, since: i64) -> ExResult<Vec<Candle>> {
        let step = interval_secs(interval).map_err(|e| ExchangeError::Call(e.to_string()))?;

        let out = if NATIVE_GRANULARITIES.contains(&step) {
            self.fetch_native(pair, step, since).await?
        } else {
            // Resample from the largest native granularity dividing the
            // target (1h bars for 4h).
            let base = NATIVE_GRANULARITIES
                .iter()
                .rev()
                .copied()
                .find(|g| step % g == 0)
                .ok_or_else(|| {
                    ExchangeError::Call(format!("granularity {step}s cannot be resampled"))
                })?;
            let fine = self.fetch_native(pair, base, since).await?;
            resample(&fine, step, now())
        };

        let out = drop_open_candle(out, step, now());
        if out.is_empty() {
            return Err(ExchangeError::NoNewCandles);
        }
        Ok(out)
    }

    async fn balance(&self, creds: &Credentials) -> ExResult<HashMap<String, f64>> {
        let body = self.signed(creds, Method::Get, "/accounts", None).await?;
        let mut balances = HashMap::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let available = field_f64(row, "available");
            if available > 0.0 {
                balances.insert(field_str(row, "currency").to_string(), available);
            }
        }
        Ok(balances)
    }

    async fn market_prices(&self) -> ExResult<PriceDict> {
        let products = self.public("/products", None).await?;
        let mut prices = PriceDict::new();
        for row in products.as_array().unwrap_or(&Vec::new()) {
            if field_str(row, "status") != "online" {
                continue;
            }
            let id = field_str(row, "id").to_string();
            let Some((base, quote)) = id.split_once('-') else { continue };
            let ticker = self
                .public(&format!("/products/{id}/ticker"), None)
                .await?;
            let price = field_f64(&ticker, "price");
            if price > 0.0 {
                prices.insert(Pair::new(base, quote), price);
            }
        }
        Ok(prices)
    }

    async fn filters(&self) -> ExResult<HashMap<Pair, Filter>> {
        let body = self.public("/products", None).await?;
        let mut out = HashMap::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let id = field_str(row, "id");
            let Some((base, quote)) = id.split_once('-') else { continue };
            let min_notional = field_f64(row, "min_market_funds");
            out.insert(
                Pair::new(base, quote),
                Filter {
                    min_lot: None,
                    min_notional: (min_notional > 0.0).then_some(min_notional),
                    price_denom: crate::exchange::denom_from_step(field_str(
                        row,
                        "quote_increment",
                    )),
                    lot_denom: crate::exchange::denom_from_step(field_str(
                        row,
                        "base_increment",
                    )),
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
            "product_id": product_id(pair),
            "side": side.to_string().to_lowercase(),
            "type": "market",
            "size": format!("{volume}"),
        });
        let resp = self.signed(creds, Method::Post, "/orders", Some(body)).await?;
        let order_id = field_str(&resp, "id").to_string();

        // Settlement is immediate for market orders; read the final totals.
        let order = self
            .signed(creds, Method::Get, &format!("/orders/{order_id}"), None)
            .await?;
        let executed = field_f64(&order, "filled_size");
        let value = field_f64(&order, "executed_value");
        let fee = field_f64(&order, "fill_fees");
        let price = if executed > 0.0 { value / executed } else { 0.0 };

        // Coinbase charges fees in the quote currency.
        let (tok_diff, cur_diff) = match side {
            Side::Buy => (executed, -(value + fee)),
            Side::Sell => (-executed, value - fee),
        };

        Ok(FilledOrder {
            side,
            price,
            volume: executed,
            tok_diff,
            cur_diff,
            fee,
            fee_asset: pair.quote.clone(),
            date: chrono::DateTime::parse_from_rfc3339(field_str(&order, "done_at"))
                .map(|t| t.timestamp())
                .unwrap_or_else(|_| now()),
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
            "product_id": product_id(pair),
            "side": side.to_string().to_lowercase(),
            "type": "limit",
            "size": format!("{volume}"),
            "price": format!("{price}"),
        });
        if let Some(cid) = client_order_id {
            // client_oid must be a UUID; local ids are simple uuids, so
            // hyphenating them back is enough.
            body["client_oid"] = Value::String(rehyphenate(cid));
        }
        let resp = self.signed(creds, Method::Post, "/orders", Some(body)).await?;
        Ok(client_order_id
            .map(str::to_string)
            .unwrap_or_else(|| field_str(&resp, "id").to_string()))
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
            "product_id": product_id(pair),
            "side": "sell",
            "type": "limit",
            "stop": "loss",
            "stop_price": format!("{stop_price}"),
            "price": format!("{stop_price}"),
            "size": format!("{volume}"),
        });
        if let Some(cid) = client_order_id {
            body["client_oid"] = Value::String(rehyphenate(cid));
        }
        let resp = self.signed(creds, Method::Post, "/orders", Some(body)).await?;
        Ok(client_order_id
            .map(str::to_string)
            .unwrap_or_else(|| field_str(&resp, "id").to_string()))
    }

    async fn limit_details(
        &self,
        creds: &Credentials,
        _pair: &Pair,
        txid: &str,
    ) -> ExResult<LimitDetails> {
        let path = order_path(txid);
        let order = self.signed(creds, Method::Get, &path, None).await?;
        let orig = field_f64(&order, "size");
        let executed = field_f64(&order, "filled_size");
        let value = field_f64(&order, "executed_value");
        let price = if executed > 0.0 {
            value / executed
        } else {
            field_f64(&order, "price")
        };
        Ok(LimitDetails {
            exec_volume: executed,
            exec_fraction: if orig > 0.0 { executed / orig } else { 0.0 },
            price,
            date: chrono::DateTime::parse_from_rfc3339(field_str(&order, "done_at"))
                .map(|t| t.timestamp())
                .unwrap_or_else(|_| now()),
        })
    }

    async fn cancel_order(&self, creds: &Credentials, _pair: &Pair, txid: &str) -> ExResult<()> {
        match self
            .signed(creds, Method::Delete, &order_path(txid), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::OrderNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn supports_native_stoploss(&self) -> bool {
        true
    }

    fn fee_rate(&self) -> f64 {
        0.006
    }
}

/// Server-assigned ids are addressed directly, client ids via the
/// `client:` prefix route.
fn order_path(txid: &str) -> String {
    if txid.len() == 32 && !txid.contains('-') {
        format!("/orders/client:{}", rehyphenate(txid))
    } else if txid.contains('-') && txid.len() == 36 {
        format!("/orders/{txid}")
    } else {
        format!("/orders/client:{txid}")
    }
}

/// Expand a 32-char simple uuid back to hyphenated form.
fn rehyphenate(simple: &str) -> String {
    if simple.len() != 32 {
        return simple.to_string();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &simple[0..8],
        &simple[8..12],
        &simple[12..16],
        &simple[16..20],
        &simple[20..32]
    )
}
