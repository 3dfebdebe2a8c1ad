use crate::exchange::signer::sign_hmac_sha256_hex;
use crate::exchange::transport::{map_http_status, Method, RequestSpec, Transport};
use crate::exchange::{
    drop_open_candle, field_f64, field_str, json_f64, ExResult, Exchange, ExchangeError,
};
use crate::types::{
    interval_secs, now, Candle, Credentials, Filter, FilledOrder, LimitDetails, Pair, PriceDict,
    Side,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const HOST: &str = "https://api.bitvavo.com";
const ACCESS_WINDOW_MS: u64 = 10_000;

/// Bitvavo client: HMAC-SHA256 over `timestamp + method + path + body`,
/// dashed market codes.
pub struct Bitvavo {
    transport: Arc<Transport>,
    host: String,
}

fn market_code(pair: &Pair) -> String {
    pair.dashed()
}

fn map_bitvavo_error(status: u16, body: &Value) -> ExchangeError {
    let code = body.get("errorCode").and_then(Value::as_i64).unwrap_or(0);
    let msg = field_str(body, "error").to_string();
    match code {
        216 => ExchangeError::InsufficientBalance(msg),
        240 => ExchangeError::OrderNotFound(msg),
        300..=399 => ExchangeError::Auth(msg),
        105 | 110 => ExchangeError::RateLimit(msg),
        _ => map_http_status(status, body),
    }
}

impl Bitvavo {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport, host: HOST.to_string() }
    }

    fn spec(&self, method: Method, path: &str) -> RequestSpec {
        let base = match method {
            Method::Get => RequestSpec::get(&self.host, path, "bitvavo"),
            Method::Post => RequestSpec::post(&self.host, path, "bitvavo"),
            Method::Delete => RequestSpec::delete(&self.host, path, "bitvavo"),
        };
        base.budget(1000, Duration::from_secs(60))
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
            Err(map_bitvavo_error(resp.status, &resp.body))
        }
    }

    async fn signed(
        &self,
        creds: &Credentials,
        method: Method,
        path: &str,
        query: Option<String>,
        body: Option<Value>,
    ) -> ExResult<Value> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let full_path = match &query {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        };
        let method_str = match method {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        };
        let payload = format!("{timestamp}{method_str}{full_path}{body_str}");
        let sig = sign_hmac_sha256_hex(&creds.secret, &payload)?;

        let mut spec = self
            .spec(method, path)
            .header("bitvavo-access-key", creds.key.clone())
            .header("bitvavo-access-signature", sig)
            .header("bitvavo-access-timestamp", timestamp.to_string())
            .header("bitvavo-access-window", ACCESS_WINDOW_MS.to_string());
        if let Some(q) = query {
            spec = spec.query(q);
        }
        if let Some(b) = body {
            spec.headers.push(("content-type".into(), "application/json".into()));
            spec = spec.body(b.to_string());
        }

        let resp = self.transport.request(spec).await?;
        if resp.is_success() {
            Ok(resp.body)
        } else {
            Err(map_bitvavo_error(resp.status, &resp.body))
        }
    }

    /// Order polls and cancels take the server-assigned `orderId` query
    /// parameter, so it is the local txid even when a clientOrderId was
    /// sent with the placement.
    fn parse_order_placement(body: &Value) -> ExResult<String> {
        let oid = field_str(body, "orderId");
        if oid.is_empty() {
            return Err(ExchangeError::Call("order response without orderId".into()));
        }
        Ok(oid.to_string())
    }
}

#[async_trait]
impl Exchange for Bitvavo {
    fn name(&self) -> &str {
        "bitvavo"
    }

    async fn update_ohlc(&self, pair: &Pair, interval: &str, since: i64) -> ExResult<Vec<Candle>> {
        let step = interval_secs(interval).map_err(|e| ExchangeError::Call(e.to_string()))?;
        let query = format!("interval={}&start={}", interval, (since + 1) * 1000);
        let body = self
            .public(&format!("/v2/{}/candles", market_code(pair)), Some(query))
            .await?;

        // Rows are [ms, open, high, low, close, volume], newest first.
        let mut out: Vec<Candle> = Vec::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let Some(arr) = row.as_array() else { continue };
            if arr.len() < 6 {
                continue;
            }
            out.push(Candle {
                time: arr[0].as_i64().unwrap_or(0) / 1000,
                open: json_f64(&arr[1]),
                high: json_f64(&arr[2]),
                low: json_f64(&arr[3]),
                close: json_f64(&arr[4]),
                volume: json_f64(&arr[5]),
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
            .signed(creds, Method::Get, "/v2/balance", None, None)
            .await?;
        let mut balances = HashMap::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let available = field_f64(row, "available");
            if available > 0.0 {
                balances.insert(field_str(row, "symbol").to_string(), available);
            }
        }
        Ok(balances)
    }

    async fn market_prices(&self) -> ExResult<PriceDict> {
        let body = self.public("/v2/ticker/price", None).await?;
        let mut prices = PriceDict::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let market = field_str(row, "market");
            let Some((base, quote)) = market.split_once('-') else { continue };
            let price = field_f64(row, "price");
            if price > 0.0 {
                prices.insert(Pair::new(base, quote), price);
            }
        }
        Ok(prices)
    }

    async fn filters(&self) -> ExResult<HashMap<Pair, Filter>> {
        let body = self.public("/v2/markets", None).await?;
        let mut out = HashMap::new();
        for row in body.as_array().unwrap_or(&Vec::new()) {
            let market = field_str(row, "market");
            let Some((base, quote)) = market.split_once('-') else { continue };
            let min_base = field_f64(row, "minOrderInBaseAsset");
            let min_quote = field_f64(row, "minOrderInQuoteAsset");
            out.insert(
                Pair::new(base, quote),
                Filter {
                    min_lot: (min_base > 0.0).then_some(min_base),
                    min_notional: (min_quote > 0.0).then_some(min_quote),
                    price_denom: row.get("pricePrecision").and_then(Value::as_u64).map(|d| d as u32),
                    lot_denom: None,
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
            "market": market_code(pair),
            "side": side.to_string().to_lowercase(),
            "orderType": "market",
            "amount": format!("{volume}"),
        });
        let resp = self
            .signed(creds, Method::Post, "/v2/order", None, Some(body))
            .await?;

        let executed = field_f64(&resp, "filledAmount");
        let quote = field_f64(&resp, "filledAmountQuote");
        let fee = field_f64(&resp, "feePaid");
        let fee_asset = field_str(&resp, "feeCurrency").to_string();
        let price = if executed > 0.0 { quote / executed } else { 0.0 };

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
            date: field_f64(&resp, "updated") as i64 / 1000,
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
            "market": market_code(pair),
            "side": side.to_string().to_lowercase(),
            "orderType": "limit",
            "amount": format!("{volume}"),
            "price": format!("{price}"),
        });
        if let Some(cid) = client_order_id {
            body["clientOrderId"] = Value::String(cid.to_string());
        }
        let resp = self
            .signed(creds, Method::Post, "/v2/order", None, Some(body))
            .await?;
        Self::parse_order_placement(&resp)
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
            "market": market_code(pair),
            "side": "sell",
            "orderType": "stopLoss",
            "amount": format!("{volume}"),
            "triggerType": "price",
            "triggerReference": "lastTrade",
            "triggerAmount": format!("{stop_price}"),
        });
        if let Some(cid) = client_order_id {
            body["clientOrderId"] = Value::String(cid.to_string());
        }
        let resp = self
            .signed(creds, Method::Post, "/v2/order", None, Some(body))
            .await?;
        Self::parse_order_placement(&resp)
    }

    async fn limit_details(
        &self,
        creds: &Credentials,
        pair: &Pair,
        txid: &str,
    ) -> ExResult<LimitDetails> {
        let query = format!("market={}&orderId={}", market_code(pair), txid);
        let resp = self
            .signed(creds, Method::Get, "/v2/order", Some(query), None)
            .await?;

        let orig = field_f64(&resp, "amount");
        let executed = field_f64(&resp, "filledAmount");
        let quote = field_f64(&resp, "filledAmountQuote");
        let price = if executed > 0.0 {
            quote / executed
        } else {
            field_f64(&resp, "price")
        };
        Ok(LimitDetails {
            exec_volume: executed,
            exec_fraction: if orig > 0.0 { executed / orig } else { 0.0 },
            price,
            date: field_f64(&resp, "updated") as i64 / 1000,
        })
    }

    async fn cancel_order(&self, creds: &Credentials, pair: &Pair, txid: &str) -> ExResult<()> {
        let query = format!("market={}&orderId={}", market_code(pair), txid);
        match self
            .signed(creds, Method::Delete, "/v2/order", Some(query), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::OrderNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn fee_rate(&self) -> f64 {
        0.0025
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_txid_prefers_the_server_order_id() {
        let body = serde_json::json!({"orderId": "srv-1", "clientOrderId": "cid-1"});
        assert_eq!(Bitvavo::parse_order_placement(&body).unwrap(), "srv-1");
        assert!(Bitvavo::parse_order_placement(&serde_json::json!({})).is_err());
    }

    #[test]
    fn error_codes_classify() {
        let body = serde_json::json!({"errorCode": 216, "error": "insufficient balance"});
        assert!(matches!(
            map_bitvavo_error(400, &body),
            ExchangeError::InsufficientBalance(_)
        ));
        let body = serde_json::json!({"errorCode": 301, "error": "invalid api key"});
        assert!(matches!(map_bitvavo_error(403, &body), ExchangeError::Auth(_)));
        let body = serde_json::json!({"errorCode": 240, "error": "no such order"});
        assert!(matches!(
            map_bitvavo_error(404, &body),
            ExchangeError::OrderNotFound(_)
        ));
    }
}
