use crate::exchange::signer::{sign_kraken, NonceCounter};
use crate::exchange::transport::{Method, RequestSpec, Transport};
use crate::exchange::{
    drop_open_candle, field_f64, field_str, json_f64, ExResult, Exchange, ExchangeError,
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

const HOST: &str = "https://api.kraken.com";

/// Kraken client: altname pair mapping, HMAC-SHA512 over
/// SHA256(nonce+body) with a base64 secret, `API-Key`/`API-Sign` headers.
pub struct Kraken {
    transport: Arc<Transport>,
    host: String,
    nonce: NonceCounter,
}

/// Kraken spells a few assets its own way.
fn kraken_asset(asset: &str) -> &str {
    match asset {
        "BTC" => "XBT",
        "DOGE" => "XDG",
        other => other,
    }
}

fn canonical_asset(asset: &str) -> &str {
    match asset {
        "XBT" | "XXBT" => "BTC",
        "XDG" | "XXDG" => "DOGE",
        // Legacy 4-letter codes carry an X/Z class prefix (XETH, ZUSD).
        // Modern 3-letter codes like XRP pass through untouched.
        other if other.len() == 4 && other.starts_with(['X', 'Z']) => &other[1..],
        other => other,
    }
}

fn altname(pair: &Pair) -> String {
    format!("{}{}", kraken_asset(&pair.base), kraken_asset(&pair.quote))
}

/// Kraken errors arrive as string codes in an `error` array.
fn map_kraken_error(errors: &[String]) -> ExchangeError {
    let joined = errors.join("; ");
    let first = errors.first().map(String::as_str).unwrap_or("");
    if first.contains("Rate limit") {
        ExchangeError::RateLimit(joined)
    } else if first.starts_with("EAPI") || first.contains("Invalid key") {
        ExchangeError::Auth(joined)
    } else if first.contains("Insufficient funds") {
        ExchangeError::InsufficientBalance(joined)
    } else if first.contains("Unknown order") {
        ExchangeError::OrderNotFound(joined)
    } else if first.starts_with("EService") {
        ExchangeError::Internal(joined)
    } else {
        ExchangeError::Call(joined)
    }
}

impl Kraken {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            host: HOST.to_string(),
            nonce: NonceCounter::new(),
        }
    }

    fn spec(&self, method: Method, path: &str) -> RequestSpec {
        let base = match method {
            Method::Get => RequestSpec::get(&self.host, path, "kraken"),
            _ => RequestSpec::post(&self.host, path, "kraken"),
        };
        base.budget(15, Duration::from_secs(45))
    }

    /// Unwrap Kraken's `{error: [...], result: ...}` envelope.
    fn unwrap_result(body: Value) -> ExResult<Value> {
        let errors: Vec<String> = body
            .get("error")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|e| e.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if !errors.is_empty() {
            return Err(map_kraken_error(&errors));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn public(&self, path: &str, query: Option<String>) -> ExResult<Value> {
        let mut spec = self.spec(Method::Get, path);
        if let Some(q) = query {
            spec = spec.query(q);
        }
        let body = self.transport.request_ok(spec).await?;
        Self::unwrap_result(body)
    }

    async fn private(
        &self,
        creds: &Credentials,
        path: &str,
        mut form: BTreeMap<String, String>,
    ) -> ExResult<Value> {
        let nonce = self.nonce.next();
        form.insert("nonce".into(), nonce.to_string());
        let postdata = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let sig = sign_kraken(&creds.secret, path, nonce, &postdata)?;

        let spec = self
            .spec(Method::Post, path)
            .body(postdata)
            .header("API-Key", creds.key.clone())
            .header("API-Sign", sig);
        let resp = self.transport.request(spec).await?;
        if !resp.is_success() {
            return Err(crate::exchange::transport::map_http_status(
                resp.status,
                &resp.body,
            ));
        }
        Self::unwrap_result(resp.body)
    }
}

#[async_trait]
impl Exchange for Kraken {
    fn name(&self) -> &str {
        "kraken"
    }

    async fn update_ohlc(&self, pair: &Pair, interval: &str, since: i64) -> ExResult<Vec<Candle>> {
        let step = interval_secs(interval).map_err(|e| ExchangeError::Call(e.to_string()))?;
        let query = format!(
            "pair={}&interval={}&since={}",
            altname(pair),
            step / 60,
            since + 1
        );
        let result = self.public("/0/public/OHLC", Some(query)).await?;

        // Result keys the series by Kraken's internal pair name; take the
        // single non-"last" entry.
        let mut out: Vec<Candle> = Vec::new();
        if let Some(obj) = result.as_object() {
            for (key, rows) in obj {
                if key == "last" {
                    continue;
                }
                for row in rows.as_array().unwrap_or(&Vec::new()) {
                    let Some(arr) = row.as_array() else { continue };
                    if arr.len() < 7 {
                        continue;
                    }
                    out.push(Candle {
                        time: arr[0].as_i64().unwrap_or(0),
                        open: json_f64(&arr[1]),
                        high: json_f64(&arr[2]),
                        low: json_f64(&arr[3]),
                        close: json_f64(&arr[4]),
                        volume: json_f64(&arr[6]),
                    });
                }
            }
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
        let result = self
            .private(creds, "/0/private/Balance", BTreeMap::new())
            .await?;
        let mut balances = HashMap::new();
        if let Some(obj) = result.as_object() {
            for (asset, amount) in obj {
                let v = json_f64(amount);
                if v > 0.0 {
                    balances.insert(canonical_asset(asset).to_string(), v);
                }
            }
        }
        Ok(balances)
    }

    async fn market_prices(&self) -> ExResult<PriceDict> {
        let pairs = self.public("/0/public/AssetPairs", None).await?;
        let tickers = self.public("/0/public/Ticker", None).await?;

        let mut prices = PriceDict::new();
        let (Some(pair_obj), Some(tick_obj)) = (pairs.as_object(), tickers.as_object()) else {
            return Ok(prices);
        };
        for (key, info) in pair_obj {
            let Some(ticker) = tick_obj.get(key) else { continue };
            // wsname "XBT/USD" carries the readable split.
            let wsname = field_str(info, "wsname");
            let Some((base, quote)) = wsname.split_once('/') else { continue };
            let last = ticker
                .get("c")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .map(json_f64)
                .unwrap_or(0.0);
            if last > 0.0 {
                prices.insert(
                    Pair::new(canonical_asset(base), canonical_asset(quote)),
                    last,
                );
            }
        }
        Ok(prices)
    }

    async fn filters(&self) -> ExResult<HashMap<Pair, Filter>> {
        let result = self.public("/0/public/AssetPairs", None).await?;
        let mut out = HashMap::new();
        if let Some(obj) = result.as_object() {
            for info in obj.values() {
                let wsname = field_str(info, "wsname");
                let Some((base, quote)) = wsname.split_once('/') else { continue };
                let pair = Pair::new(canonical_asset(base), canonical_asset(quote));
                let ordermin = field_f64(info, "ordermin");
                let costmin = field_f64(info, "costmin");
                out.insert(
                    pair,
                    Filter {
                        min_lot: (ordermin > 0.0).then_some(ordermin),
                        min_notional: (costmin > 0.0).then_some(costmin),
                        price_denom: info.get("pair_decimals").and_then(Value::as_u64).map(|d| d as u32),
                        lot_denom: info.get("lot_decimals").and_then(Value::as_u64).map(|d| d as u32),
                    },
                );
            }
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
        let mut form = BTreeMap::new();
        form.insert("pair".into(), altname(pair));
        form.insert("type".into(), side.to_string().to_lowercase());
        form.insert("ordertype".into(), "market".into());
        form.insert("volume".into(), format!("{volume}"));

        let result = self.private(creds, "/0/private/AddOrder", form).await?;
        let txid = result
            .get("txid")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Call("AddOrder returned no txid".into()))?
            .to_string();

        // Market orders settle immediately; pull the authoritative fill.
        let mut form = BTreeMap::new();
        form.insert("txid".into(), txid.clone());
        form.insert("trades".into(), "true".into());
        let orders = self.private(creds, "/0/private/QueryOrders", form).await?;
        let order = orders
            .get(&txid)
            .cloned()
            .ok_or_else(|| ExchangeError::Call("QueryOrders missing order".into()))?;

        let executed = field_f64(&order, "vol_exec");
        let price = field_f64(&order, "price");
        let fee = field_f64(&order, "fee");
        let cost = field_f64(&order, "cost");
        // Kraken charges fees in the quote currency.
        let (tok_diff, cur_diff) = match side {
            Side::Buy => (executed, -(cost + fee)),
            Side::Sell => (-executed, cost - fee),
        };

        Ok(FilledOrder {
            side,
            price,
            volume: executed,
            tok_diff,
            cur_diff,
            fee,
            fee_asset: pair.quote.clone(),
            date: field_f64(&order, "closetm") as i64,
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
        let mut form = BTreeMap::new();
        form.insert("pair".into(), altname(pair));
        form.insert("type".into(), side.to_string().to_lowercase());
        form.insert("ordertype".into(), "limit".into());
        form.insert("volume".into(), format!("{volume}"));
        form.insert("price".into(), format!("{price}"));
        if let Some(cid) = client_order_id {
            form.insert("cl_ord_id".into(), cid.to_string());
        }

        let result = self.private(creds, "/0/private/AddOrder", form).await?;
        result
            .get("txid")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ExchangeError::Call("AddOrder returned no txid".into()))
    }

    async fn stoploss_order(
        &self,
        creds: &Credentials,
        pair: &Pair,
        volume: f64,
        stop_price: f64,
        client_order_id: Option<&str>,
    ) -> ExResult<String> {
        let mut form = BTreeMap::new();
        form.insert("pair".into(), altname(pair));
        form.insert("type".into(), "sell".into());
        form.insert("ordertype".into(), "stop-loss".into());
        form.insert("volume".into(), format!("{volume}"));
        form.insert("price".into(), format!("{stop_price}"));
        if let Some(cid) = client_order_id {
            form.insert("cl_ord_id".into(), cid.to_string());
        }

        let result = self.private(creds, "/0/private/AddOrder", form).await?;
        result
            .get("txid")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ExchangeError::Call("AddOrder returned no txid".into()))
    }

    async fn limit_details(
        &self,
        creds: &Credentials,
        _pair: &Pair,
        txid: &str,
    ) -> ExResult<LimitDetails> {
        let mut form = BTreeMap::new();
        form.insert("txid".into(), txid.to_string());
        let orders = self.private(creds, "/0/private/QueryOrders", form).await?;
        let order = orders
            .as_object()
            .and_then(|o| o.values().next())
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(txid.to_string()))?;

        let orig = field_f64(&order, "vol");
        let executed = field_f64(&order, "vol_exec");
        Ok(LimitDetails {
            exec_volume: executed,
            exec_fraction: if orig > 0.0 { executed / orig } else { 0.0 },
            price: field_f64(&order, "price"),
            date: field_f64(&order, "closetm") as i64,
        })
    }

    async fn cancel_order(&self, creds: &Credentials, _pair: &Pair, txid: &str) -> ExResult<()> {
        let mut form = BTreeMap::new();
        form.insert("txid".into(), txid.to_string());
        match self.private(creds, "/0/private/CancelOrder", form).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::OrderNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Quote-denominated fee schedule, taker tier.
    fn fee_rate(&self) -> f64 {
        0.0026
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_mapping_round_trips() {
        assert_eq!(kraken_asset("BTC"), "XBT");
        assert_eq!(canonical_asset("XXBT"), "BTC");
        assert_eq!(canonical_asset("ZUSD"), "USD");
        assert_eq!(canonical_asset("XRP"), "XRP");
        assert_eq!(altname(&Pair::new("BTC", "USDT")), "XBTUSDT");
    }

    #[test]
    fn error_strings_classify() {
        assert!(matches!(
            map_kraken_error(&["EAPI:Invalid key".into()]),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            map_kraken_error(&["EOrder:Insufficient funds".into()]),
            ExchangeError::InsufficientBalance(_)
        ));
        assert!(matches!(
            map_kraken_error(&["EAPI:Rate limit exceeded".into()]),
            ExchangeError::RateLimit(_)
        ));
        assert!(matches!(
            map_kraken_error(&["EOrder:Unknown order".into()]),
            ExchangeError::OrderNotFound(_)
        ));
    }
}
