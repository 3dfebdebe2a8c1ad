use crate::config::ProxyCfg;
use crate::exchange::cache::TtlCache;
use crate::exchange::{ExResult, ExchangeError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// One outbound exchange request plus its rate-accounting metadata.
pub struct RequestSpec {
    pub method: Method,
    /// Scheme + host, e.g. "https://api.binance.com".
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Exchange tag, used by the proxy entrypoint for per-venue routing.
    pub tag: String,
    pub weight: u32,
    pub rate_limit: u32,
    pub rate_period: Duration,
}

impl RequestSpec {
    pub fn get(host: &str, path: &str, tag: &str) -> Self {
        Self {
            method: Method::Get,
            host: host.to_string(),
            path: path.to_string(),
            query: None,
            body: None,
            headers: Vec::new(),
            tag: tag.to_string(),
            weight: 1,
            rate_limit: 1200,
            rate_period: Duration::from_secs(60),
        }
    }

    pub fn post(host: &str, path: &str, tag: &str) -> Self {
        Self { method: Method::Post, ..Self::get(host, path, tag) }
    }

    pub fn delete(host: &str, path: &str, tag: &str) -> Self {
        Self { method: Method::Delete, ..Self::get(host, path, tag) }
    }

    pub fn query(mut self, q: String) -> Self {
        self.query = Some(q);
        self
    }

    pub fn body(mut self, b: String) -> Self {
        self.body = Some(b);
        self
    }

    pub fn header(mut self, k: &str, v: String) -> Self {
        self.headers.push((k.to_string(), v));
        self
    }

    pub fn weight(mut self, w: u32) -> Self {
        self.weight = w;
        self
    }

    pub fn budget(mut self, limit: u32, period: Duration) -> Self {
        self.rate_limit = limit;
        self.rate_period = period;
        self
    }

    fn url(&self) -> String {
        match &self.query {
            Some(q) => format!("{}{}?{}", self.host, self.path, q),
            None => format!("{}{}", self.host, self.path),
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Deserialize)]
struct HostLoad {
    weight: f64,
    peers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Proxied { delayed: bool },
    Direct { delayed: bool },
}

/// Netload cascade: a saturated entrypoint (load > 1.0) is bypassed
/// after a cooldown; a busy one (> 0.9) is still used, delayed.
fn route_for(load: f64) -> Route {
    if load > 1.0 {
        Route::Direct { delayed: true }
    } else if load > 0.9 {
        Route::Proxied { delayed: true }
    } else {
        Route::Proxied { delayed: false }
    }
}

/// Outbound request router. With a proxy entrypoint configured, requests
/// are wrapped and distributed across the entrypoint's public IPs; without
/// one (or when the entrypoint is saturated) requests go direct under a
/// local sliding-window weight counter.
pub struct Transport {
    client: reqwest::Client,
    entrypoint: Option<String>,
    overload_delay: Duration,
    /// Proxy netload per host, probe cached for 2 s across all callers.
    netload: TtlCache<String, f64>,
    /// Per-host queued weights with expiry instants.
    windows: Mutex<HashMap<String, VecDeque<(Instant, u32)>>>,
}

impl Transport {
    pub fn new(proxy: &ProxyCfg) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            entrypoint: proxy.entrypoint.clone(),
            overload_delay: Duration::from_secs_f64(proxy.overload_delay_secs),
            netload: TtlCache::new(64, Duration::from_secs(2)),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a request, returning status + parsed JSON body. Transport-level
    /// failures (connect, timeout, non-JSON body) map into the taxonomy;
    /// HTTP error statuses are returned for the caller to interpret.
    pub async fn request(&self, spec: RequestSpec) -> ExResult<HttpResponse> {
        if self.entrypoint.is_none() {
            return self.direct(spec).await;
        }
        let load = self.probe_netload(&spec.host).await;
        match route_for(load) {
            Route::Direct { delayed } => {
                if delayed {
                    tokio::time::sleep(self.overload_delay).await;
                }
                self.direct(spec).await
            }
            Route::Proxied { delayed } => {
                if delayed {
                    tokio::time::sleep(self.overload_delay).await;
                }
                self.proxied(spec).await
            }
        }
    }

    /// Convenience wrapper mapping any non-2xx into the default taxonomy.
    pub async fn request_ok(&self, spec: RequestSpec) -> ExResult<Value> {
        let resp = self.request(spec).await?;
        if resp.is_success() {
            Ok(resp.body)
        } else {
            Err(map_http_status(resp.status, &resp.body))
        }
    }

    async fn probe_netload(&self, host: &str) -> f64 {
        if let Some(load) = self.netload.get(&host.to_string()) {
            return load;
        }
        let entrypoint = match &self.entrypoint {
            Some(ep) => ep.clone(),
            None => return 0.0,
        };
        let url = format!("{}/status", entrypoint.trim_end_matches('/'));
        let load = match self.client.get(&url).send().await {
            Ok(resp) => match resp.json::<HashMap<String, HostLoad>>().await {
                Ok(hosts) => hosts
                    .get(host)
                    .map(|h| h.weight / h.peers.max(1) as f64)
                    .unwrap_or(0.0),
                Err(e) => {
                    tracing::warn!(error = ?e, "netload probe returned bad body");
                    0.0
                }
            },
            Err(e) => {
                // Unreachable entrypoint counts as idle; the caller falls
                // through to proxy mode and the entrypoint's own errors
                // surface there.
                tracing::warn!(error = ?e, "netload probe failed");
                0.0
            }
        };
        self.netload.put(host.to_string(), load);
        load
    }

    async fn proxied(&self, spec: RequestSpec) -> ExResult<HttpResponse> {
        let entrypoint = self
            .entrypoint
            .as_ref()
            .ok_or_else(|| ExchangeError::Call("proxy mode without entrypoint".into()))?;

        let wrapped = serde_json::json!({
            "method": spec.method.as_str(),
            "host": spec.host,
            "path": spec.path,
            "query": spec.query,
            "body": spec.body,
            "headers": spec.headers,
            "tag": spec.tag,
            "weight": spec.weight,
            "rate_limit": spec.rate_limit,
            "rate_period_secs": spec.rate_period.as_secs(),
        });

        let resp = self
            .client
            .post(entrypoint)
            .json(&wrapped)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(map_http_status(status, &Value::Null));
        }

        // The entrypoint echoes the upstream status alongside the body.
        let envelope: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Call(format!("proxy envelope decode: {e}")))?;
        let upstream_status = envelope
            .get("status")
            .and_then(Value::as_u64)
            .unwrap_or(200) as u16;
        let body = envelope.get("body").cloned().unwrap_or(Value::Null);
        Ok(HttpResponse { status: upstream_status, body })
    }

    async fn direct(&self, spec: RequestSpec) -> ExResult<HttpResponse> {
        self.await_window(&spec.host, spec.weight, spec.rate_limit, spec.rate_period)
            .await;

        let url = spec.url();
        let mut req = match spec.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        for (k, v) in &spec.headers {
            req = req.header(k, v);
        }
        if let Some(body) = &spec.body {
            req = req
                .header("content-type", "application/x-www-form-urlencoded")
                .body(body.clone());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(HttpResponse { status, body })
    }

    /// Sliding-window weight accounting: when the queued weight inside the
    /// window would exceed the budget, sleep before issuing.
    async fn await_window(&self, host: &str, weight: u32, limit: u32, period: Duration) {
        loop {
            let saturated = {
                let mut windows = self.windows.lock().unwrap();
                let q = windows.entry(host.to_string()).or_default();
                let now = Instant::now();
                while q.front().map(|(exp, _)| *exp <= now).unwrap_or(false) {
                    q.pop_front();
                }
                let in_window: u32 = q.iter().map(|(_, w)| *w).sum();
                if in_window + weight > limit {
                    true
                } else {
                    q.push_back((now + period, weight));
                    false
                }
            };
            if !saturated {
                return;
            }
            tracing::debug!(host, "rate window saturated; sleeping");
            tokio::time::sleep(self.overload_delay).await;
        }
    }
}

/// Default mapping from HTTP status to the error taxonomy.
pub fn map_http_status(status: u16, body: &Value) -> ExchangeError {
    let detail = match body {
        Value::Null => format!("http {status}"),
        other => format!("http {status}: {other}"),
    };
    match status {
        401 | 403 => ExchangeError::Auth(detail),
        418 | 429 => ExchangeError::RateLimit(detail),
        404 => ExchangeError::OrderNotFound(detail),
        s if s >= 500 => ExchangeError::Internal(detail),
        _ => ExchangeError::Call(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert!(matches!(map_http_status(401, &Value::Null), ExchangeError::Auth(_)));
        assert!(matches!(map_http_status(429, &Value::Null), ExchangeError::RateLimit(_)));
        assert!(matches!(map_http_status(503, &Value::Null), ExchangeError::Internal(_)));
        assert!(matches!(map_http_status(400, &Value::Null), ExchangeError::Call(_)));
        assert!(matches!(map_http_status(404, &Value::Null), ExchangeError::OrderNotFound(_)));
    }

    #[test]
    fn netload_cascade_picks_the_route() {
        // Saturated: bypass the entrypoint after the overload sleep.
        assert_eq!(route_for(1.2), Route::Direct { delayed: true });
        // Busy: still proxied, delayed.
        assert_eq!(route_for(0.95), Route::Proxied { delayed: true });
        // Idle, and the 0.9 boundary itself, go straight through.
        assert_eq!(route_for(0.9), Route::Proxied { delayed: false });
        assert_eq!(route_for(0.0), Route::Proxied { delayed: false });
    }

    #[tokio::test]
    async fn seeded_netload_skips_the_probe() {
        // The entrypoint is unreachable; a cached load means it is never
        // contacted within the 2 s window.
        let t = Transport::new(&ProxyCfg {
            entrypoint: Some("http://127.0.0.1:1".into()),
            overload_delay_secs: 0.01,
        });
        t.netload.put("https://api.binance.com".to_string(), 1.2);
        let load = t.probe_netload("https://api.binance.com").await;
        assert!((load - 1.2).abs() < 1e-12);
        assert_eq!(route_for(load), Route::Direct { delayed: true });
    }

    #[tokio::test]
    async fn sliding_window_admits_up_to_limit() {
        let t = Transport::new(&ProxyCfg {
            entrypoint: None,
            overload_delay_secs: 0.01,
        });
        let started = Instant::now();
        for _ in 0..5 {
            t.await_window("h", 1, 5, Duration::from_millis(50)).await;
        }
        // Five weights fit the budget without sleeping.
        assert!(started.elapsed() < Duration::from_millis(40));
        // The sixth has to wait for the window to roll.
        t.await_window("h", 1, 5, Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
