use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Dev
    }
}

/// One exchange the realtime loop drives: which markets and candle
/// intervals its worker iterates.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeCfg {
    pub name: String,
    /// "BTC:USDT" pairs.
    pub markets: Vec<String>,
    /// "1h", "4h", ...
    pub intervals: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerCfg {
    /// Target delay between realtime loop starts, seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Exchange worker pool size; the RT_THREADS env var overrides this.
    #[serde(default = "default_rt_threads")]
    pub rt_threads: usize,
    /// Watchdog poll interval, seconds.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    /// Stats loop cadence, seconds.
    #[serde(default = "default_stats_secs")]
    pub stats_secs: u64,
}

fn default_tick_secs() -> u64 {
    60
}
fn default_rt_threads() -> usize {
    4
}
fn default_watchdog_secs() -> u64 {
    10
}
fn default_stats_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyCfg {
    /// Request distribution entrypoint; unset means direct requests only.
    #[serde(default)]
    pub entrypoint: Option<String>,
    /// Sleep applied when the local sliding window is saturated, seconds.
    #[serde(default = "default_overload_delay")]
    pub overload_delay_secs: f64,
}

fn default_overload_delay() -> f64 {
    2.0
}

impl Default for ProxyCfg {
    fn default() -> Self {
        Self { entrypoint: None, overload_delay_secs: default_overload_delay() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceCfg {
    pub sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminCfg {
    pub bind: String,
    pub require_token: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityCfg {
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: Environment,
    pub exchanges: Vec<ExchangeCfg>,
    pub scheduler: SchedulerCfg,
    #[serde(default)]
    pub proxy: ProxyCfg,
    pub persistence: PersistenceCfg,
    pub admin: AdminCfg,
    pub observability: ObservabilityCfg,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config.example").required(false))
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__"));

        if let Ok(path) = std::env::var("BOT_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let mut cfg: AppConfig = builder
            .build()
            .context("failed to build config")?
            .try_deserialize()
            .context("failed to deserialize config")?;

        // Bare env vars kept for deployment compatibility.
        if let Ok(ep) = std::env::var("PROXY_ENTRYPOINT") {
            if !ep.is_empty() {
                cfg.proxy.entrypoint = Some(ep);
            }
        }
        if let Ok(n) = std::env::var("RT_THREADS") {
            cfg.scheduler.rt_threads = n.parse().context("RT_THREADS must be an integer")?;
        }
        if let Ok(env) = std::env::var("ENVIRONMENT") {
            cfg.environment = match env.as_str() {
                "prod" => Environment::Prod,
                "staging" => Environment::Staging,
                _ => Environment::Dev,
            };
        }

        Ok(cfg)
    }
}
