use crate::botrun::BotRunner;
use crate::config::{AppConfig, ExchangeCfg};
use crate::events::EventBus;
use crate::exchange::filters::FilterCache;
use crate::exchange::transport::Transport;
use crate::exchange::{build_exchange, Exchange};
use crate::market_store::MarketStore;
use crate::persistence::{
    SqliteStore, NS_BOTS, NS_GLOBALS, NS_PROFILE_PORTFOLIOS, NS_USERS,
};
use crate::types::{now, Bot, MarketId, Pair, UserProfile};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Globals key polled by the realtime loop; setting it true forces the
/// exchange clients and market stores to be rebuilt next iteration.
pub const RELOAD_FLAG: &str = "reload_environments";

/// Shared wiring for every scheduler task.
pub struct Scheduler {
    pub cfg: AppConfig,
    pub store: SqliteStore,
    pub bus: Arc<EventBus>,
    pub transport: Arc<Transport>,
    pub filters: Arc<FilterCache>,
    /// Flipped after the first full realtime pass; feeds /readyz.
    pub ready: Arc<AtomicBool>,
}

struct Supervised {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(cfg: AppConfig, store: SqliteStore, bus: Arc<EventBus>) -> Self {
        let transport = Arc::new(Transport::new(&cfg.proxy));
        Self {
            cfg,
            store,
            bus,
            transport,
            filters: Arc::new(FilterCache::new()),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Watchdog parent: spawn the realtime and stats loops, restart any
    /// that die, and tear everything down on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let spawn = |this: Arc<Self>, name: &'static str| -> Supervised {
            let handle = match name {
                "realtime" => tokio::spawn(async move { this.realtime_loop().await }),
                "public-stats" => tokio::spawn(async move { this.public_stats_loop().await }),
                _ => tokio::spawn(async move { this.user_stats_loop().await }),
            };
            Supervised { name, handle }
        };

        let mut tasks = vec![
            spawn(self.clone(), "realtime"),
            spawn(self.clone(), "public-stats"),
            spawn(self.clone(), "user-stats"),
        ];
        let poll = Duration::from_secs(self.cfg.scheduler.watchdog_secs);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        for t in &tasks {
                            t.handle.abort();
                        }
                        tracing::info!("scheduler shut down");
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(poll) => {
                    for t in &mut tasks {
                        if t.handle.is_finished() {
                            tracing::warn!(task = t.name, "task died; restarting");
                            *t = spawn(self.clone(), t.name);
                        }
                    }
                }
            }
        }
    }

    /// The realtime loop: one pass over every exchange per tick, with
    /// adaptive pacing toward `tick_secs` between loop starts.
    async fn realtime_loop(self: &Arc<Self>) {
        let target = Duration::from_secs(self.cfg.scheduler.tick_secs);
        let mut exchanges = self.build_exchanges();

        loop {
            let started = Instant::now();

            if self.take_reload_flag().await {
                tracing::info!("reload flag set; rebuilding exchange clients");
                exchanges = self.build_exchanges();
            }

            let mut workers = Vec::new();
            for (cfg, exchange) in &exchanges {
                let this = self.clone();
                let cfg = cfg.clone();
                let exchange = exchange.clone();
                workers.push(tokio::spawn(async move {
                    let (ran, total) = this.run_exchange_tick(&cfg, &exchange).await;
                    tracing::info!(exchange = %cfg.name, ran, total, "exchange tick complete");
                }));
            }
            for w in workers {
                if let Err(e) = w.await {
                    tracing::error!(error = %e, "exchange worker panicked");
                }
            }
            self.ready.store(true, Ordering::Relaxed);

            let elapsed = started.elapsed();
            if elapsed >= target {
                tracing::warn!(?elapsed, "realtime tick overran; continuing immediately");
            } else {
                tokio::time::sleep(target - elapsed).await;
            }
        }
    }

    fn build_exchanges(&self) -> Vec<(ExchangeCfg, Arc<dyn Exchange>)> {
        let mut out = Vec::new();
        for cfg in &self.cfg.exchanges {
            match build_exchange(&cfg.name, self.transport.clone()) {
                Ok(ex) => out.push((cfg.clone(), ex)),
                Err(e) => tracing::error!(exchange = %cfg.name, error = %e, "skipping exchange"),
            }
        }
        out
    }

    async fn take_reload_flag(&self) -> bool {
        let set: bool = self
            .store
            .get(NS_GLOBALS, RELOAD_FLAG)
            .await
            .ok()
            .flatten()
            .unwrap_or(false);
        if set {
            if let Err(e) = self.store.put(NS_GLOBALS, RELOAD_FLAG, &false).await {
                tracing::warn!(error = %e, "failed to clear reload flag");
            }
        }
        set
    }

    /// One exchange, one tick: update every market clock, then run every
    /// matching bot sequentially so exchange access stays serialized.
    /// Returns (bots ran, bots matched).
    pub async fn run_exchange_tick(
        &self,
        cfg: &ExchangeCfg,
        exchange: &Arc<dyn Exchange>,
    ) -> (usize, usize) {
        let runner = BotRunner::new(
            self.store.clone(),
            self.bus.clone(),
            self.filters.clone(),
            Some("TF".into()),
        );
        let mut ran = 0usize;
        let mut total = 0usize;

        for market in &cfg.markets {
            let pair = match Pair::parse(market) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(market, error = %e, "bad market in config");
                    continue;
                }
            };
            for interval in &cfg.intervals {
                let id = MarketId::new(&cfg.name, pair.clone(), interval);
                let mut store = match MarketStore::load(&self.store, id.clone()).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(market = %id, error = %e, "market store load failed");
                        continue;
                    }
                };

                let changed = match store.update(exchange).await {
                    Ok((fresh, changed)) => {
                        if fresh > 0 {
                            tracing::debug!(market = %id, fresh, "candles advanced");
                        }
                        changed
                    }
                    Err(e) => {
                        tracing::warn!(market = %id, error = %e, "candle update failed");
                        false
                    }
                };
                if !changed {
                    continue;
                }

                let (r, t) = self.run_market_bots(&runner, exchange, &id, &store).await;
                ran += r;
                total += t;

                if let Err(e) = store.persist(&self.store).await {
                    tracing::error!(market = %id, error = %e, "market store persist failed");
                }
            }
        }
        (ran, total)
    }

    /// Run every enabled bot bound to this market id. Each bot is re-read
    /// and written back under its advisory lock.
    async fn run_market_bots(
        &self,
        runner: &BotRunner,
        exchange: &Arc<dyn Exchange>,
        id: &MarketId,
        market: &MarketStore,
    ) -> (usize, usize) {
        let bots: HashMap<String, Bot> = match self.store.get_all(NS_BOTS).await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to load bots");
                return (0, 0);
            }
        };
        let matching: Vec<String> = bots
            .into_iter()
            .filter(|(_, b)| {
                b.enabled
                    && b.exchange == id.exchange
                    && b.market == id.pair
                    && b.candles == id.interval
            })
            .map(|(k, _)| k)
            .collect();
        let total = matching.len();
        let mut ran = 0usize;
        let holder = format!("rt-{}", std::process::id());

        for bot_id in matching {
            if let Err(e) = self.store.lock(NS_BOTS, &bot_id, &holder).await {
                tracing::warn!(bot = %bot_id, error = %e, "skipping locked bot");
                continue;
            }
            let outcome = self.run_locked_bot(runner, exchange, &bot_id, market).await;
            if let Err(e) = self.store.unlock(NS_BOTS, &bot_id, &holder).await {
                tracing::warn!(bot = %bot_id, error = %e, "unlock failed");
            }
            match outcome {
                Ok(true) => ran += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(bot = %bot_id, error = %e, "bot tick error"),
            }
        }
        (ran, total)
    }

    async fn run_locked_bot(
        &self,
        runner: &BotRunner,
        exchange: &Arc<dyn Exchange>,
        bot_id: &str,
        market: &MarketStore,
    ) -> Result<bool> {
        // Re-read under the lock; the record may have changed since the
        // match scan.
        let Some(mut bot) = self.store.get::<Bot>(NS_BOTS, bot_id).await? else {
            return Ok(false);
        };
        if !bot.enabled {
            return Ok(false);
        }
        let profile: UserProfile = self
            .store
            .get(NS_USERS, &bot.user)
            .await?
            .unwrap_or_default();
        let creds = match profile.credentials_for(&bot.exchange) {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                tracing::warn!(bot = %bot.id, error = %e, "malformed credentials");
                return Ok(false);
            }
            None => {
                tracing::warn!(bot = %bot.id, user = %bot.user, "no credentials for exchange");
                return Ok(false);
            }
        };

        let result = runner.run_bot_tick(&mut bot, exchange, &creds, market).await;
        // The mutated copy is written back even on a failed tick so
        // reconciled fills and disables are never lost.
        self.store.put(NS_BOTS, bot_id, &bot).await?;
        result.map(|_| true)
    }

    /// Public aggregate stats, recomputed on a slow cadence. Read-only
    /// over bots.
    async fn public_stats_loop(self: &Arc<Self>) {
        let period = Duration::from_secs(self.cfg.scheduler.stats_secs);
        loop {
            match self.store.get_all::<Bot>(NS_BOTS).await {
                Ok(bots) => {
                    let enabled = bots.values().filter(|b| b.enabled).count();
                    let avg_roi = if bots.is_empty() {
                        0.0
                    } else {
                        bots.values().map(|b| b.bah_roi).sum::<f64>() / bots.len() as f64
                    };
                    let stats = serde_json::json!({
                        "time": now(),
                        "bots": bots.len(),
                        "enabled": enabled,
                        "avg_bah_roi": avg_roi,
                    });
                    if let Err(e) = self.store.put(NS_GLOBALS, "public_stats", &stats).await {
                        tracing::warn!(error = %e, "failed to store public stats");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "public stats scan failed"),
            }
            tokio::time::sleep(period).await;
        }
    }

    /// Per-user portfolio history, appended on the stats cadence.
    async fn user_stats_loop(self: &Arc<Self>) {
        let period = Duration::from_secs(self.cfg.scheduler.stats_secs);
        loop {
            if let Ok(bots) = self.store.get_all::<Bot>(NS_BOTS).await {
                let mut per_user: HashMap<String, f64> = HashMap::new();
                for bot in bots.values() {
                    *per_user.entry(bot.user.clone()).or_default() +=
                        bot.state.portfolio_value;
                }
                for (user, value) in per_user {
                    let mut history: HashMap<i64, f64> = self
                        .store
                        .get(NS_PROFILE_PORTFOLIOS, &user)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    history.insert(now(), value);
                    if let Err(e) =
                        self.store.put(NS_PROFILE_PORTFOLIOS, &user, &history).await
                    {
                        tracing::warn!(user, error = %e, "failed to store profile portfolio");
                    }
                }
            }
            tokio::time::sleep(period).await;
        }
    }
}
