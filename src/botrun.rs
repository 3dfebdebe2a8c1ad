use crate::events::{
    ErrorCtx, EventBus, EventPayload, ScopedBus, EVT_CLIENT_ORDER_ID_FAIL, EVT_ERROR,
    EVT_FAILED_AUTH, EVT_FAIL_EXCHANGE, EVT_FILLED, EVT_INSUFFICIENT_BALANCE, EVT_STOPLOSS,
};
use crate::exchange::filters::FilterCache;
use crate::exchange::{Exchange, ExchangeError};
use crate::market_store::MarketStore;
use crate::orders::OrderEngine;
use crate::persistence::{SqliteStore, NS_AUTH, NS_BOT_PORTFOLIOS, NS_NOTIFICATIONS};
use crate::strategy::{build_strategy, TradeCtx};
use crate::types::{now, Bot, Credentials, Notification, PriceDict};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Auth-failure notifications repeat at most once per (user, exchange)
/// within this window.
const AUTH_NOTIFY_COOLDOWN_SECS: i64 = 48 * 3600;
/// Binance rate limits aggressively enough that transient auth noise is
/// common; its bots are exempt from auto-disable.
const DISABLE_EXEMPT_EXCHANGE: &str = "binance";

/// Error kinds that consume the per-bot 24 h budget.
fn budgeted(event: &str) -> bool {
    event == EVT_INSUFFICIENT_BALANCE || event == EVT_FAILED_AUTH
}

/// Budget size scales inversely with the candle interval: one error per
/// candle over 24 h.
pub fn error_budget(interval_secs: i64) -> usize {
    ((86_400 / interval_secs.max(1)) as usize).max(1)
}

/// Runs single-bot ticks and carries the cross-tick side tables: error
/// budgets, notification cooldowns, portfolio history.
pub struct BotRunner {
    pub store: SqliteStore,
    pub bus: Arc<EventBus>,
    pub filters: Arc<FilterCache>,
    pub broker_tag: Option<String>,
    prices: OnceCell<PriceDict>,
}

/// Events observed during one tick, drained after the scope closes.
type EventLog = Arc<Mutex<Vec<(String, String)>>>;

impl BotRunner {
    pub fn new(
        store: SqliteStore,
        bus: Arc<EventBus>,
        filters: Arc<FilterCache>,
        broker_tag: Option<String>,
    ) -> Self {
        Self { store, bus, filters, broker_tag, prices: OnceCell::new() }
    }

    /// Fetched once per runner; fee valuation tolerates staleness.
    async fn market_prices(&self, exchange: &Arc<dyn Exchange>) -> PriceDict {
        self.prices
            .get_or_init(|| async {
                match exchange.market_prices().await {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!(error = %e, "market prices unavailable");
                        PriceDict::new()
                    }
                }
            })
            .await
            .clone()
    }

    fn observe(scope: &ScopedBus, log: &EventLog) {
        for event in [
            EVT_FILLED,
            EVT_STOPLOSS,
            EVT_INSUFFICIENT_BALANCE,
            EVT_FAILED_AUTH,
            EVT_CLIENT_ORDER_ID_FAIL,
            EVT_FAIL_EXCHANGE,
        ] {
            let log = log.clone();
            let name = event.to_string();
            scope.once(event, move |payload| {
                let detail = match payload {
                    EventPayload::Error(ctx) => ctx.detail.clone(),
                    EventPayload::Fill(f) => format!("{} {} @ {}", f.side, f.amount, f.price),
                    EventPayload::StopLoss(f) => format!("stop sold {} @ {}", f.volume, f.price),
                    EventPayload::ClientOrderIdFail { cid, err_type, .. } => {
                        format!("{cid}: {err_type}")
                    }
                    EventPayload::Message(m) => m.clone(),
                };
                log.lock().unwrap().push((name.clone(), detail));
                Ok(())
            });
        }
        // Generic sink so listener failures are visible per tick.
        scope.on(EVT_ERROR, |payload| {
            if let EventPayload::Message(m) = payload {
                tracing::error!(detail = %m, "tick error event");
            }
            Ok(())
        });
    }

    /// One bot, one tick, on a market that reported new candles. The bot
    /// copy is mutated locally; the caller persists it afterwards.
    pub async fn run_bot_tick(
        &self,
        bot: &mut Bot,
        exchange: &Arc<dyn Exchange>,
        creds: &Credentials,
        market: &MarketStore,
    ) -> Result<()> {
        let Some(current_price) = market.last_close() else { return Ok(()) };
        let candle_low = market.get_window(1, 0).first().map(|c| c.low).unwrap_or(0.0);
        let interval = market.interval_secs();

        let mut strategy = build_strategy(
            &bot.strategy,
            &bot.strategy_params,
            bot.internal_state.as_deref(),
        )?;
        let filter = self.filters.get(exchange, &bot.market).await?;
        let prices = self.market_prices(exchange).await;

        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let pair = bot.market.clone();
        let outcome = {
            let scope = ScopedBus::new(self.bus.clone());
            Self::observe(&scope, &log);

            let engine = OrderEngine {
                exchange,
                creds,
                pair: &pair,
                bus: scope.bus(),
                filter,
                err_ctx: ErrorCtx {
                    bot_id: bot.id.clone(),
                    user: bot.user.clone(),
                    exchange: bot.exchange.clone(),
                    detail: String::new(),
                },
                broker_tag: self.broker_tag.clone(),
                prices,
            };

            self.run_scoped(bot, &engine, &mut *strategy, market, current_price, candle_low)
                .await
            // Scope drops here: every one-shot handler detaches.
        };

        if let Err(e) = &outcome {
            tracing::warn!(bot = %bot.id, error = %e, "bot tick failed");
        }

        bot.internal_state = strategy.dumps().or(bot.internal_state.take());
        if bot.starting_price > 0.0 {
            bot.bah_roi = (current_price - bot.starting_price) / bot.starting_price;
        }
        bot.state.last_trade_attempt = now();

        let portfolio = bot.state.portfolio(current_price);
        bot.state.portfolio_value = portfolio;
        bot.state.max_balance = bot.state.max_balance.max(portfolio);
        bot.state.min_balance = bot.state.min_balance.min(portfolio);

        self.append_portfolio_point(&bot.id, portfolio).await;
        let events = log.lock().unwrap().clone();
        self.settle_events(bot, interval, &events).await;
        outcome
    }

    async fn run_scoped(
        &self,
        bot: &mut Bot,
        engine: &OrderEngine<'_>,
        strategy: &mut dyn crate::strategy::Strategy,
        market: &MarketStore,
        current_price: f64,
        candle_low: f64,
    ) -> Result<()> {
        let report = match engine.reconcile(&mut bot.state, current_price, candle_low).await {
            Ok(r) => r,
            Err(ExchangeError::RateLimit(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if report.stoploss_fired {
            self.stop_out(bot).await;
            return Ok(());
        }

        let window = market.get_window(400, 0);
        let mut ctx = TradeCtx {
            engine,
            metrics: &mut bot.state,
            window,
            interval_secs: market.interval_secs(),
        };
        let outcome = match strategy.step(&mut ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Strategy failures skip the bot this tick, never disable.
                if e.downcast_ref::<ExchangeError>().is_none() {
                    tracing::warn!(bot = %bot.id, error = %e, "strategy error; skipping tick");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        };

        // Trailing bookkeeping runs after the strategy, so a high set by
        // a same-tick fill moves the stop this tick, not next.
        let fired = match engine.manage_stop_loss(bot, current_price).await {
            Ok(f) => f,
            Err(ExchangeError::RateLimit(_)) => false,
            Err(e) => return Err(e.into()),
        };
        if fired {
            self.stop_out(bot).await;
        }
        outcome
    }

    async fn stop_out(&self, bot: &mut Bot) {
        bot.disable(now());
        self.notify(
            &bot.user,
            Notification::system(
                "Stop-loss triggered",
                &format!("Bot {} on {} closed out and stopped.", bot.id, bot.market),
            ),
        )
        .await;
    }

    /// Convert recorded events into notifications and budget accounting.
    async fn settle_events(&self, bot: &mut Bot, interval: i64, events: &[(String, String)]) {
        let mut budget_hits = 0usize;
        for (event, detail) in events {
            if budgeted(event) {
                budget_hits += 1;
            }
            if event == EVT_FAILED_AUTH {
                self.notify_auth_failure(&bot.user, &bot.exchange, detail).await;
            }
        }
        if budget_hits == 0 {
            return;
        }

        let key = bot.id.clone();
        let cutoff = now() - 86_400;
        let mut history: Vec<i64> = self
            .store
            .get("bot_errors", &key)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        history.retain(|t| *t > cutoff);
        for _ in 0..budget_hits {
            history.push(now());
        }
        if let Err(e) = self.store.put("bot_errors", &key, &history).await {
            tracing::warn!(bot = %key, error = %e, "failed to persist error history");
        }

        if history.len() > error_budget(interval)
            && bot.exchange != DISABLE_EXEMPT_EXCHANGE
            && bot.enabled
        {
            bot.disable(now());
            self.notify(
                &bot.user,
                Notification::system(
                    "Bot disabled after repeated errors",
                    &format!(
                        "Bot {} on {} hit {} errors in 24h and was stopped.",
                        bot.id,
                        bot.exchange,
                        history.len()
                    ),
                ),
            )
            .await;
        }
    }

    async fn notify_auth_failure(&self, user: &str, exchange: &str, detail: &str) {
        let key = format!("{user}:{exchange}");
        let last: Option<i64> = self.store.get(NS_AUTH, &key).await.ok().flatten();
        if last.map(|t| now() - t < AUTH_NOTIFY_COOLDOWN_SECS).unwrap_or(false) {
            return;
        }
        if let Err(e) = self.store.put(NS_AUTH, &key, &now()).await {
            tracing::warn!(error = %e, "failed to record auth-notify cooldown");
        }
        self.notify(
            user,
            Notification::system(
                "Exchange authentication failed",
                &format!("Your {exchange} API keys were rejected: {detail}"),
            ),
        )
        .await;
    }

    async fn notify(&self, user: &str, n: Notification) {
        let mut inbox: HashMap<String, Notification> = self
            .store
            .get(NS_NOTIFICATIONS, user)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        inbox.insert(n.id.clone(), n);
        if let Err(e) = self.store.put(NS_NOTIFICATIONS, user, &inbox).await {
            tracing::warn!(user, error = %e, "failed to store notification");
        }
    }

    async fn append_portfolio_point(&self, bot_id: &str, value: f64) {
        let mut history: HashMap<i64, f64> = self
            .store
            .get(NS_BOT_PORTFOLIOS, bot_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        history.insert(now(), value);
        if let Err(e) = self.store.put(NS_BOT_PORTFOLIOS, bot_id, &history).await {
            tracing::warn!(bot = bot_id, error = %e, "failed to store portfolio point");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_scales_with_interval() {
        assert_eq!(error_budget(4 * 3600), 6);
        assert_eq!(error_budget(3600), 24);
        assert_eq!(error_budget(7 * 86_400), 1);
    }

    #[test]
    fn only_auth_and_balance_errors_are_budgeted() {
        assert!(budgeted(EVT_INSUFFICIENT_BALANCE));
        assert!(budgeted(EVT_FAILED_AUTH));
        assert!(!budgeted(EVT_FAIL_EXCHANGE));
        assert!(!budgeted(EVT_FILLED));
    }
}
