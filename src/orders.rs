use crate::events::{ErrorCtx, EventBus, EventPayload, FillInfo};
use crate::events::{
    EVT_CLIENT_ORDER_ID_FAIL, EVT_FAILED_AUTH, EVT_FAIL_EXCHANGE, EVT_FILLED,
    EVT_INSUFFICIENT_BALANCE, EVT_STOPLOSS,
};
use crate::exchange::filters::preprocess;
use crate::exchange::{new_client_order_id, ExResult, Exchange, ExchangeError};
use crate::types::{
    now, Bot, Credentials, Filter, FilledOrder, Order, OrderKind, Pair, PriceDict, Side,
    TradeRecord, UserMetrics,
};
use std::sync::Arc;

/// Fill residue below this is treated as fully filled.
const FILL_EPSILON: f64 = 1e-8;
/// Stop-loss liquidations sell this fraction of the token balance; the
/// remainder absorbs lot quantization.
const STOPLOSS_SELL_FRACTION: f64 = 0.99;

/// What one reconcile pass did to the local order book.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    pub fills: usize,
    pub expiries: usize,
    pub stoploss_fired: bool,
}

/// Order placement and reconciliation for one (bot, tick). Local balances
/// are the source of truth between ticks; every exchange interaction keeps
/// them conserved, restoring reserves whenever an order fails to exist.
pub struct OrderEngine<'a> {
    pub exchange: &'a Arc<dyn Exchange>,
    pub creds: &'a Credentials,
    pub pair: &'a Pair,
    pub bus: &'a Arc<EventBus>,
    pub filter: Filter,
    pub err_ctx: ErrorCtx,
    pub broker_tag: Option<String>,
    /// Last-known prices, used to value fees paid in a third asset.
    pub prices: PriceDict,
}

impl<'a> OrderEngine<'a> {
    fn emit_error(&self, event: &str, detail: String) {
        let ctx = ErrorCtx { detail, ..self.err_ctx.clone() };
        self.bus.emit(event, &EventPayload::Error(ctx));
    }

    /// Reserve deduction at placement time. BUY locks quote at the order
    /// price, SELL locks base.
    fn take_reserves(m: &mut UserMetrics, side: Side, volume: f64, price: f64) {
        match side {
            Side::Buy => m.cur_balance -= volume * price,
            Side::Sell => m.tok_balance -= volume,
        }
    }

    fn restore_reserves(m: &mut UserMetrics, side: Side, volume: f64, price: f64) {
        match side {
            Side::Buy => m.cur_balance += volume * price,
            Side::Sell => m.tok_balance += volume,
        }
    }

    /// Route a placement failure: restore reserves, emit the matching
    /// events, and hand the error back for budget accounting.
    fn on_place_failure(
        &self,
        m: &mut UserMetrics,
        side: Side,
        volume: f64,
        price: f64,
        cid: &str,
        err: ExchangeError,
    ) -> ExchangeError {
        Self::restore_reserves(m, side, volume, price);
        match &err {
            ExchangeError::InsufficientBalance(d) | ExchangeError::Funds(d) => {
                self.emit_error(EVT_INSUFFICIENT_BALANCE, d.clone());
            }
            ExchangeError::Auth(d) => {
                self.emit_error(EVT_FAILED_AUTH, d.clone());
                self.emit_error(EVT_FAIL_EXCHANGE, d.clone());
            }
            ExchangeError::RateLimit(_) => {}
            other => {
                // The order may or may not exist server-side; surface the
                // client id so a reconciler can chase it.
                self.bus.emit(
                    EVT_CLIENT_ORDER_ID_FAIL,
                    &EventPayload::ClientOrderIdFail {
                        cid: cid.to_string(),
                        err_type: other.kind().to_string(),
                        ctx: self.err_ctx.detail.clone(),
                    },
                );
                self.emit_error(EVT_FAIL_EXCHANGE, other.to_string());
            }
        }
        err
    }

    /// Place a limit order. Returns the local txid, or None when the order
    /// failed the market's filter rules (nothing was sent).
    pub async fn place_limit(
        &self,
        m: &mut UserMetrics,
        side: Side,
        volume: f64,
        price: f64,
        close_price: f64,
        expire_secs: i64,
    ) -> ExResult<Option<String>> {
        let prepared = match preprocess(&self.filter, volume, close_price, Some(price)) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(bot = %self.err_ctx.bot_id, %e, "limit order rejected by filter");
                return Ok(None);
            }
        };
        let volume = prepared.volume;
        let price = prepared.price.unwrap_or(price);

        Self::take_reserves(m, side, volume, price);
        let cid = new_client_order_id(self.broker_tag.as_deref());

        let txid = match self
            .exchange
            .limit_order(self.creds, self.pair, side, volume, price, Some(&cid))
            .await
        {
            Ok(txid) => txid,
            Err(e) => return Err(self.on_place_failure(m, side, volume, price, &cid, e)),
        };

        let ts = now();
        m.open_orders.insert(
            txid.clone(),
            Order {
                kind: OrderKind::Limit,
                side,
                orig_volume: volume,
                remaining_volume: volume,
                price,
                create_time: ts,
                expire_time: ts + expire_secs,
                exchange_txid: Some(txid.clone()),
            },
        );
        Ok(Some(txid))
    }

    /// Place a stop-loss sell. On venues without native stops the order is
    /// held locally and synthesized off the candle low during reconcile.
    pub async fn place_stoploss(
        &self,
        m: &mut UserMetrics,
        volume: f64,
        stop_price: f64,
        close_price: f64,
        expire_secs: i64,
    ) -> ExResult<Option<String>> {
        let prepared = match preprocess(&self.filter, volume, close_price, Some(stop_price)) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(bot = %self.err_ctx.bot_id, %e, "stop order rejected by filter");
                return Ok(None);
            }
        };
        let volume = prepared.volume;
        let stop_price = prepared.price.unwrap_or(stop_price);

        Self::take_reserves(m, Side::Sell, volume, stop_price);

        let ts = now();
        let order = Order {
            kind: OrderKind::StopLoss,
            side: Side::Sell,
            orig_volume: volume,
            remaining_volume: volume,
            price: stop_price,
            create_time: ts,
            expire_time: ts + expire_secs,
            exchange_txid: None,
        };

        if !self.exchange.supports_native_stoploss() {
            let txid = new_client_order_id(self.broker_tag.as_deref());
            m.open_orders.insert(txid.clone(), order);
            return Ok(Some(txid));
        }

        let cid = new_client_order_id(self.broker_tag.as_deref());
        let txid = match self
            .exchange
            .stoploss_order(self.creds, self.pair, volume, stop_price, Some(&cid))
            .await
        {
            Ok(txid) => txid,
            Err(e) => {
                return Err(self.on_place_failure(m, Side::Sell, volume, stop_price, &cid, e))
            }
        };
        m.open_orders.insert(
            txid.clone(),
            Order { exchange_txid: Some(txid.clone()), ..order },
        );
        Ok(Some(txid))
    }

    /// Synchronous market order. The exchange response carries exact fees
    /// and average price; balances and the trade log are updated from it.
    pub async fn market(
        &self,
        m: &mut UserMetrics,
        side: Side,
        volume: f64,
        close_price: f64,
    ) -> ExResult<Option<FilledOrder>> {
        let prepared = match preprocess(&self.filter, volume, close_price, None) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(bot = %self.err_ctx.bot_id, %e, "market order rejected by filter");
                return Ok(None);
            }
        };

        let fill = match self
            .exchange
            .market_order(self.creds, self.pair, side, prepared.volume)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                match &e {
                    ExchangeError::InsufficientBalance(d) | ExchangeError::Funds(d) => {
                        self.emit_error(EVT_INSUFFICIENT_BALANCE, d.clone());
                    }
                    ExchangeError::Auth(d) => {
                        self.emit_error(EVT_FAILED_AUTH, d.clone());
                        self.emit_error(EVT_FAIL_EXCHANGE, d.clone());
                    }
                    ExchangeError::RateLimit(_) => {}
                    other => self.emit_error(EVT_FAIL_EXCHANGE, other.to_string()),
                }
                return Err(e);
            }
        };

        self.apply_fill(m, &fill, OrderKind::Market);
        Ok(Some(fill))
    }

    fn apply_fill(&self, m: &mut UserMetrics, fill: &FilledOrder, kind: OrderKind) {
        let before = m.portfolio(fill.price).max(FILL_EPSILON);
        m.tok_balance += fill.tok_diff;
        m.cur_balance += fill.cur_diff;
        let fee_in_quote = if fill.fee_asset == self.pair.quote {
            fill.fee
        } else if fill.fee_asset == self.pair.base {
            fill.fee * fill.price
        } else {
            // Fee paid in a third asset (e.g. an exchange token); value it
            // through the market graph.
            crate::convert::approx_value(&self.prices, &fill.fee_asset, &self.pair.quote, fill.fee)
        };
        m.in_fees += fee_in_quote;

        let after = m.portfolio(fill.price);
        let change = (after - before) / before;
        m.trade_log.push(TradeRecord {
            date: fill.date,
            price: fill.price,
            kind,
            side: fill.side,
            amount: fill.volume,
            fee: fill.fee,
            fee_asset: fill.fee_asset.clone(),
            change,
        });

        self.bus.emit(
            EVT_FILLED,
            &EventPayload::Fill(FillInfo {
                side: fill.side,
                amount: fill.volume,
                price: fill.price,
                order_type: kind,
                date: fill.date,
                fee: fill.fee,
                fee_asset: fill.fee_asset.clone(),
                balance_after: after,
                change,
            }),
        );
    }

    /// Credit one incremental limit-order fill. The exchange has already
    /// moved the funds; this mirrors the move locally, net of the taker fee.
    fn credit_partial(&self, m: &mut UserMetrics, order: &mut Order, delta: f64, price: f64) {
        let fee = self.exchange.fee_rate();
        order.remaining_volume -= delta;
        match order.side {
            Side::Buy => {
                m.tok_balance += delta * (1.0 - fee);
                m.in_fees += delta * price * fee;
            }
            Side::Sell => {
                m.cur_balance += delta * price * (1.0 - fee);
                m.in_fees += delta * price * fee;
            }
        }
    }

    fn emit_fill_event(&self, m: &UserMetrics, order: &Order, amount: f64, price: f64, date: i64) {
        let fee = amount * price * self.exchange.fee_rate();
        self.bus.emit(
            EVT_FILLED,
            &EventPayload::Fill(FillInfo {
                side: order.side,
                amount,
                price,
                order_type: order.kind,
                date,
                fee,
                fee_asset: self.pair.quote.clone(),
                balance_after: m.portfolio(price),
                change: 0.0,
            }),
        );
    }

    /// Poll every open order, apply partial fills, close out filled and
    /// expired orders, and synthesize stop triggers on venues without
    /// native stops.
    pub async fn reconcile(
        &self,
        m: &mut UserMetrics,
        current_price: f64,
        candle_low: f64,
    ) -> ExResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let txids: Vec<String> = m.open_orders.keys().cloned().collect();

        for txid in txids {
            let Some(mut order) = m.open_orders.get(&txid).cloned() else { continue };

            // Locally-held stop: trigger off the candle low.
            if order.kind == OrderKind::StopLoss && order.exchange_txid.is_none() {
                if candle_low < order.price {
                    Self::restore_reserves(
                        m,
                        order.side,
                        order.remaining_volume,
                        order.price,
                    );
                    m.open_orders.remove(&txid);
                    if let Some(fill) = self
                        .market(m, Side::Sell, order.remaining_volume, current_price)
                        .await?
                    {
                        self.bus.emit(EVT_STOPLOSS, &EventPayload::StopLoss(fill));
                        report.stoploss_fired = true;
                    }
                } else if order.expire_time <= now() {
                    Self::restore_reserves(
                        m,
                        order.side,
                        order.remaining_volume,
                        order.price,
                    );
                    m.open_orders.remove(&txid);
                    report.expiries += 1;
                }
                continue;
            }

            let details = match self.exchange.limit_details(self.creds, self.pair, &txid).await
            {
                Ok(d) => d,
                Err(ExchangeError::RateLimit(_)) => {
                    // Back off for the whole tick; state untouched.
                    return Ok(report);
                }
                Err(e) => {
                    self.emit_error(EVT_FAIL_EXCHANGE, e.to_string());
                    continue;
                }
            };

            let delta = details.exec_volume - order.executed_volume();
            if delta > 0.0 {
                let price = if details.price > 0.0 { details.price } else { order.price };
                self.credit_partial(m, &mut order, delta, price);
                m.open_orders.insert(txid.clone(), order.clone());
            }

            if order.remaining_volume <= FILL_EPSILON {
                let price = if details.price > 0.0 { details.price } else { order.price };
                m.open_orders.remove(&txid);
                self.emit_fill_event(m, &order, order.orig_volume, price, details.date);
                report.fills += 1;
                continue;
            }

            if order.expire_time <= now() {
                match self.exchange.cancel_order(self.creds, self.pair, &txid).await {
                    Ok(()) => {}
                    Err(ExchangeError::RateLimit(_)) => continue,
                    Err(e) => {
                        self.emit_error(EVT_FAIL_EXCHANGE, e.to_string());
                        continue;
                    }
                }
                Self::restore_reserves(m, order.side, order.remaining_volume, order.price);
                m.open_orders.remove(&txid);
                let executed = order.executed_volume();
                if executed > 0.0 {
                    let price = if details.price > 0.0 { details.price } else { order.price };
                    self.emit_fill_event(m, &order, executed, price, details.date);
                }
                report.expiries += 1;
            }
        }
        Ok(report)
    }

    /// Trailing stop-loss bookkeeping for one tick. Returns true when the
    /// stop fired and the bot must be disabled.
    pub async fn manage_stop_loss(&self, bot: &mut Bot, current_price: f64) -> ExResult<bool> {
        let Some(sl) = bot.stop_loss.as_mut() else { return Ok(false) };

        let portfolio = bot.state.portfolio(current_price);
        if sl.trailing && portfolio > sl.highest_portfolio {
            sl.highest_portfolio = portfolio;
        }
        let target = sl.effective_fraction() * sl.starting_portfolio;
        if target <= bot.state.cur_balance {
            // Enough cash on hand; no stop needed.
            return Ok(false);
        }
        let stop_price = (target - bot.state.cur_balance) / (bot.state.tok_balance + 1e-8);
        let sell_volume = bot.state.tok_balance * STOPLOSS_SELL_FRACTION;

        if current_price < stop_price {
            if let Some(fill) = self
                .market(&mut bot.state, Side::Sell, sell_volume, current_price)
                .await?
            {
                self.bus.emit(EVT_STOPLOSS, &EventPayload::StopLoss(fill));
            }
            return Ok(true);
        }

        // Keep one resting stop order tracking the derived price; replace
        // it when the trailing target moves.
        let existing: Option<(String, f64)> = bot
            .state
            .open_orders
            .iter()
            .find(|(_, o)| o.kind == OrderKind::StopLoss)
            .map(|(txid, o)| (txid.clone(), o.price));
        if let Some((txid, price)) = existing {
            if (price - stop_price).abs() < f64::EPSILON.max(price * 1e-6) {
                return Ok(false);
            }
            if let Some(order) = bot.state.open_orders.get(&txid).cloned() {
                if order.exchange_txid.is_some() {
                    match self.exchange.cancel_order(self.creds, self.pair, &txid).await {
                        Ok(()) => {}
                        Err(ExchangeError::RateLimit(_)) => return Ok(false),
                        Err(e) => {
                            self.emit_error(EVT_FAIL_EXCHANGE, e.to_string());
                            return Ok(false);
                        }
                    }
                }
                Self::restore_reserves(
                    &mut bot.state,
                    order.side,
                    order.remaining_volume,
                    order.price,
                );
                bot.state.open_orders.remove(&txid);
            }
        }

        let interval = crate::types::interval_secs(&bot.candles).unwrap_or(3600);
        self.place_stoploss(&mut bot.state, sell_volume, stop_price, current_price, interval * 2)
            .await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::types::LimitDetails;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted venue: orders accept or fail per configuration, and
    /// limit_details replays a queue of poll results.
    #[derive(Default)]
    struct StubExchange {
        place_result: Mutex<Option<ExchangeError>>,
        details: Mutex<Vec<LimitDetails>>,
        market_price: f64,
        native_stops: bool,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Exchange for StubExchange {
        fn name(&self) -> &str {
            "stub"
        }
        async fn update_ohlc(&self, _: &Pair, _: &str, _: i64) -> ExResult<Vec<crate::types::Candle>> {
            Err(ExchangeError::NoNewCandles)
        }
        async fn balance(&self, _: &Credentials) -> ExResult<HashMap<String, f64>> {
            Ok(HashMap::new())
        }
        async fn market_prices(&self) -> ExResult<crate::types::PriceDict> {
            Ok(HashMap::new())
        }
        async fn filters(&self) -> ExResult<HashMap<Pair, Filter>> {
            Ok(HashMap::new())
        }
        async fn check_auth(&self, _: &Credentials) -> bool {
            true
        }
        async fn market_order(
            &self,
            _: &Credentials,
            pair: &Pair,
            side: Side,
            volume: f64,
        ) -> ExResult<FilledOrder> {
            let price = self.market_price;
            let fee = volume * price * self.fee_rate();
            let (tok_diff, cur_diff) = match side {
                Side::Buy => (volume, -(volume * price + fee)),
                Side::Sell => (-volume, volume * price - fee),
            };
            Ok(FilledOrder {
                side,
                price,
                volume,
                tok_diff,
                cur_diff,
                fee,
                fee_asset: pair.quote.clone(),
                date: now(),
            })
        }
        async fn limit_order(
            &self,
            _: &Credentials,
            _: &Pair,
            _: Side,
            _: f64,
            _: f64,
            cid: Option<&str>,
        ) -> ExResult<String> {
            if let Some(e) = self.place_result.lock().unwrap().take() {
                return Err(e);
            }
            Ok(cid.unwrap_or("srv-1").to_string())
        }
        async fn stoploss_order(
            &self,
            _: &Credentials,
            _: &Pair,
            _: f64,
            _: f64,
            cid: Option<&str>,
        ) -> ExResult<String> {
            if let Some(e) = self.place_result.lock().unwrap().take() {
                return Err(e);
            }
            Ok(cid.unwrap_or("srv-2").to_string())
        }
        async fn limit_details(
            &self,
            _: &Credentials,
            _: &Pair,
            _: &str,
        ) -> ExResult<LimitDetails> {
            let mut q = self.details.lock().unwrap();
            if q.is_empty() {
                return Err(ExchangeError::Call("no scripted details".into()));
            }
            Ok(q.remove(0))
        }
        async fn cancel_order(&self, _: &Credentials, _: &Pair, txid: &str) -> ExResult<()> {
            self.cancelled.lock().unwrap().push(txid.to_string());
            Ok(())
        }
        fn supports_native_stoploss(&self) -> bool {
            self.native_stops
        }
    }

    fn creds() -> Credentials {
        Credentials::from_parts(&["k".into(), "s".into()]).unwrap()
    }

    fn engine<'a>(
        exchange: &'a Arc<dyn Exchange>,
        creds: &'a Credentials,
        pair: &'a Pair,
        bus: &'a Arc<EventBus>,
    ) -> OrderEngine<'a> {
        OrderEngine {
            exchange,
            creds,
            pair,
            bus,
            filter: Filter::default(),
            err_ctx: ErrorCtx {
                bot_id: "b1".into(),
                user: "u1".into(),
                exchange: "stub".into(),
                detail: String::new(),
            },
            broker_tag: None,
            prices: PriceDict::new(),
        }
    }

    #[tokio::test]
    async fn limit_placement_reserves_quote_for_buys() {
        let ex: Arc<dyn Exchange> = Arc::new(StubExchange::default());
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let eng = engine(&ex, &c, &pair, &bus);

        let mut m = UserMetrics::new(0.0, 100.0);
        let txid = eng
            .place_limit(&mut m, Side::Buy, 1.0, 50.0, 50.0, 3600)
            .await
            .unwrap()
            .unwrap();
        assert!((m.cur_balance - 50.0).abs() < 1e-9);
        assert_eq!(m.open_orders.len(), 1);
        assert_eq!(m.open_orders[&txid].remaining_volume, 1.0);
        // Portfolio is conserved: cash + reservation.
        assert!((m.portfolio(50.0) - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejected_placement_restores_reserves_and_emits() {
        let stub = StubExchange::default();
        *stub.place_result.lock().unwrap() =
            Some(ExchangeError::InsufficientBalance("no funds".into()));
        let ex: Arc<dyn Exchange> = Arc::new(stub);
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = hits.clone();
        bus.on(EVT_INSUFFICIENT_BALANCE, move |_| {
            h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let eng = engine(&ex, &c, &pair, &bus);

        let mut m = UserMetrics::new(0.0, 100.0);
        let err = eng
            .place_limit(&mut m, Side::Buy, 1.0, 50.0, 50.0, 3600)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient-balance");
        assert!((m.cur_balance - 100.0).abs() < 1e-9);
        assert!(m.open_orders.is_empty());
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_fill_credits_and_full_fill_closes() {
        let stub = StubExchange {
            details: Mutex::new(vec![
                LimitDetails { exec_volume: 0.4, exec_fraction: 0.4, price: 50.0, date: 10 },
                LimitDetails { exec_volume: 1.0, exec_fraction: 1.0, price: 50.0, date: 20 },
            ]),
            ..Default::default()
        };
        let ex: Arc<dyn Exchange> = Arc::new(stub);
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let eng = engine(&ex, &c, &pair, &bus);

        let mut m = UserMetrics::new(1.0, 0.0);
        eng.place_limit(&mut m, Side::Sell, 1.0, 50.0, 50.0, 3600)
            .await
            .unwrap();
        assert!((m.tok_balance - 0.0).abs() < 1e-9);

        // First poll: 0.4 filled, credited net of the 0.1% fee.
        let r = eng.reconcile(&mut m, 50.0, 49.0).await.unwrap();
        assert_eq!(r.fills, 0);
        assert!((m.cur_balance - 0.4 * 50.0 * 0.999).abs() < 1e-9);
        assert_eq!(m.open_orders.len(), 1);

        // Second poll: fully filled.
        let r = eng.reconcile(&mut m, 50.0, 49.0).await.unwrap();
        assert_eq!(r.fills, 1);
        assert!(m.open_orders.is_empty());
        assert!((m.cur_balance - 50.0 * 0.999).abs() < 1e-9);
    }

    #[tokio::test]
    async fn expired_order_cancels_and_restores_remainder() {
        let stub = StubExchange {
            details: Mutex::new(vec![LimitDetails {
                exec_volume: 0.25,
                exec_fraction: 0.25,
                price: 50.0,
                date: 10,
            }]),
            ..Default::default()
        };
        let ex: Arc<dyn Exchange> = Arc::new(stub);
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let eng = engine(&ex, &c, &pair, &bus);

        let mut m = UserMetrics::new(1.0, 0.0);
        // Already-expired order.
        eng.place_limit(&mut m, Side::Sell, 1.0, 50.0, 50.0, -1)
            .await
            .unwrap();
        let r = eng.reconcile(&mut m, 50.0, 49.0).await.unwrap();
        assert_eq!(r.expiries, 1);
        assert!(m.open_orders.is_empty());
        // 0.25 sold, 0.75 restored.
        assert!((m.tok_balance - 0.75).abs() < 1e-9);
        assert!((m.cur_balance - 0.25 * 50.0 * 0.999).abs() < 1e-9);
    }

    #[tokio::test]
    async fn poll_error_keeps_order_open() {
        let stub = StubExchange::default();
        let ex: Arc<dyn Exchange> = Arc::new(stub);
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let eng = engine(&ex, &c, &pair, &bus);

        let mut m = UserMetrics::new(1.0, 0.0);
        eng.place_limit(&mut m, Side::Sell, 1.0, 50.0, 50.0, -1)
            .await
            .unwrap();
        let before = m.clone();
        // An empty details queue yields a Call error, which keeps the
        // order open; the order book must not change.
        let _ = eng.reconcile(&mut m, 50.0, 49.0).await.unwrap();
        assert_eq!(m.open_orders.len(), before.open_orders.len());
    }

    #[tokio::test]
    async fn synthesized_stop_triggers_on_candle_low() {
        let stub = StubExchange { market_price: 40.0, native_stops: false, ..Default::default() };
        let ex: Arc<dyn Exchange> = Arc::new(stub);
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let f = fired.clone();
        bus.on(EVT_STOPLOSS, move |_| {
            f.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let eng = engine(&ex, &c, &pair, &bus);

        let mut m = UserMetrics::new(1.0, 0.0);
        eng.place_stoploss(&mut m, 1.0, 45.0, 50.0, 3600).await.unwrap();
        assert!(m.open_orders.values().all(|o| o.exchange_txid.is_none()));

        // Candle low pierces the stop.
        let r = eng.reconcile(&mut m, 40.0, 44.0).await.unwrap();
        assert!(r.stoploss_fired);
        assert!(m.open_orders.is_empty());
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Sold at market price 40.
        assert!((m.cur_balance - 40.0 * 0.999).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trailing_stop_fires_below_derived_price() {
        let stub = StubExchange { market_price: 30.0, native_stops: true, ..Default::default() };
        let ex: Arc<dyn Exchange> = Arc::new(stub);
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let eng = engine(&ex, &c, &pair, &bus);

        let mut bot = Bot {
            id: "b1".into(),
            user: "u1".into(),
            enabled: true,
            exchange: "stub".into(),
            market: pair.clone(),
            candles: "1h".into(),
            strategy: "ma-crossover".into(),
            strategy_params: serde_json::Value::Null,
            state: UserMetrics::new(1.0, 0.0),
            stop_loss: Some(crate::types::StopLossCfg {
                stop: 0.8,
                trailing: false,
                starting_portfolio: 100.0,
                highest_portfolio: 100.0,
            }),
            start_time: 0,
            stop_time: None,
            starting_price: 100.0,
            bah_roi: 0.0,
            billing_start_portfolio: 100.0,
            internal_state: None,
            twitter_tokens: None,
            telegram_tokens: None,
        };

        // Target 80, zero cash: stop price 80 per token. Price 30 is below.
        let fired = eng.manage_stop_loss(&mut bot, 30.0).await.unwrap();
        assert!(fired);
        assert!(bot.state.tok_balance < 0.02);
    }

    #[tokio::test]
    async fn hedged_bot_skips_stop_management() {
        let stub = StubExchange { market_price: 30.0, native_stops: true, ..Default::default() };
        let ex: Arc<dyn Exchange> = Arc::new(stub);
        let c = creds();
        let pair = Pair::new("BTC", "USDT");
        let bus = EventBus::new();
        let eng = engine(&ex, &c, &pair, &bus);

        let mut bot_state = UserMetrics::new(0.0, 100.0);
        bot_state.cur_balance = 90.0;
        let mut bot = Bot {
            id: "b1".into(),
            user: "u1".into(),
            enabled: true,
            exchange: "stub".into(),
            market: pair.clone(),
            candles: "1h".into(),
            strategy: "ma-crossover".into(),
            strategy_params: serde_json::Value::Null,
            state: bot_state,
            stop_loss: Some(crate::types::StopLossCfg {
                stop: 0.8,
                trailing: false,
                starting_portfolio: 100.0,
                highest_portfolio: 100.0,
            }),
            start_time: 0,
            stop_time: None,
            starting_price: 100.0,
            bah_roi: 0.0,
            billing_start_portfolio: 100.0,
            internal_state: None,
            twitter_tokens: None,
            telegram_tokens: None,
        };

        // Cash 90 >= target 80: nothing to do.
        let fired = eng.manage_stop_loss(&mut bot, 30.0).await.unwrap();
        assert!(!fired);
        assert!(bot.state.open_orders.is_empty());
    }
}
