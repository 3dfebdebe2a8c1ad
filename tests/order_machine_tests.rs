mod common;

use common::{creds, metrics, MockExchange};
use std::sync::{Arc, Mutex};
use tradefleet::events::{ErrorCtx, EventBus, EventPayload, EVT_FILLED};
use tradefleet::exchange::Exchange;
use tradefleet::orders::OrderEngine;
use tradefleet::types::{Credentials, Filter, LimitDetails, Pair, PriceDict, Side};

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
            exchange: "mock".into(),
            detail: String::new(),
        },
        broker_tag: None,
        prices: PriceDict::new(),
    }
}

#[tokio::test]
async fn sine_market_round_trip_buy_then_sell() {
    let mock = Arc::new(MockExchange::new(1.0));
    let ex: Arc<dyn Exchange> = mock.clone();
    let c = creds();
    let pair = Pair::new("BTC", "USDT");
    let bus = EventBus::new();
    let eng = engine(&ex, &c, &pair, &bus);

    let mut m = metrics(0.0, 10.0);

    // Full buy at price 1.0: all 10 quote becomes 10 * 0.999 base.
    let before = (m.tok_balance, m.cur_balance);
    let fill = eng.market(&mut m, Side::Buy, 10.0, 1.0).await.unwrap().unwrap();
    assert!((m.tok_balance - before.0 - fill.tok_diff).abs() < 1e-12);
    assert!((m.cur_balance - before.1 - fill.cur_diff).abs() < 1e-12);
    assert!((m.tok_balance - 9.99).abs() < 1e-9);
    assert!(m.cur_balance.abs() < 1e-9);

    // Price doubles; full sell.
    mock.set_spot(2.0);
    let vol = m.tok_balance;
    eng.market(&mut m, Side::Sell, vol, 2.0).await.unwrap().unwrap();
    assert!((m.cur_balance - 19.96002).abs() < 1e-6);
    assert!(m.tok_balance.abs() < 1e-9);
    assert_eq!(m.trade_log.len(), 2);
}

#[tokio::test]
async fn partial_limit_fill_then_completion() {
    let mock = Arc::new(MockExchange::new(1.0));
    let ex: Arc<dyn Exchange> = mock.clone();
    let c = creds();
    let pair = Pair::new("BTC", "USDT");
    let bus = EventBus::new();
    let fills = Arc::new(Mutex::new(Vec::new()));
    let f = fills.clone();
    bus.on(EVT_FILLED, move |p| {
        if let EventPayload::Fill(info) = p {
            f.lock().unwrap().push(info.clone());
        }
        Ok(())
    });
    let eng = engine(&ex, &c, &pair, &bus);

    let mut m = metrics(0.0, 10.0);
    let txid = eng
        .place_limit(&mut m, Side::Buy, 1.0, 0.95, 1.0, 3600)
        .await
        .unwrap()
        .unwrap();
    assert!((m.cur_balance - (10.0 - 0.95)).abs() < 1e-9);

    // Tick N: 60% filled.
    mock.script_fill(
        &txid,
        LimitDetails { exec_volume: 0.6, exec_fraction: 0.6, price: 0.95, date: 100 },
    );
    eng.reconcile(&mut m, 1.0, 0.9).await.unwrap();
    assert!((m.tok_balance - 0.6 * 0.999).abs() < 1e-9);
    assert!((m.cur_balance - (10.0 - 0.95)).abs() < 1e-9, "reserve stays until close");
    assert!((m.open_orders[&txid].remaining_volume - 0.4).abs() < 1e-9);
    assert!(fills.lock().unwrap().is_empty());

    // Tick N+1: fully filled.
    mock.script_fill(
        &txid,
        LimitDetails { exec_volume: 1.0, exec_fraction: 1.0, price: 0.95, date: 200 },
    );
    eng.reconcile(&mut m, 1.0, 0.9).await.unwrap();
    assert!(m.open_orders.is_empty());
    let fills = fills.lock().unwrap();
    assert_eq!(fills.len(), 1);
    assert!((fills[0].amount - 1.0).abs() < 1e-12);
    assert_eq!(fills[0].side, Side::Buy);
}

#[tokio::test]
async fn expired_sell_limit_synthesizes_partial_fill() {
    let mock = Arc::new(MockExchange::new(1.0));
    let ex: Arc<dyn Exchange> = mock.clone();
    let c = creds();
    let pair = Pair::new("BTC", "USDT");
    let bus = EventBus::new();
    let fills = Arc::new(Mutex::new(Vec::new()));
    let f = fills.clone();
    bus.on(EVT_FILLED, move |p| {
        if let EventPayload::Fill(info) = p {
            f.lock().unwrap().push(info.clone());
        }
        Ok(())
    });
    let eng = engine(&ex, &c, &pair, &bus);

    let mut m = metrics(1.0, 0.0);
    // Sell 1.0 at close+5%, already expired.
    let txid = eng
        .place_limit(&mut m, Side::Sell, 1.0, 1.05, 1.0, -1)
        .await
        .unwrap()
        .unwrap();
    mock.script_fill(
        &txid,
        LimitDetails { exec_volume: 0.4, exec_fraction: 0.4, price: 1.05, date: 100 },
    );

    eng.reconcile(&mut m, 1.0, 0.9).await.unwrap();
    assert!(m.open_orders.is_empty());
    assert_eq!(mock.cancelled.lock().unwrap().len(), 1);
    // 40% sold at 1.05 net of fee, 60% of the base restored.
    assert!((m.tok_balance - 0.6).abs() < 1e-9);
    assert!((m.cur_balance - 0.4 * 1.05 * 0.999).abs() < 1e-9);
    let fills = fills.lock().unwrap();
    assert_eq!(fills.len(), 1);
    assert!((fills[0].amount - 0.4).abs() < 1e-12);
}

#[tokio::test]
async fn zero_balance_market_attempt_changes_nothing() {
    let mock = Arc::new(MockExchange::new(1.0));
    let ex: Arc<dyn Exchange> = mock.clone();
    let c = creds();
    let pair = Pair::new("BTC", "USDT");
    let bus = EventBus::new();
    let eng = engine(&ex, &c, &pair, &bus);

    let mut m = metrics(0.0, 0.0);
    let out = eng.market(&mut m, Side::Buy, 0.0, 1.0).await.unwrap();
    assert!(out.is_none());
    assert!(m.trade_log.is_empty());
    assert_eq!(m.cur_balance, 0.0);
    assert!(mock.market_order_log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reconcile_leaves_no_closed_or_expired_orders_behind() {
    let mock = Arc::new(MockExchange::new(1.0));
    let ex: Arc<dyn Exchange> = mock.clone();
    let c = creds();
    let pair = Pair::new("BTC", "USDT");
    let bus = EventBus::new();
    let eng = engine(&ex, &c, &pair, &bus);

    let mut m = metrics(5.0, 100.0);
    let live = eng
        .place_limit(&mut m, Side::Buy, 1.0, 0.9, 1.0, 3600)
        .await
        .unwrap()
        .unwrap();
    let full = eng
        .place_limit(&mut m, Side::Sell, 1.0, 1.1, 1.0, 3600)
        .await
        .unwrap()
        .unwrap();
    let expired = eng
        .place_limit(&mut m, Side::Sell, 1.0, 1.2, 1.0, -1)
        .await
        .unwrap()
        .unwrap();
    mock.script_fill(
        &full,
        LimitDetails { exec_volume: 1.0, exec_fraction: 1.0, price: 1.1, date: 100 },
    );

    eng.reconcile(&mut m, 1.0, 0.9).await.unwrap();
    let now = tradefleet::types::now();
    for (txid, order) in &m.open_orders {
        assert!(order.remaining_volume > 1e-8, "closed order {txid} still open");
        assert!(order.expire_time > now, "expired order {txid} still open");
    }
    assert!(m.open_orders.contains_key(&live));
    assert!(!m.open_orders.contains_key(&full));
    assert!(!m.open_orders.contains_key(&expired));
}
