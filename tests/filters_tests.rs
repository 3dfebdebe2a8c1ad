mod common;

use common::MockExchange;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tradefleet::exchange::filters::{preprocess, quantize_floor, FilterCache, FilterError};
use tradefleet::exchange::Exchange;
use tradefleet::types::{Filter, Pair};

#[test]
fn quantizing_a_quantized_value_is_a_noop() {
    for v in [0.001, 1.5, 123.456, 0.00000001] {
        let q = quantize_floor(v, 8);
        assert_eq!(quantize_floor(q, 8), q);
    }
}

#[test]
fn quantization_never_rounds_up() {
    for v in [0.0019, 1.23456789, 99.999999, 0.1 + 0.2] {
        for digits in [0, 2, 5, 8] {
            assert!(quantize_floor(v, digits) <= v + 1e-9, "v={v} digits={digits}");
        }
    }
}

#[test]
fn below_min_notional_never_reaches_the_exchange() {
    let filter = Filter {
        min_lot: None,
        min_notional: Some(10.0),
        price_denom: Some(2),
        lot_denom: Some(4),
    };
    let err = preprocess(&filter, 0.5, 10.0, None).unwrap_err();
    assert!(matches!(err, FilterError::BelowMinNotional { .. }));

    // At exactly the notional it passes.
    let ok = preprocess(&filter, 1.0, 10.0, None).unwrap();
    assert_eq!(ok.volume, 1.0);
}

#[test]
fn price_and_volume_quantize_to_market_precision() {
    let filter = Filter {
        min_lot: Some(0.001),
        min_notional: None,
        price_denom: Some(1),
        lot_denom: Some(3),
    };
    let out = preprocess(&filter, 0.0019, 100.0, Some(100.17)).unwrap();
    assert_eq!(out.volume, 0.001);
    assert_eq!(out.price, Some(100.1));
}

#[test]
fn dust_volume_is_rejected() {
    let filter = Filter::default();
    let err = preprocess(&filter, 5e-7, 100.0, None).unwrap_err();
    assert!(matches!(err, FilterError::DustVolume(_)));
}

#[test]
fn unknown_denoms_fall_back_to_defaults() {
    // Default price precision 5, lot precision 8.
    let out = preprocess(&Filter::default(), 0.123456789, 1.0, Some(1.123456789)).unwrap();
    assert_eq!(out.volume, 0.12345678);
    assert_eq!(out.price, Some(1.12345));
}

#[tokio::test]
async fn filter_tables_are_fetched_once_per_exchange() {
    let mock = Arc::new(MockExchange::new(1.0));
    let ex: Arc<dyn Exchange> = mock.clone();
    let cache = FilterCache::new();
    let pair = Pair::new("BTC", "USDT");

    cache.get(&ex, &pair).await.unwrap();
    cache.get(&ex, &Pair::new("ETH", "USDT")).await.unwrap();
    assert_eq!(mock.filters_calls.load(Ordering::SeqCst), 1);
}
