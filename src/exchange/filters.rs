use crate::exchange::cache::TtlCache;
use crate::exchange::{ExResult, Exchange};
use crate::types::{Filter, Pair};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PRICE_DENOM: u32 = 5;
const DEFAULT_LOT_DENOM: u32 = 8;
/// Volumes below this are dust regardless of exchange rules.
const DUST_VOLUME: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("notional {notional} below minimum {min}")]
    BelowMinNotional { notional: f64, min: f64 },
    #[error("volume {volume} below minimum lot {min}")]
    BelowMinLot { volume: f64, min: f64 },
    #[error("volume {0} is dust")]
    DustVolume(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedOrder {
    pub volume: f64,
    pub price: Option<f64>,
}

/// Floor `value` to `digits` fractional digits. Floor is mandatory:
/// rounding up risks over-committing balance.
pub fn quantize_floor(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    // Absorb float representation error so an already-quantized value is a
    // no-op instead of dropping one ulp.
    ((value * scale) + 1e-9).floor() / scale
}

/// Quantize and validate an order against the market's lot/tick/notional
/// rules before it reaches the exchange.
pub fn preprocess(
    filter: &Filter,
    volume: f64,
    close_price: f64,
    price: Option<f64>,
) -> Result<PreparedOrder, FilterError> {
    let price = price.map(|p| {
        quantize_floor(p, filter.price_denom.unwrap_or(DEFAULT_PRICE_DENOM))
    });
    let volume = quantize_floor(volume, filter.lot_denom.unwrap_or(DEFAULT_LOT_DENOM));

    if let Some(min_notional) = filter.min_notional {
        let notional = volume * close_price;
        if notional < min_notional {
            return Err(FilterError::BelowMinNotional { notional, min: min_notional });
        }
    }
    if let Some(min_lot) = filter.min_lot {
        if volume < min_lot {
            return Err(FilterError::BelowMinLot { volume, min: min_lot });
        }
    }
    if volume < DUST_VOLUME {
        return Err(FilterError::DustVolume(volume));
    }

    Ok(PreparedOrder { volume, price })
}

/// Process-wide filter tables, refreshed from the exchange at most once per
/// 24 h.
pub struct FilterCache {
    tables: TtlCache<String, Arc<HashMap<Pair, Filter>>>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self { tables: TtlCache::new(16, Duration::from_secs(24 * 3600)) }
    }

    pub async fn get(&self, exchange: &Arc<dyn Exchange>, pair: &Pair) -> ExResult<Filter> {
        let key = exchange.name().to_string();
        let table = match self.tables.get(&key) {
            Some(t) => t,
            None => {
                let fresh = Arc::new(exchange.filters().await?);
                self.tables.put(key, fresh.clone());
                fresh
            }
        };
        Ok(table.get(pair).copied().unwrap_or_default())
    }
}

impl Default for FilterCache {
    fn default() -> Self {
        Self::new()
    }
}
