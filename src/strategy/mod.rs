pub mod ma_crossover;
pub mod rsi;

use crate::exchange::ExResult;
use crate::orders::OrderEngine;
use crate::types::{Candle, Side, UserMetrics};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution surface handed to a strategy for one tick. Every order call
/// goes through the filter preprocessor and the order state machine.
pub struct TradeCtx<'a> {
    pub engine: &'a OrderEngine<'a>,
    pub metrics: &'a mut UserMetrics,
    pub window: &'a [Candle],
    pub interval_secs: i64,
}

impl<'a> TradeCtx<'a> {
    pub fn close(&self) -> f64 {
        self.window.last().map(|c| c.close).unwrap_or(0.0)
    }

    /// (base, quote) free balances.
    pub fn balances(&self) -> (f64, f64) {
        (self.metrics.tok_balance, self.metrics.cur_balance)
    }

    pub async fn buy(&mut self, volume: f64) -> ExResult<()> {
        let close = self.close();
        self.engine
            .market(self.metrics, Side::Buy, volume, close)
            .await
            .map(|_| ())
    }

    pub async fn sell(&mut self, volume: f64) -> ExResult<()> {
        let close = self.close();
        self.engine
            .market(self.metrics, Side::Sell, volume, close)
            .await
            .map(|_| ())
    }

    pub async fn buy_limit(&mut self, volume: f64, price: f64) -> ExResult<()> {
        let close = self.close();
        let expire = self.interval_secs * 2;
        self.engine
            .place_limit(self.metrics, Side::Buy, volume, price, close, expire)
            .await
            .map(|_| ())
    }

    pub async fn sell_limit(&mut self, volume: f64, price: f64) -> ExResult<()> {
        let close = self.close();
        let expire = self.interval_secs * 2;
        self.engine
            .place_limit(self.metrics, Side::Sell, volume, price, close, expire)
            .await
            .map(|_| ())
    }
}

/// One compiled-in trading strategy. Instances are rebuilt every tick from
/// (params, serialized state); `dumps` round-trips whatever the strategy
/// wants to remember between ticks.
#[async_trait]
pub trait Strategy: Send {
    async fn step(&mut self, ctx: &mut TradeCtx<'_>) -> Result<()>;

    /// Serialized internal state, None when the strategy is stateless.
    fn dumps(&self) -> Option<String> {
        None
    }
}

/// Declarative hyperparameter metadata for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

pub fn registry() -> Vec<StrategyInfo> {
    vec![ma_crossover::info(), rsi::info()]
}

/// Instantiate a strategy by name from its params and prior state.
pub fn build_strategy(
    name: &str,
    params: &Value,
    state: Option<&str>,
) -> Result<Box<dyn Strategy>> {
    match name {
        ma_crossover::NAME => Ok(Box::new(ma_crossover::MaCrossover::from_parts(
            params, state,
        )?)),
        rsi::NAME => Ok(Box::new(rsi::Rsi::from_parts(params, state)?)),
        other => bail!("unknown strategy: {other}"),
    }
}

/// Read a numeric hyperparameter with a default.
pub(crate) fn param_f64(params: &Value, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}
