use crate::strategy::{param_f64, ParamSpec, Strategy, StrategyInfo, TradeCtx};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NAME: &str = "rsi";

const POSITION_FRACTION: f64 = 0.99;

pub fn info() -> StrategyInfo {
    StrategyInfo {
        name: NAME,
        description: "RSI mean reversion: buy oversold, sell overbought",
        params: vec![
            ParamSpec {
                name: "period",
                default: 14.0,
                min: 2.0,
                max: 100.0,
                description: "RSI lookback in candles",
            },
            ParamSpec {
                name: "oversold",
                default: 30.0,
                min: 1.0,
                max: 50.0,
                description: "Buy threshold",
            },
            ParamSpec {
                name: "overbought",
                default: 70.0,
                min: 50.0,
                max: 99.0,
                description: "Sell threshold",
            },
        ],
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    in_position: bool,
}

pub struct Rsi {
    period: usize,
    oversold: f64,
    overbought: f64,
    state: State,
}

impl Rsi {
    pub fn from_parts(params: &Value, state: Option<&str>) -> Result<Self> {
        let state = match state {
            Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
            None => State::default(),
        };
        Ok(Self {
            period: param_f64(params, "period", 14.0).max(2.0) as usize,
            oversold: param_f64(params, "oversold", 30.0),
            overbought: param_f64(params, "overbought", 70.0),
            state,
        })
    }
}

/// Wilder-smoothed relative strength index over the last `period` deltas.
pub(crate) fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let tail = &deltas[deltas.len() - period..];
    let gain: f64 = tail.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let loss: f64 = -tail.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;
    if loss == 0.0 {
        return Some(100.0);
    }
    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[async_trait]
impl Strategy for Rsi {
    async fn step(&mut self, ctx: &mut TradeCtx<'_>) -> Result<()> {
        let closes: Vec<f64> = ctx.window.iter().map(|c| c.close).collect();
        let Some(value) = rsi(&closes, self.period) else {
            return Ok(());
        };

        let close = ctx.close();
        let (tok, cur) = ctx.balances();
        if value < self.oversold && !self.state.in_position && close > 0.0 {
            ctx.buy(cur * POSITION_FRACTION / close).await?;
            self.state.in_position = true;
        } else if value > self.overbought && self.state.in_position {
            ctx.sell(tok * POSITION_FRACTION).await?;
            self.state.in_position = false;
        }
        Ok(())
    }

    fn dumps(&self) -> Option<String> {
        serde_json::to_string(&self.state).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_extremes() {
        // Monotonic rise: no losses, RSI pegged at 100.
        let rising: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));
        // Monotonic fall: no gains.
        let falling: Vec<f64> = (0..20).rev().map(|i| i as f64).collect();
        assert!(rsi(&falling, 14).unwrap() < 1e-9);
    }

    #[test]
    fn rsi_needs_warmup() {
        let closes = [1.0, 2.0, 3.0];
        assert_eq!(rsi(&closes, 14), None);
    }

    #[test]
    fn balanced_series_is_neutral() {
        let closes: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 10.0 } else { 11.0 })
            .collect();
        let v = rsi(&closes, 14).unwrap();
        assert!(v > 40.0 && v < 60.0, "rsi {v}");
    }
}
