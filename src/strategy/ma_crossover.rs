use crate::strategy::{param_f64, ParamSpec, Strategy, StrategyInfo, TradeCtx};
use crate::types::Side;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NAME: &str = "ma-crossover";

/// Fraction of the free balance committed per entry; the remainder absorbs
/// fees and lot quantization.
const POSITION_FRACTION: f64 = 0.99;

pub fn info() -> StrategyInfo {
    StrategyInfo {
        name: NAME,
        description: "Simple moving average crossover, long-only",
        params: vec![
            ParamSpec {
                name: "fast",
                default: 12.0,
                min: 2.0,
                max: 200.0,
                description: "Fast SMA window in candles",
            },
            ParamSpec {
                name: "slow",
                default: 26.0,
                min: 3.0,
                max: 400.0,
                description: "Slow SMA window in candles",
            },
        ],
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    /// Signal from the previous tick, so only a cross trades, not a level.
    last_signal: Option<Side>,
    in_position: bool,
}

pub struct MaCrossover {
    fast: usize,
    slow: usize,
    state: State,
}

impl MaCrossover {
    pub fn from_parts(params: &Value, state: Option<&str>) -> Result<Self> {
        let fast = param_f64(params, "fast", 12.0).max(2.0) as usize;
        let slow = param_f64(params, "slow", 26.0).max(3.0) as usize;
        let state = match state {
            Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
            None => State::default(),
        };
        Ok(Self { fast, slow: slow.max(fast + 1), state })
    }
}

pub(crate) fn sma(closes: &[f64], n: usize) -> Option<f64> {
    if closes.len() < n || n == 0 {
        return None;
    }
    Some(closes[closes.len() - n..].iter().sum::<f64>() / n as f64)
}

/// Current side of the crossover, None before warmup.
pub(crate) fn signal(closes: &[f64], fast: usize, slow: usize) -> Option<Side> {
    let f = sma(closes, fast)?;
    let s = sma(closes, slow)?;
    if f > s {
        Some(Side::Buy)
    } else if f < s {
        Some(Side::Sell)
    } else {
        None
    }
}

#[async_trait]
impl Strategy for MaCrossover {
    async fn step(&mut self, ctx: &mut TradeCtx<'_>) -> Result<()> {
        let closes: Vec<f64> = ctx.window.iter().map(|c| c.close).collect();
        let Some(current) = signal(&closes, self.fast, self.slow) else {
            return Ok(());
        };
        let crossed = self.state.last_signal != Some(current);
        self.state.last_signal = Some(current);
        if !crossed {
            return Ok(());
        }

        let close = ctx.close();
        let (tok, cur) = ctx.balances();
        match current {
            Side::Buy if !self.state.in_position && close > 0.0 => {
                ctx.buy(cur * POSITION_FRACTION / close).await?;
                self.state.in_position = true;
            }
            Side::Sell if self.state.in_position => {
                ctx.sell(tok * POSITION_FRACTION).await?;
                self.state.in_position = false;
            }
            _ => {}
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
    fn sma_over_tail() {
        let closes = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(sma(&closes, 2), Some(3.5));
        assert_eq!(sma(&closes, 4), Some(2.5));
        assert_eq!(sma(&closes, 5), None);
    }

    #[test]
    fn crossover_signal_direction() {
        // Rising tail: fast SMA above slow.
        let rising = [1.0, 1.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(signal(&rising, 2, 6), Some(Side::Buy));
        // Falling tail: fast below slow.
        let falling = [4.0, 4.0, 4.0, 3.0, 2.0, 1.0];
        assert_eq!(signal(&falling, 2, 6), Some(Side::Sell));
        // Not warmed up.
        assert_eq!(signal(&rising[..3], 2, 6), None);
    }

    #[test]
    fn state_roundtrip() {
        let mut s = MaCrossover::from_parts(&Value::Null, None).unwrap();
        s.state.in_position = true;
        s.state.last_signal = Some(Side::Buy);
        let dumped = s.dumps().unwrap();
        let restored = MaCrossover::from_parts(&Value::Null, Some(&dumped)).unwrap();
        assert!(restored.state.in_position);
        assert_eq!(restored.state.last_signal, Some(Side::Buy));
    }
}
