use crate::types::PriceDict;
use std::collections::{HashMap, VecDeque};

/// Guard against a zero last price when inverting a market.
const INVERT_EPSILON: f64 = 1e-12;
const MAX_HOPS: usize = 2;

/// Approximate the rate converting one unit of `from` into `to`, walking
/// the market graph breadth-first for at most two hops. Reversed markets
/// count with the inverted price. Used for fee normalization and portfolio
/// valuation only, never for order sizing.
pub fn approx_conversion_rate(prices: &PriceDict, from: &str, to: &str) -> Option<f64> {
    if from == to {
        return Some(1.0);
    }

    // Adjacency: asset -> (neighbor, rate).
    let mut edges: HashMap<&str, Vec<(&str, f64)>> = HashMap::new();
    for (pair, price) in prices {
        if *price <= 0.0 {
            continue;
        }
        edges
            .entry(pair.base.as_str())
            .or_default()
            .push((pair.quote.as_str(), *price));
        edges
            .entry(pair.quote.as_str())
            .or_default()
            .push((pair.base.as_str(), 1.0 / (price + INVERT_EPSILON)));
    }

    let mut seen: HashMap<&str, ()> = HashMap::new();
    let mut queue: VecDeque<(&str, f64, usize)> = VecDeque::new();
    queue.push_back((from, 1.0, 0));
    seen.insert(from, ());

    while let Some((asset, rate, depth)) = queue.pop_front() {
        if depth >= MAX_HOPS {
            continue;
        }
        for (next, edge_rate) in edges.get(asset).into_iter().flatten() {
            if *next == to {
                return Some(rate * edge_rate);
            }
            if !seen.contains_key(next) {
                seen.insert(next, ());
                queue.push_back((next, rate * edge_rate, depth + 1));
            }
        }
    }
    None
}

/// Convenience: value an amount of `asset` in `quote`, falling back to
/// zero-contribution when no path exists.
pub fn approx_value(prices: &PriceDict, asset: &str, quote: &str, amount: f64) -> f64 {
    approx_conversion_rate(prices, asset, quote)
        .map(|r| amount * r)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pair;

    fn prices(entries: &[(&str, &str, f64)]) -> PriceDict {
        entries
            .iter()
            .map(|(b, q, p)| (Pair::new(b, q), *p))
            .collect()
    }

    #[test]
    fn direct_market_rate() {
        let p = prices(&[("BTC", "USDT", 50_000.0)]);
        assert_eq!(approx_conversion_rate(&p, "BTC", "USDT"), Some(50_000.0));
    }

    #[test]
    fn reversed_market_inverts() {
        let p = prices(&[("BTC", "USDT", 50_000.0)]);
        let r = approx_conversion_rate(&p, "USDT", "BTC").unwrap();
        assert!((r - 1.0 / 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn two_hop_path_via_bridge_asset() {
        let p = prices(&[("ETH", "BTC", 0.05), ("BTC", "USDT", 50_000.0)]);
        let r = approx_conversion_rate(&p, "ETH", "USDT").unwrap();
        assert!((r - 2_500.0).abs() < 1.0);
    }

    #[test]
    fn three_hop_paths_are_out_of_reach() {
        let p = prices(&[
            ("A", "B", 2.0),
            ("B", "C", 2.0),
            ("C", "D", 2.0),
        ]);
        assert_eq!(approx_conversion_rate(&p, "A", "D"), None);
    }

    #[test]
    fn identity_and_missing() {
        let p = prices(&[("BTC", "USDT", 50_000.0)]);
        assert_eq!(approx_conversion_rate(&p, "BTC", "BTC"), Some(1.0));
        assert_eq!(approx_conversion_rate(&p, "DOGE", "USDT"), None);
        assert_eq!(approx_value(&p, "DOGE", "USDT", 10.0), 0.0);
    }
}
