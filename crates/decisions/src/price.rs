use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{DecisionError, Result};

/// Source of current asset prices.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn price(&self, symbol: &str, market: &str) -> Result<f64>;
}

/// Fixed price table.
///
/// Keys are upper-case symbols, optionally qualified by market
/// (`perp:BTC`). A market-qualified entry wins over a bare one.
#[derive(Debug, Default, Clone)]
pub struct StaticPriceProvider {
    prices: HashMap<String, f64>,
}

impl StaticPriceProvider {
    pub fn new(prices: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            prices: prices
                .into_iter()
                .map(|(k, v)| (normalize(&k), v))
                .collect(),
        }
    }

    pub fn with_price(mut self, symbol: &str, price: f64) -> Self {
        self.prices.insert(normalize(symbol), price);
        self
    }
}

fn normalize(key: &str) -> String {
    match key.split_once(':') {
        Some((market, symbol)) => format!("{}:{}", market.to_lowercase(), symbol.to_uppercase()),
        None => key.to_uppercase(),
    }
}

#[async_trait]
impl PriceProvider for StaticPriceProvider {
    async fn price(&self, symbol: &str, market: &str) -> Result<f64> {
        let symbol = symbol.to_uppercase();
        let qualified = format!("{}:{symbol}", market.to_lowercase());
        self.prices
            .get(&qualified)
            .or_else(|| self.prices.get(&symbol))
            .copied()
            .ok_or_else(|| DecisionError::PriceUnavailable {
                symbol,
                reason: "not in price table".into(),
            })
    }
}
