use std::sync::Mutex;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::info,
};

use tradeclaw_common::time::now_ms;

use crate::{error::Result, types::TradeAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub decision_id: String,
    pub asset: String,
    pub market: String,
    pub side: TradeAction,
    pub amount: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub order_id: String,
    pub decision_id: String,
    pub asset: String,
    pub side: TradeAction,
    pub amount: f64,
    pub price: f64,
    pub fee: f64,
    pub filled_at: u64,
}

/// Places orders for approved decisions.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, order: &OrderRequest) -> Result<ExecutionReport>;
}

/// Fills every order immediately at its limit price, without fees.
#[derive(Default)]
pub struct PaperExecutor {
    fills: Mutex<Vec<ExecutionReport>>,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fills(&self) -> Vec<ExecutionReport> {
        self.fills
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    fn name(&self) -> &str {
        "paper"
    }

    async fn execute(&self, order: &OrderRequest) -> Result<ExecutionReport> {
        let report = ExecutionReport {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            decision_id: order.decision_id.clone(),
            asset: order.asset.clone(),
            side: order.side,
            amount: order.amount,
            price: order.price,
            fee: 0.0,
            filled_at: now_ms(),
        };
        info!(
            order_id = %report.order_id,
            decision_id = %order.decision_id,
            asset = %order.asset,
            side = order.side.as_str(),
            amount = order.amount,
            price = order.price,
            "paper fill"
        );
        if let Ok(mut fills) = self.fills.lock() {
            fills.push(report.clone());
        }
        Ok(report)
    }
}
