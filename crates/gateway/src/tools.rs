//! Tools the chat agent can call, backed by the decision engine.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    serde_json::{Value, json},
};

use {
    tradeclaw_agents::{AgentTool, ToolRegistry},
    tradeclaw_decisions::{DecisionEngine, DecisionStatus},
};

pub struct MarketPriceTool {
    engine: Arc<DecisionEngine>,
}

#[async_trait]
impl AgentTool for MarketPriceTool {
    fn name(&self) -> &str {
        "market_price"
    }

    fn description(&self) -> &str {
        "Current price of a symbol"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string" },
                "market": { "type": "string" }
            },
            "required": ["symbol"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let symbol = params["symbol"]
            .as_str()
            .context("missing 'symbol' parameter")?;
        let market = params["market"].as_str();
        let price = self.engine.price(symbol, market).await?;
        Ok(json!({ "symbol": symbol, "price": price }))
    }
}

pub struct OpportunitiesTool {
    engine: Arc<DecisionEngine>,
}

#[async_trait]
impl AgentTool for OpportunitiesTool {
    fn name(&self) -> &str {
        "list_opportunities"
    }

    fn description(&self) -> &str {
        "Recently detected market opportunities, newest first"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "limit": { "type": "integer", "minimum": 1 } }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let limit = params["limit"]
            .as_u64()
            .map_or(10, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let mut opportunities = self.engine.opportunities().await;
        opportunities.truncate(limit);
        Ok(serde_json::to_value(opportunities)?)
    }
}

pub struct PendingDecisionsTool {
    engine: Arc<DecisionEngine>,
}

#[async_trait]
impl AgentTool for PendingDecisionsTool {
    fn name(&self) -> &str {
        "pending_decisions"
    }

    fn description(&self) -> &str {
        "Decisions waiting for operator approval"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value) -> Result<Value> {
        let pending = self.engine.decisions(Some(DecisionStatus::Pending)).await;
        Ok(serde_json::to_value(pending)?)
    }
}

/// Tools registered for every chat run.
pub fn default_tools(engine: &Arc<DecisionEngine>) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(MarketPriceTool {
        engine: Arc::clone(engine),
    }));
    tools.register(Arc::new(OpportunitiesTool {
        engine: Arc::clone(engine),
    }));
    tools.register(Arc::new(PendingDecisionsTool {
        engine: Arc::clone(engine),
    }));
    tools
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        tradeclaw_common::EventPublisher,
        tradeclaw_config::schema::DecisionsConfig,
        tradeclaw_decisions::{PaperExecutor, StaticPriceProvider},
    };

    fn engine() -> Arc<DecisionEngine> {
        Arc::new(DecisionEngine::new(
            DecisionsConfig::default(),
            Arc::new(StaticPriceProvider::new([("ETH".to_string(), 2000.0)])),
            Arc::new(PaperExecutor::new()),
            EventPublisher::detached(),
        ))
    }

    #[tokio::test]
    async fn price_tool_reads_engine_prices() {
        let tools = default_tools(&engine());
        assert_eq!(tools.names(), [
            "list_opportunities",
            "market_price",
            "pending_decisions"
        ]);

        let tool = tools.get("market_price").unwrap();
        let out = tool.execute(json!({"symbol": "ETH"})).await.unwrap();
        assert_eq!(out["price"], 2000.0);
        assert!(tool.execute(json!({"symbol": "DOGE"})).await.is_err());
        assert!(tool.execute(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn opportunity_limit_truncates_and_saturates() {
        let engine = engine();
        for apy in [4.0, 6.0, 8.0] {
            engine
                .create_yield_opportunity("aave", "USDC", apy, 5_000_000.0, Vec::new())
                .await;
        }
        let tools = default_tools(&engine);
        let tool = tools.get("list_opportunities").unwrap();

        let out = tool.execute(json!({"limit": 2})).await.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
        let out = tool.execute(json!({"limit": u64::MAX})).await.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 3);
        let out = tool.execute(json!({})).await.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn list_tools_start_empty() {
        let tools = default_tools(&engine());
        let out = tools
            .get("pending_decisions")
            .unwrap()
            .execute(json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!([]));
    }
}
