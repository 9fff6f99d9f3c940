use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

// ── Signals ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

/// One directional hint about an asset, from an indicator, feed or model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub source: String,
    #[serde(rename = "type", default)]
    pub signal_type: String,
    pub direction: Direction,
    /// 0–100.
    pub strength: f64,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub timestamp: u64,
}

// ── Opportunities ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Stake,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Stake => "stake",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityKind {
    Signal,
    Yield,
}

impl OpportunityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Yield => "yield",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOpportunity {
    pub id: String,
    pub asset: String,
    pub action: TradeAction,
    #[serde(rename = "type")]
    pub kind: OpportunityKind,
    /// 0–100.
    pub confidence: f64,
    /// 0–100, higher is riskier.
    pub risk_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_return_percent: Option<f64>,
    /// Yield protocol, for `yield` opportunities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub signals: Vec<Signal>,
    pub created_at: u64,
}

// ── Goals ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    #[default]
    Moderate,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGoal {
    pub id: String,
    #[serde(rename = "type")]
    pub goal_type: String,
    pub risk_tolerance: RiskTolerance,
    pub time_horizon: String,
    pub created_at: u64,
}

// ── Decisions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Rejected and expired decisions never change again. Approved decisions
    /// only move on to execution.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovedBy {
    /// Autonomy level was at or above the approval threshold.
    Auto,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionAction {
    #[serde(rename = "type")]
    pub kind: TradeAction,
    pub asset: String,
    pub market: String,
    /// Units of `asset`.
    pub amount: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub opportunity_id: String,
    pub action: DecisionAction,
    pub notional_usd: f64,
    pub risk_score: f64,
    pub risk_check_passed: bool,
    pub requires_approval: bool,
    pub autonomy_level: u8,
    pub status: DecisionStatus,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<ApprovedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<u64>,
}
