//! Domain events published by gateway components and consumed by hooks.

use std::{fmt, str::FromStr};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStarted {
    pub gateway_id: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnected {
    pub conn_id: String,
    pub session_key: String,
    pub client_id: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDisconnected {
    pub conn_id: String,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionChanged {
    pub key: String,
    pub channel: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAdded {
    pub key: String,
    pub channel: Option<String>,
    pub role: String,
    /// First characters of the message content.
    pub preview: String,
    pub history_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFinished {
    pub session_key: String,
    pub channel: Option<String>,
    pub request_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityDetected {
    pub opportunity_id: String,
    pub asset: String,
    pub action: String,
    pub kind: String,
    pub confidence: f64,
    pub risk_score: f64,
}

/// Snapshot of a decision at the moment it changed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionNotice {
    pub decision_id: String,
    pub opportunity_id: String,
    pub asset: String,
    pub action: String,
    pub amount: f64,
    pub price: f64,
    pub risk_check_passed: bool,
    pub requires_approval: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeExecuted {
    pub decision_id: String,
    pub order_id: String,
    pub asset: String,
    pub side: String,
    pub amount: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronFired {
    pub job_id: String,
    pub name: String,
    pub method: String,
    pub params: Value,
}

// ── Event union ──────────────────────────────────────────────────────────────

/// Every event a hook can subscribe to, with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    GatewayStarted(GatewayStarted),
    ClientConnected(ClientConnected),
    ClientDisconnected(ClientDisconnected),
    SessionCreated(SessionChanged),
    SessionCleared(SessionChanged),
    SessionDeleted(SessionChanged),
    MessageAdded(MessageAdded),
    ChatCompleted(ChatFinished),
    ChatAborted(ChatFinished),
    OpportunityDetected(OpportunityDetected),
    DecisionCreated(DecisionNotice),
    DecisionApproved(DecisionNotice),
    DecisionRejected(DecisionNotice),
    DecisionExpired(DecisionNotice),
    TradeExecuted(TradeExecuted),
    CronFired(CronFired),
}

/// Subscription key for [`HookEvent`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEventKind {
    #[serde(rename = "gateway.started")]
    GatewayStarted,
    #[serde(rename = "client.connected")]
    ClientConnected,
    #[serde(rename = "client.disconnected")]
    ClientDisconnected,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.cleared")]
    SessionCleared,
    #[serde(rename = "session.deleted")]
    SessionDeleted,
    #[serde(rename = "message.added")]
    MessageAdded,
    #[serde(rename = "chat.completed")]
    ChatCompleted,
    #[serde(rename = "chat.aborted")]
    ChatAborted,
    #[serde(rename = "opportunity.detected")]
    OpportunityDetected,
    #[serde(rename = "decision.created")]
    DecisionCreated,
    #[serde(rename = "decision.approved")]
    DecisionApproved,
    #[serde(rename = "decision.rejected")]
    DecisionRejected,
    #[serde(rename = "decision.expired")]
    DecisionExpired,
    #[serde(rename = "trade.executed")]
    TradeExecuted,
    #[serde(rename = "cron.fired")]
    CronFired,
}

impl HookEventKind {
    pub const ALL: &[HookEventKind] = &[
        Self::GatewayStarted,
        Self::ClientConnected,
        Self::ClientDisconnected,
        Self::SessionCreated,
        Self::SessionCleared,
        Self::SessionDeleted,
        Self::MessageAdded,
        Self::ChatCompleted,
        Self::ChatAborted,
        Self::OpportunityDetected,
        Self::DecisionCreated,
        Self::DecisionApproved,
        Self::DecisionRejected,
        Self::DecisionExpired,
        Self::TradeExecuted,
        Self::CronFired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayStarted => "gateway.started",
            Self::ClientConnected => "client.connected",
            Self::ClientDisconnected => "client.disconnected",
            Self::SessionCreated => "session.created",
            Self::SessionCleared => "session.cleared",
            Self::SessionDeleted => "session.deleted",
            Self::MessageAdded => "message.added",
            Self::ChatCompleted => "chat.completed",
            Self::ChatAborted => "chat.aborted",
            Self::OpportunityDetected => "opportunity.detected",
            Self::DecisionCreated => "decision.created",
            Self::DecisionApproved => "decision.approved",
            Self::DecisionRejected => "decision.rejected",
            Self::DecisionExpired => "decision.expired",
            Self::TradeExecuted => "trade.executed",
            Self::CronFired => "cron.fired",
        }
    }
}

impl fmt::Display for HookEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown hook event: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for HookEventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

impl HookEvent {
    pub fn kind(&self) -> HookEventKind {
        match self {
            Self::GatewayStarted(_) => HookEventKind::GatewayStarted,
            Self::ClientConnected(_) => HookEventKind::ClientConnected,
            Self::ClientDisconnected(_) => HookEventKind::ClientDisconnected,
            Self::SessionCreated(_) => HookEventKind::SessionCreated,
            Self::SessionCleared(_) => HookEventKind::SessionCleared,
            Self::SessionDeleted(_) => HookEventKind::SessionDeleted,
            Self::MessageAdded(_) => HookEventKind::MessageAdded,
            Self::ChatCompleted(_) => HookEventKind::ChatCompleted,
            Self::ChatAborted(_) => HookEventKind::ChatAborted,
            Self::OpportunityDetected(_) => HookEventKind::OpportunityDetected,
            Self::DecisionCreated(_) => HookEventKind::DecisionCreated,
            Self::DecisionApproved(_) => HookEventKind::DecisionApproved,
            Self::DecisionRejected(_) => HookEventKind::DecisionRejected,
            Self::DecisionExpired(_) => HookEventKind::DecisionExpired,
            Self::TradeExecuted(_) => HookEventKind::TradeExecuted,
            Self::CronFired(_) => HookEventKind::CronFired,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// JSON form of the payload, as handed to hooks and pushed to clients.
    pub fn payload(&self) -> Value {
        let encoded = match self {
            Self::GatewayStarted(p) => serde_json::to_value(p),
            Self::ClientConnected(p) => serde_json::to_value(p),
            Self::ClientDisconnected(p) => serde_json::to_value(p),
            Self::SessionCreated(p) | Self::SessionCleared(p) | Self::SessionDeleted(p) => {
                serde_json::to_value(p)
            },
            Self::MessageAdded(p) => serde_json::to_value(p),
            Self::ChatCompleted(p) | Self::ChatAborted(p) => serde_json::to_value(p),
            Self::OpportunityDetected(p) => serde_json::to_value(p),
            Self::DecisionCreated(p)
            | Self::DecisionApproved(p)
            | Self::DecisionRejected(p)
            | Self::DecisionExpired(p) => serde_json::to_value(p),
            Self::TradeExecuted(p) => serde_json::to_value(p),
            Self::CronFired(p) => serde_json::to_value(p),
        };
        encoded.unwrap_or(Value::Null)
    }

    /// Channel the event originated from, used to route hook notifications.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::ClientConnected(p) => p.channel.as_deref(),
            Self::SessionCreated(p) | Self::SessionCleared(p) | Self::SessionDeleted(p) => {
                p.channel.as_deref()
            },
            Self::MessageAdded(p) => p.channel.as_deref(),
            Self::ChatCompleted(p) | Self::ChatAborted(p) => p.channel.as_deref(),
            Self::GatewayStarted(_)
            | Self::ClientDisconnected(_)
            | Self::OpportunityDetected(_)
            | Self::DecisionCreated(_)
            | Self::DecisionApproved(_)
            | Self::DecisionRejected(_)
            | Self::DecisionExpired(_)
            | Self::TradeExecuted(_)
            | Self::CronFired(_) => None,
        }
    }

    /// Session the event concerns, when it concerns one.
    pub fn session_key(&self) -> Option<&str> {
        match self {
            Self::ClientConnected(p) => Some(&p.session_key),
            Self::ClientDisconnected(p) => p.session_key.as_deref(),
            Self::SessionCreated(p) | Self::SessionCleared(p) | Self::SessionDeleted(p) => {
                Some(&p.key)
            },
            Self::MessageAdded(p) => Some(&p.key),
            Self::ChatCompleted(p) | Self::ChatAborted(p) => Some(&p.session_key),
            Self::GatewayStarted(_)
            | Self::OpportunityDetected(_)
            | Self::DecisionCreated(_)
            | Self::DecisionApproved(_)
            | Self::DecisionRejected(_)
            | Self::DecisionExpired(_)
            | Self::TradeExecuted(_)
            | Self::CronFired(_) => None,
        }
    }
}
