//! Config schema types (gateway, sessions, decisions, hooks, admission control).

use std::{collections::HashMap, path::PathBuf};

use {
    anyhow::bail,
    serde::{Deserialize, Serialize},
};

use tradeclaw_protocol as protocol;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeclawConfig {
    pub gateway: GatewayConfig,
    pub sessions: SessionsConfig,
    pub decisions: DecisionsConfig,
    pub hooks: HooksConfig,
    pub rate_limits: RateLimitConfig,
    pub idempotency: IdempotencyConfig,
    pub chat: ChatConfig,
}

impl TradeclawConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sessions.max_messages == 0 {
            bail!("sessions.max_messages must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.decisions.min_confidence) {
            bail!("decisions.min_confidence must be within 0..=100");
        }
        if !(0.5..=1.0).contains(&self.decisions.min_dominance) {
            bail!("decisions.min_dominance must be within 0.5..=1.0");
        }
        if !(0.0..=1.0).contains(&self.decisions.max_position_pct) {
            bail!("decisions.max_position_pct must be within 0..=1");
        }
        let c = &self.decisions.risk_ceilings;
        if !(c.low <= c.moderate && c.moderate <= c.high) {
            bail!("decisions.risk_ceilings must satisfy low <= moderate <= high");
        }
        if self.hooks.timeout_ms == 0 {
            bail!("hooks.timeout_ms must be positive");
        }
        if self.rate_limits.window_ms == 0 {
            bail!("rate_limits.window_ms must be positive");
        }
        Ok(())
    }
}

/// Gateway listener and authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// Stable identifier reported to clients. Defaults to the hostname.
    pub gateway_id: Option<String>,
    /// Shared bearer token. When no token is configured connections are not
    /// authenticated.
    pub token: Option<String>,
    /// Additional named tokens, optionally time-limited.
    pub tokens: Vec<TokenEntry>,
    /// Events buffered per stream for client resume.
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
            gateway_id: None,
            token: None,
            tokens: Vec::new(),
            event_buffer: protocol::EVENT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Unix epoch milliseconds after which the token is rejected.
    #[serde(default)]
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptBackend {
    #[default]
    Jsonl,
    Sqlite,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_messages: usize,
    pub transcript: TranscriptBackend,
    /// Defaults to `<data_dir>/sessions`.
    pub transcript_dir: Option<PathBuf>,
    pub persist_queue: usize,
    pub persist_retries: u32,
    pub persist_retry_delay_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            transcript: TranscriptBackend::default(),
            transcript_dir: None,
            persist_queue: 1024,
            persist_retries: 3,
            persist_retry_delay_ms: 250,
        }
    }
}

/// Maximum acceptable opportunity risk score per risk tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskCeilings {
    pub low: f64,
    pub moderate: f64,
    pub high: f64,
}

impl Default for RiskCeilings {
    fn default() -> Self {
        Self {
            low: 30.0,
            moderate: 60.0,
            high: 85.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionsConfig {
    /// Aggregate confidence (0–100) a signal set must exceed.
    pub min_confidence: f64,
    /// Share of total signal strength the winning direction must hold.
    pub min_dominance: f64,
    /// Autonomy levels below this require operator approval.
    pub approval_threshold: u8,
    /// Largest share of the account balance a single decision may commit.
    pub max_position_pct: f64,
    /// Pending decisions expire after this long. `0` disables expiry.
    pub approval_timeout_secs: u64,
    pub risk_ceilings: RiskCeilings,
    pub default_market: String,
    /// Prices served by the static price provider, keyed by symbol.
    pub prices: HashMap<String, f64>,
}

impl Default for DecisionsConfig {
    fn default() -> Self {
        Self {
            min_confidence: 60.0,
            min_dominance: 0.6,
            approval_threshold: 3,
            max_position_pct: 0.1,
            approval_timeout_secs: 900,
            risk_ceilings: RiskCeilings::default(),
            default_market: "spot".into(),
            prices: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub timeout_ms: u64,
    /// Hook ids disabled at startup.
    pub disabled: Vec<String>,
    /// Channel that receives notifications for events with no channel of origin.
    pub notify_channel: Option<String>,
    pub notify_target: Option<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            disabled: Vec::new(),
            notify_channel: None,
            notify_target: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub default_limit: u32,
    /// Budget per method group (`chat`, `trade`, ...).
    pub groups: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: protocol::RATE_WINDOW_MS,
            default_limit: protocol::DEFAULT_RATE_LIMIT,
            groups: protocol::DEFAULT_RATE_LIMITS
                .iter()
                .map(|(group, limit)| (group.to_string(), *limit))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
    pub methods: Vec<String>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: protocol::DEDUPE_TTL_MS,
            max_entries: protocol::DEDUPE_MAX_ENTRIES,
            methods: protocol::IDEMPOTENT_METHODS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Maximum model ↔ tool round trips per `chat.send`.
    pub max_iterations: usize,
    /// History messages sent to the model as context.
    pub context_messages: usize,
    /// Concurrent runs allowed per session before `AGENT_BUSY`.
    pub max_concurrent_runs: usize,
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            context_messages: 40,
            max_concurrent_runs: 4,
            system_prompt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = TradeclawConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.rate_limits.groups.get("chat"), Some(&10));
        assert_eq!(cfg.rate_limits.groups.get("backtest"), Some(&5));
        assert!(cfg.idempotency.methods.iter().any(|m| m == "trade.execute"));
        assert_eq!(cfg.idempotency.ttl_ms, 60_000);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: TradeclawConfig = toml::from_str(
            r#"
            [gateway]
            port = 9000

            [decisions.risk_ceilings]
            low = 25.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.bind, "127.0.0.1");
        assert_eq!(cfg.decisions.risk_ceilings.low, 25.0);
        assert_eq!(cfg.decisions.risk_ceilings.high, 85.0);
        assert_eq!(cfg.sessions.transcript, TranscriptBackend::Jsonl);
    }

    #[test]
    fn rejects_unordered_ceilings() {
        let mut cfg = TradeclawConfig::default();
        cfg.decisions.risk_ceilings.low = 90.0;
        assert!(cfg.validate().is_err());
    }
}
