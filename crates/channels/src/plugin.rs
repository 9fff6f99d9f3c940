use {anyhow::Result, async_trait::async_trait, serde::Serialize};

/// A chat surface the gateway can deliver notifications to.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "telegram", "discord").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Get outbound adapter for sending messages.
    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Send messages to a channel.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> Result<()>;

    /// Deliver several messages as one notification. Adapters that support
    /// richer batching override this; the default joins them with blank lines.
    async fn send_batch(&self, to: &str, messages: &[String]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.send_text(to, &messages.join("\n\n")).await
    }
}

/// Report channel health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn health(&self) -> Result<ChannelHealthSnapshot>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealthSnapshot {
    pub channel: String,
    pub connected: bool,
    pub details: Option<String>,
}
