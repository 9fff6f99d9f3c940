use std::sync::Mutex;

use {anyhow::Result, async_trait::async_trait, tracing::info};

use crate::plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus};

/// Channel that writes notifications to the log. Registered by default so
/// hook output is visible without any chat integration.
pub struct LogChannel {
    id: String,
    sent: Mutex<Vec<(String, String)>>,
}

impl LogChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// `(to, text)` pairs delivered so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChannelPlugin for LogChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Log"
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(self)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelOutbound for LogChannel {
    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        info!(channel = %self.id, to, text, "notification");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((to.to_string(), text.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelStatus for LogChannel {
    async fn health(&self) -> Result<ChannelHealthSnapshot> {
        Ok(ChannelHealthSnapshot {
            channel: self.id.clone(),
            connected: true,
            details: None,
        })
    }
}
