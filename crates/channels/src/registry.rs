use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, warn};

use crate::plugin::{ChannelHealthSnapshot, ChannelPlugin};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel {0} cannot send messages")]
    NoOutbound(String),

    #[error("delivery to {channel} failed: {message}")]
    Delivery { channel: String, message: String },
}

/// Channels known to the gateway, keyed by id.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Arc<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any channel registered under the same id.
    pub fn register(&mut self, channel: Arc<dyn ChannelPlugin>) {
        let id = channel.id().to_string();
        if self.channels.insert(id.clone(), channel).is_some() {
            warn!(channel = %id, "replacing registered channel");
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ChannelPlugin>> {
        self.channels.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    /// Send `messages` to `to` on `channel` as one batch.
    pub async fn deliver(
        &self,
        channel: &str,
        to: &str,
        messages: &[String],
    ) -> Result<(), ChannelError> {
        let plugin = self
            .get(channel)
            .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))?;
        let outbound = plugin
            .outbound()
            .ok_or_else(|| ChannelError::NoOutbound(channel.to_string()))?;
        debug!(channel, to, count = messages.len(), "delivering batch");
        outbound
            .send_batch(to, messages)
            .await
            .map_err(|e| ChannelError::Delivery {
                channel: channel.to_string(),
                message: format!("{e:#}"),
            })
    }

    /// Health of every channel that exposes a status adapter.
    pub async fn health_all(&self) -> Vec<ChannelHealthSnapshot> {
        let mut snapshots = Vec::new();
        for (id, plugin) in &self.channels {
            let Some(status) = plugin.status() else {
                continue;
            };
            match status.health().await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => snapshots.push(ChannelHealthSnapshot {
                    channel: id.clone(),
                    connected: false,
                    details: Some(e.to_string()),
                }),
            }
        }
        snapshots
    }
}
