//! Channel adapters.
//!
//! Each chat surface (Telegram, Discord, Slack, ...) implements
//! [`ChannelPlugin`] and exposes an outbound adapter that accepts batched
//! notification messages.

pub mod log;
pub mod plugin;
pub mod registry;

pub use {
    log::LogChannel,
    plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus},
    registry::{ChannelError, ChannelRegistry},
};
