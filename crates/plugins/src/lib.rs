//! Hook system: registration, eligibility, prioritized dispatch with failure
//! isolation, and the event bus that feeds it.
//!
//! Components publish [`tradeclaw_common::HookEvent`]s; [`bus::run_event_bus`]
//! drains them into the [`registry::HookRegistry`] and forwards the batched
//! hook messages to a [`bus::NotificationSink`].

pub mod bundled;
pub mod bus;
pub mod eligibility;
pub mod hooks;
pub mod registry;

pub use {
    bus::{EventObserver, Notification, NotificationSink, NotifyRoute, run_event_bus},
    hooks::{
        HookContext, HookDefinition, HookHandler, HookInfo, HookRequirements, HookResult,
        LoadedHook, collect_messages,
    },
    registry::{HookError, HookRegistry},
};
