//! Types shared by every gateway component.
//!
//! The session store, decision engine and hook dispatcher never hold references
//! to one another. They communicate by publishing [`events::HookEvent`] values
//! through an [`bus::EventPublisher`]; the plugins crate drains the matching
//! receiver and fans each event out to hooks.

pub mod bus;
pub mod events;
pub mod time;

pub use {
    bus::{EventPublisher, EventReceiver},
    events::{HookEvent, HookEventKind},
};
