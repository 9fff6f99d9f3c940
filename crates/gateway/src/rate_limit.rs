//! Sliding-window request budgets per principal and method group.
//!
//! A principal is whoever the budget is charged to (a token label or a
//! client address), so reconnecting does not reset it.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use {dashmap::DashMap, tracing::debug};

use {tradeclaw_config::schema::RateLimitConfig, tradeclaw_protocol::method_group};

/// Who a connection's requests are charged to: the label of the token it
/// authenticated with, else the client's IP address.
pub fn principal(auth_label: Option<&str>, remote_addr: SocketAddr) -> String {
    match auth_label {
        Some(label) => format!("token:{label}"),
        None => format!("ip:{}", remote_addr.ip()),
    }
}

pub struct RateLimiter {
    window: Duration,
    default_limit: u32,
    limits: HashMap<String, u32>,
    /// Request timestamps inside the window, keyed by `(principal, group)`.
    windows: DashMap<(String, String), Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_millis(config.window_ms),
            default_limit: config.default_limit,
            limits: config.groups.clone(),
            windows: DashMap::new(),
        }
    }

    pub fn limit_for(&self, group: &str) -> u32 {
        self.limits.get(group).copied().unwrap_or(self.default_limit)
    }

    /// Record a request for `method` charged to `principal`.
    ///
    /// Returns `Err(retry_after_ms)` when the group's budget is spent; a
    /// rejected request does not count against the window.
    pub fn check(&self, principal: &str, method: &str) -> Result<(), u64> {
        self.check_at(principal, method, Instant::now())
    }

    fn check_at(&self, principal: &str, method: &str, now: Instant) -> Result<(), u64> {
        let group = method_group(method);
        let limit = usize::try_from(self.limit_for(group)).unwrap_or(usize::MAX);
        let slot = self
            .windows
            .entry((principal.to_string(), group.to_string()))
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut stamps = slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= limit {
            let retry_after = stamps
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            let retry_after_ms = u64::try_from(retry_after.as_millis())
                .unwrap_or(u64::MAX)
                .max(1);
            debug!(principal, group, limit, retry_after_ms, "rate limited");
            return Err(retry_after_ms);
        }
        stamps.push_back(now);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop windows with no request inside the window. Returns how many were
    /// removed.
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    fn purge_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, stamps| {
            stamps
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });
        before.saturating_sub(self.windows.len())
    }
}
