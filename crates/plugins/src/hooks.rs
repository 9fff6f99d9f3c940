//! Hook definitions, per-invocation context and results.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use tradeclaw_common::{HookEvent, HookEventKind};

use crate::eligibility::Eligibility;

/// What a hook needs from the host before it may run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookRequirements {
    /// Binaries that must be on `PATH`.
    pub bins: Vec<String>,
    /// Environment variables that must be set and non-empty.
    pub env: Vec<String>,
    /// Dotted config paths that must resolve to a truthy value.
    pub config: Vec<String>,
    /// Allowed `std::env::consts::OS` values. Empty means any.
    pub os: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub events: Vec<HookEventKind>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub requirements: HookRequirements,
    /// Run even when requirements are not met.
    #[serde(default)]
    pub always: bool,
}

impl HookDefinition {
    pub fn new(id: impl Into<String>, events: impl IntoIterator<Item = HookEventKind>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            events: events.into_iter().collect(),
            priority: 0,
            requirements: HookRequirements::default(),
            always: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_requirements(mut self, requirements: HookRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }
}

/// Fresh context handed to one hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: HookEvent,
    pub timestamp: u64,
    /// JSON payload of `event`.
    pub data: Value,
    pub agent_id: Option<String>,
    /// User-facing output, batched with other hooks' messages.
    pub messages: Vec<String>,
}

impl HookContext {
    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &mut HookContext) -> anyhow::Result<()>;
}

/// A registered hook. The enabled flag and the last eligibility result change
/// after registration.
pub struct LoadedHook {
    pub definition: HookDefinition,
    pub handler: Arc<dyn HookHandler>,
    eligibility: RwLock<Eligibility>,
    enabled: AtomicBool,
}

impl LoadedHook {
    pub fn new(
        definition: HookDefinition,
        eligibility: Eligibility,
        handler: Arc<dyn HookHandler>,
        enabled: bool,
    ) -> Self {
        Self {
            definition,
            handler,
            eligibility: RwLock::new(eligibility),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn eligibility(&self) -> Eligibility {
        self.eligibility
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Store a fresh check result. Returns true when it differs from the last.
    pub fn set_eligibility(&self, eligibility: Eligibility) -> bool {
        let mut current = self
            .eligibility
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current == eligibility {
            return false;
        }
        *current = eligibility;
        true
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn subscribes_to(&self, kind: HookEventKind) -> bool {
        self.definition.events.contains(&kind)
    }

    /// Enabled, and either eligible or marked `always`.
    pub fn is_runnable(&self) -> bool {
        self.is_enabled() && (self.definition.always || self.eligibility().eligible)
    }

    pub fn info(&self) -> HookInfo {
        let eligibility = self.eligibility();
        HookInfo {
            id: self.definition.id.clone(),
            description: self.definition.description.clone(),
            events: self.definition.events.clone(),
            priority: self.definition.priority,
            enabled: self.is_enabled(),
            always: self.definition.always,
            eligible: eligibility.eligible,
            missing: eligibility.missing,
        }
    }
}

/// Listing entry for `hooks.list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInfo {
    pub id: String,
    pub description: String,
    pub events: Vec<HookEventKind>,
    pub priority: i32,
    pub enabled: bool,
    pub always: bool,
    pub eligible: bool,
    pub missing: Vec<String>,
}

/// Outcome of one hook invocation. Failures are recorded here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    pub hook_id: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub messages: Vec<String>,
}

/// Every hook's messages, in the order the results were produced.
pub fn collect_messages(results: &[HookResult]) -> Vec<String> {
    results
        .iter()
        .flat_map(|r| r.messages.iter().cloned())
        .collect()
}
