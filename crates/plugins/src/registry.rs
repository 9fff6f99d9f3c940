use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use {
    serde_json::Value,
    tracing::{debug, info, warn},
};

use tradeclaw_common::{HookEvent, time::now_ms};

use crate::{
    eligibility::{self, Host, SystemHost},
    hooks::{HookContext, HookDefinition, HookHandler, HookInfo, HookResult, LoadedHook},
};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook already registered: {0}")]
    Duplicate(String),
}

/// Registered hooks and their dispatch.
///
/// Readers take a snapshot of the hook list, so `register` / `unregister`
/// never race an in-flight [`emit`](Self::emit). Requirements are checked
/// again on every emit and listing, so a hook becomes runnable once the host
/// gains what it was missing.
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<LoadedHook>>>,
    timeout: Duration,
    host: Arc<dyn Host>,
    /// Serialized gateway config, for `config` requirements.
    config: Value,
    /// Hook ids registered disabled.
    disabled: Vec<String>,
}

impl HookRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            timeout,
            host: Arc::new(SystemHost),
            config: Value::Null,
            disabled: Vec::new(),
        }
    }

    pub fn from_config(config: &tradeclaw_config::TradeclawConfig) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            timeout: Duration::from_millis(config.hooks.timeout_ms),
            host: Arc::new(SystemHost),
            config: serde_json::to_value(config).unwrap_or(Value::Null),
            disabled: config.hooks.disabled.clone(),
        }
    }

    /// Check requirements against `host` instead of the running system.
    pub fn with_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    fn snapshot(&self) -> Vec<Arc<LoadedHook>> {
        match self.hooks.read() {
            Ok(hooks) => hooks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn register(
        &self,
        definition: HookDefinition,
        handler: Arc<dyn HookHandler>,
    ) -> Result<(), HookError> {
        let eligibility =
            eligibility::check_with(&definition.requirements, &self.config, self.host.as_ref());
        if !eligibility.eligible {
            info!(
                hook = %definition.id,
                missing = ?eligibility.missing,
                always = definition.always,
                "hook requirements not met"
            );
        }
        let enabled = !self.disabled.contains(&definition.id);
        let hook = Arc::new(LoadedHook::new(definition, eligibility, handler, enabled));

        let mut hooks = self.hooks.write().unwrap_or_else(|p| p.into_inner());
        if hooks.iter().any(|h| h.id() == hook.id()) {
            return Err(HookError::Duplicate(hook.id().to_string()));
        }
        debug!(hook = hook.id(), enabled, "hook registered");
        hooks.push(hook);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut hooks = self.hooks.write().unwrap_or_else(|p| p.into_inner());
        let before = hooks.len();
        hooks.retain(|h| h.id() != id);
        before != hooks.len()
    }

    /// Returns false for an unknown id.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.snapshot().iter().find(|h| h.id() == id) {
            Some(hook) => {
                hook.set_enabled(enabled);
                info!(hook = id, enabled, "hook toggled");
                true
            },
            None => false,
        }
    }

    /// Re-run the requirement checks for `hook` against the current host.
    fn refresh(&self, hook: &LoadedHook) {
        let eligibility = eligibility::check_with(
            &hook.definition.requirements,
            &self.config,
            self.host.as_ref(),
        );
        let eligible = eligibility.eligible;
        let missing = eligibility.missing.clone();
        if hook.set_eligibility(eligibility) {
            info!(hook = hook.id(), eligible, missing = ?missing, "hook eligibility changed");
        }
    }

    pub fn get(&self, id: &str) -> Option<HookInfo> {
        self.snapshot().iter().find(|h| h.id() == id).map(|h| {
            self.refresh(h);
            h.info()
        })
    }

    /// Descending priority, ties by id.
    pub fn list(&self) -> Vec<HookInfo> {
        let mut hooks = self.snapshot();
        sort_by_priority(&mut hooks);
        hooks
            .iter()
            .map(|h| {
                self.refresh(h);
                h.info()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every runnable hook subscribed to `event`, highest priority first.
    ///
    /// Each handler runs in its own task under the registry timeout. Errors,
    /// panics and timeouts become failed results; later hooks still run.
    pub async fn emit(&self, event: &HookEvent, agent_id: Option<&str>) -> Vec<HookResult> {
        let kind = event.kind();
        let mut selected: Vec<Arc<LoadedHook>> = self
            .snapshot()
            .into_iter()
            .filter(|h| h.subscribes_to(kind) && h.is_enabled())
            .filter(|h| {
                self.refresh(h);
                h.is_runnable()
            })
            .collect();
        if selected.is_empty() {
            return Vec::new();
        }
        sort_by_priority(&mut selected);

        let data = event.payload();
        let mut results = Vec::with_capacity(selected.len());
        for hook in selected {
            let ctx = HookContext {
                event: event.clone(),
                timestamp: now_ms(),
                data: data.clone(),
                agent_id: agent_id.map(str::to_string),
                messages: Vec::new(),
            };
            results.push(self.invoke(&hook, ctx).await);
        }
        results
    }

    async fn invoke(&self, hook: &LoadedHook, mut ctx: HookContext) -> HookResult {
        let started = Instant::now();
        let handler = Arc::clone(&hook.handler);
        let task = tokio::spawn(async move {
            let outcome = handler.handle(&mut ctx).await;
            (outcome, ctx.messages)
        });
        let abort = task.abort_handle();

        let (error, messages) = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok((Ok(()), messages))) => (None, messages),
            Ok(Ok((Err(e), _))) => (Some(format!("{e:#}")), Vec::new()),
            Ok(Err(join)) if join.is_panic() => (Some("hook panicked".to_string()), Vec::new()),
            Ok(Err(join)) => (Some(join.to_string()), Vec::new()),
            Err(_) => {
                abort.abort();
                (
                    Some(format!("timed out after {}ms", self.timeout.as_millis())),
                    Vec::new(),
                )
            },
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Some(error) = &error {
            warn!(hook = hook.id(), duration_ms, error = %error, "hook failed");
        } else {
            debug!(hook = hook.id(), duration_ms, messages = messages.len(), "hook ran");
        }
        HookResult {
            hook_id: hook.id().to_string(),
            success: error.is_none(),
            duration_ms,
            error,
            messages,
        }
    }
}

fn sort_by_priority(hooks: &mut [Arc<LoadedHook>]) {
    hooks.sort_by(|a, b| {
        b.definition
            .priority
            .cmp(&a.definition.priority)
            .then_with(|| a.id().cmp(b.id()))
    });
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::hooks::{HookRequirements, collect_messages},
        async_trait::async_trait,
        std::sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        tradeclaw_common::{HookEventKind, events::GatewayStarted},
    };

    enum Behavior {
        Say(&'static str),
        Fail,
        Panic,
        Hang,
    }

    struct TestHook {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl TestHook {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HookHandler for TestHook {
        async fn handle(&self, ctx: &mut HookContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Say(text) => {
                    ctx.push(format!("{text} on {}", ctx.event.name()));
                    Ok(())
                },
                Behavior::Fail => {
                    ctx.push("never delivered");
                    anyhow::bail!("boom")
                },
                Behavior::Panic => panic!("hook exploded"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
            }
        }
    }

    fn started() -> HookEvent {
        HookEvent::GatewayStarted(GatewayStarted {
            gateway_id: "gw".into(),
            version: "0.0.0".into(),
        })
    }

    fn def(id: &str, priority: i32) -> HookDefinition {
        HookDefinition::new(id, [HookEventKind::GatewayStarted]).with_priority(priority)
    }

    #[tokio::test]
    async fn failing_high_priority_hook_does_not_stop_lower_ones() {
        let registry = HookRegistry::new(Duration::from_secs(1));
        let high = TestHook::new(Behavior::Fail);
        let low = TestHook::new(Behavior::Say("low"));
        registry.register(def("low", 50), low.clone()).unwrap();
        registry.register(def("high", 90), high.clone()).unwrap();

        let results = registry.emit(&started(), None).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].hook_id, "high");
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("boom"));
        assert!(results[1].success);
        assert_eq!(collect_messages(&results), ["low on gateway.started"]);
        assert_eq!(low.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panics_and_timeouts_are_isolated() {
        let registry = HookRegistry::new(Duration::from_millis(50));
        registry
            .register(def("panics", 90), TestHook::new(Behavior::Panic))
            .unwrap();
        registry
            .register(def("hangs", 70), TestHook::new(Behavior::Hang))
            .unwrap();
        registry
            .register(def("speaks", 10), TestHook::new(Behavior::Say("ok")))
            .unwrap();

        let results = registry.emit(&started(), Some("main")).await;
        let outcome: Vec<_> = results
            .iter()
            .map(|r| (r.hook_id.as_str(), r.success))
            .collect();
        assert_eq!(outcome, [("panics", false), ("hangs", false), ("speaks", true)]);
        assert!(results[1].error.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn messages_follow_priority_order() {
        let registry = HookRegistry::new(Duration::from_secs(1));
        registry.register(def("b", 10), TestHook::new(Behavior::Say("b"))).unwrap();
        registry.register(def("a", 80), TestHook::new(Behavior::Say("a"))).unwrap();
        registry.register(def("c", 40), TestHook::new(Behavior::Say("c"))).unwrap();
        let messages = collect_messages(&registry.emit(&started(), None).await);
        assert_eq!(messages, [
            "a on gateway.started",
            "c on gateway.started",
            "b on gateway.started",
        ]);
    }

    #[tokio::test]
    async fn disabled_unsubscribed_and_ineligible_hooks_are_skipped() {
        let registry = HookRegistry::new(Duration::from_secs(1));
        let disabled = TestHook::new(Behavior::Say("disabled"));
        let other = TestHook::new(Behavior::Say("other"));
        let ineligible = TestHook::new(Behavior::Say("ineligible"));
        let forced = TestHook::new(Behavior::Say("forced"));
        let needs_env = HookRequirements {
            env: vec!["TRADECLAW_TEST_SURELY_UNSET_VAR".into()],
            ..Default::default()
        };

        registry.register(def("disabled", 1), disabled.clone()).unwrap();
        registry
            .register(
                HookDefinition::new("other", [HookEventKind::TradeExecuted]),
                other.clone(),
            )
            .unwrap();
        registry
            .register(
                def("ineligible", 1).with_requirements(needs_env.clone()),
                ineligible.clone(),
            )
            .unwrap();
        registry
            .register(def("forced", 1).with_requirements(needs_env).always(), forced.clone())
            .unwrap();
        assert!(registry.set_enabled("disabled", false));
        assert!(!registry.set_enabled("missing", false));

        let results = registry.emit(&started(), None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].hook_id, "forced");
        for hook in [&disabled, &other, &ineligible] {
            assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
        }
        let info = registry.get("ineligible").unwrap();
        assert!(!info.eligible);
        assert_eq!(info.missing, ["env:TRADECLAW_TEST_SURELY_UNSET_VAR"]);
    }

    /// Host whose `SLACK_TOKEN` can be set after hooks are registered.
    #[derive(Default)]
    struct LateTokenHost {
        token_set: AtomicBool,
    }

    impl Host for LateTokenHost {
        fn has_bin(&self, _name: &str) -> bool {
            false
        }

        fn env(&self, name: &str) -> Option<String> {
            (name == "SLACK_TOKEN" && self.token_set.load(Ordering::SeqCst)).then(|| "xoxb".into())
        }

        fn os(&self) -> &str {
            "linux"
        }
    }

    #[tokio::test]
    async fn requirements_are_rechecked_on_emit() {
        let host = Arc::new(LateTokenHost::default());
        let registry = HookRegistry::new(Duration::from_secs(1)).with_host(host.clone());
        let hook = TestHook::new(Behavior::Say("slack"));
        registry
            .register(
                def("slack", 1).with_requirements(HookRequirements {
                    env: vec!["SLACK_TOKEN".into()],
                    ..Default::default()
                }),
                hook.clone(),
            )
            .unwrap();

        assert!(registry.emit(&started(), None).await.is_empty());
        assert_eq!(registry.get("slack").unwrap().missing, ["env:SLACK_TOKEN"]);

        host.token_set.store(true, Ordering::SeqCst);
        let results = registry.emit(&started(), None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert!(registry.list()[0].eligible);

        // And back again once the requirement goes away.
        host.token_set.store(false, Ordering::SeqCst);
        assert!(registry.emit(&started(), None).await.is_empty());
        assert!(!registry.get("slack").unwrap().eligible);
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_unregister_removes() {
        let registry = HookRegistry::new(Duration::from_secs(1));
        registry.register(def("x", 1), TestHook::new(Behavior::Say("x"))).unwrap();
        assert!(matches!(
            registry.register(def("x", 2), TestHook::new(Behavior::Say("y"))),
            Err(HookError::Duplicate(_))
        ));
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
        assert!(registry.is_empty());
    }

    #[test]
    fn config_disables_hooks_at_registration() {
        let mut config = tradeclaw_config::TradeclawConfig::default();
        config.hooks.disabled = vec!["quiet".into()];
        let registry = HookRegistry::from_config(&config);
        registry
            .register(def("quiet", 1), TestHook::new(Behavior::Say("q")))
            .unwrap();
        assert!(!registry.list()[0].enabled);
    }
}
