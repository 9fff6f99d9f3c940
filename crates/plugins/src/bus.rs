//! Event bus pump: drains published domain events into the hook registry and
//! forwards the batched hook output to a notification sink.

use std::sync::Arc;

use {
    async_trait::async_trait,
    tracing::{debug, info, warn},
};

use {
    tradeclaw_channels::ChannelRegistry,
    tradeclaw_common::{EventReceiver, HookEvent},
    tradeclaw_config::schema::HooksConfig,
};

use crate::{
    hooks::{HookResult, collect_messages},
    registry::HookRegistry,
};

/// One outgoing notification: every hook message produced for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub event: &'static str,
    pub channel: String,
    pub to: String,
    pub messages: Vec<String>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

#[async_trait]
impl NotificationSink for ChannelRegistry {
    async fn notify(&self, n: Notification) -> anyhow::Result<()> {
        self.deliver(&n.channel, &n.to, &n.messages).await?;
        Ok(())
    }
}

/// Where notifications for an event go: the event's own channel and session
/// when it has them, otherwise the configured fallback.
#[derive(Debug, Clone, Default)]
pub struct NotifyRoute {
    pub fallback_channel: Option<String>,
    pub fallback_target: Option<String>,
}

impl NotifyRoute {
    pub fn from_config(config: &HooksConfig) -> Self {
        Self {
            fallback_channel: config.notify_channel.clone(),
            fallback_target: config.notify_target.clone(),
        }
    }

    pub fn resolve(&self, event: &HookEvent) -> Option<(String, String)> {
        let channel = event
            .channel()
            .map(str::to_string)
            .or_else(|| self.fallback_channel.clone())?;
        let to = event
            .session_key()
            .map(str::to_string)
            .or_else(|| self.fallback_target.clone())
            .unwrap_or_else(|| "default".to_string());
        Some((channel, to))
    }
}

/// Callback invoked with every event after hooks ran, e.g. to push it to
/// connected clients.
pub type EventObserver = Arc<dyn Fn(&HookEvent, &[HookResult]) + Send + Sync>;

/// Drain `rx` until every publisher is gone.
pub async fn run_event_bus(
    mut rx: EventReceiver,
    registry: Arc<HookRegistry>,
    sink: Arc<dyn NotificationSink>,
    route: NotifyRoute,
    observer: Option<EventObserver>,
) {
    debug!("event bus started");
    while let Some(event) = rx.recv().await {
        let results = registry.emit(&event, None).await;
        if let Some(observer) = &observer {
            observer(&event, &results);
        }

        let messages = collect_messages(&results);
        if messages.is_empty() {
            continue;
        }
        let Some((channel, to)) = route.resolve(&event) else {
            debug!(event = event.name(), count = messages.len(), "no route for hook messages");
            continue;
        };
        let notification = Notification {
            event: event.name(),
            channel,
            to,
            messages,
        };
        let (channel, to) = (notification.channel.clone(), notification.to.clone());
        if let Err(e) = sink.notify(notification).await {
            warn!(
                event = event.name(),
                channel = %channel,
                to = %to,
                error = %e,
                "notification delivery failed"
            );
        }
    }
    info!("event bus stopped");
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::hooks::{HookContext, HookDefinition, HookHandler},
        std::{sync::Mutex, time::Duration},
        tradeclaw_common::{
            EventPublisher, HookEventKind,
            events::{ChatFinished, CronFired},
        },
    };

    struct Echo(i32);

    #[async_trait]
    impl HookHandler for Echo {
        async fn handle(&self, ctx: &mut HookContext) -> anyhow::Result<()> {
            ctx.push(format!("p{}", self.0));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<Notification>>);

    #[async_trait]
    impl NotificationSink for Capture {
        async fn notify(&self, n: Notification) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(n);
            Ok(())
        }
    }

    fn chat_completed() -> HookEvent {
        HookEvent::ChatCompleted(ChatFinished {
            session_key: "agent:main:telegram:dm:42".into(),
            channel: Some("telegram".into()),
            request_id: "r1".into(),
            text: "done".into(),
        })
    }

    #[tokio::test]
    async fn batches_messages_per_event_and_routes_by_origin() {
        let registry = Arc::new(HookRegistry::new(Duration::from_secs(1)));
        for p in [50, 90] {
            let def = HookDefinition::new(format!("h{p}"), [HookEventKind::ChatCompleted])
                .with_priority(p);
            registry.register(def, Arc::new(Echo(p))).unwrap();
        }
        let sink = Arc::new(Capture::default());
        let (publisher, rx) = EventPublisher::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: EventObserver = {
            let seen = Arc::clone(&seen);
            Arc::new(move |event: &HookEvent, results: &[HookResult]| {
                seen.lock().unwrap().push((event.name(), results.len()));
            })
        };

        publisher.publish(chat_completed());
        publisher.publish(HookEvent::CronFired(CronFired {
            job_id: "j".into(),
            name: "nightly".into(),
            method: "health".into(),
            params: serde_json::Value::Null,
        }));
        drop(publisher);

        run_event_bus(rx, registry, sink.clone(), NotifyRoute::default(), Some(observer)).await;

        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "telegram");
        assert_eq!(sent[0].to, "agent:main:telegram:dm:42");
        assert_eq!(sent[0].messages, ["p90", "p50"]);
        assert_eq!(*seen.lock().unwrap(), [("chat.completed", 2), ("cron.fired", 0)]);
    }

    #[test]
    fn fallback_route_for_channel_less_events() {
        let route = NotifyRoute {
            fallback_channel: Some("log".into()),
            fallback_target: Some("ops".into()),
        };
        let event = HookEvent::CronFired(CronFired {
            job_id: "j".into(),
            name: "n".into(),
            method: "m".into(),
            params: serde_json::Value::Null,
        });
        assert_eq!(route.resolve(&event), Some(("log".into(), "ops".into())));
        assert_eq!(NotifyRoute::default().resolve(&event), None);
        assert_eq!(
            NotifyRoute::default().resolve(&chat_completed()).unwrap().0,
            "telegram"
        );
    }
}
