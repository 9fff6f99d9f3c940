//! Hooks shipped with the gateway.

use std::sync::Arc;

use {async_trait::async_trait, tracing::info};

use tradeclaw_common::{HookEvent, HookEventKind, events::DecisionNotice};

use crate::{
    hooks::{HookContext, HookDefinition, HookHandler},
    registry::{HookError, HookRegistry},
};

pub const DECISION_NOTIFIER: &str = "decision-notifier";
pub const SESSION_AUDIT: &str = "session-audit";

/// Register every bundled hook.
pub fn register_bundled(registry: &HookRegistry) -> Result<(), HookError> {
    registry.register(
        HookDefinition::new(DECISION_NOTIFIER, [
            HookEventKind::DecisionCreated,
            HookEventKind::DecisionApproved,
            HookEventKind::DecisionRejected,
            HookEventKind::DecisionExpired,
            HookEventKind::TradeExecuted,
        ])
        .with_priority(50)
        .with_description("Announce decision and trade lifecycle changes")
        .always(),
        Arc::new(DecisionNotifier),
    )?;
    registry.register(
        HookDefinition::new(SESSION_AUDIT, [
            HookEventKind::SessionCreated,
            HookEventKind::SessionCleared,
            HookEventKind::SessionDeleted,
        ])
        .with_priority(10)
        .with_description("Log session lifecycle changes")
        .always(),
        Arc::new(SessionAudit),
    )?;
    Ok(())
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn describe(d: &DecisionNotice) -> String {
    format!(
        "{} {:.6} {} @ {:.2}",
        d.action, d.amount, d.asset, d.price
    )
}

pub struct DecisionNotifier;

#[async_trait]
impl HookHandler for DecisionNotifier {
    async fn handle(&self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let message = match &ctx.event {
            HookEvent::DecisionCreated(d) => {
                let mut text = format!("Decision {}: {}", short(&d.decision_id), describe(d));
                if d.requires_approval {
                    text.push_str(", awaiting approval");
                } else {
                    text.push_str(", auto-approved");
                }
                if !d.risk_check_passed {
                    text.push_str(" (risk check failed)");
                }
                text
            },
            HookEvent::DecisionApproved(d) => {
                format!("Decision {} approved: {}", short(&d.decision_id), describe(d))
            },
            HookEvent::DecisionRejected(d) => {
                format!("Decision {} rejected", short(&d.decision_id))
            },
            HookEvent::DecisionExpired(d) => {
                format!("Decision {} expired without approval", short(&d.decision_id))
            },
            HookEvent::TradeExecuted(t) => format!(
                "Executed {} {:.6} {} @ {:.2} (order {})",
                t.side, t.amount, t.asset, t.price, t.order_id
            ),
            HookEvent::GatewayStarted(_)
            | HookEvent::ClientConnected(_)
            | HookEvent::ClientDisconnected(_)
            | HookEvent::SessionCreated(_)
            | HookEvent::SessionCleared(_)
            | HookEvent::SessionDeleted(_)
            | HookEvent::MessageAdded(_)
            | HookEvent::ChatCompleted(_)
            | HookEvent::ChatAborted(_)
            | HookEvent::OpportunityDetected(_)
            | HookEvent::CronFired(_) => return Ok(()),
        };
        ctx.push(message);
        Ok(())
    }
}

pub struct SessionAudit;

#[async_trait]
impl HookHandler for SessionAudit {
    async fn handle(&self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let (action, session) = match &ctx.event {
            HookEvent::SessionCreated(s) => ("created", s),
            HookEvent::SessionCleared(s) => ("cleared", s),
            HookEvent::SessionDeleted(s) => ("deleted", s),
            _ => return Ok(()),
        };
        info!(
            key = %session.key,
            channel = session.channel.as_deref().unwrap_or("-"),
            action,
            "session audit"
        );
        Ok(())
    }
}
