use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use {
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use {
    tradeclaw_common::{
        EventPublisher, HookEvent,
        events::{DecisionNotice, OpportunityDetected, TradeExecuted},
        time::now_ms,
    },
    tradeclaw_config::schema::DecisionsConfig,
};

use crate::{
    error::{DecisionError, Result},
    executor::{ExecutionReport, OrderExecutor, OrderRequest},
    price::PriceProvider,
    scoring::{self, Aggregate},
    types::{
        ApprovedBy, Decision, DecisionAction, DecisionStatus, Direction, MarketOpportunity,
        OpportunityKind, RiskTolerance, Signal, TradeAction, UserGoal,
    },
};

/// Opportunities kept for `makeDecision` lookups; the oldest are dropped.
const MAX_OPPORTUNITIES: usize = 1_000;

#[derive(Default)]
struct EngineState {
    opportunities: HashMap<String, MarketOpportunity>,
    opportunity_order: VecDeque<String>,
    decisions: HashMap<String, Decision>,
    executing: HashSet<String>,
    goal: Option<UserGoal>,
}

impl EngineState {
    fn remember(&mut self, opportunity: MarketOpportunity) {
        self.opportunity_order.push_back(opportunity.id.clone());
        self.opportunities
            .insert(opportunity.id.clone(), opportunity);
        while self.opportunity_order.len() > MAX_OPPORTUNITIES {
            if let Some(old) = self.opportunity_order.pop_front() {
                self.opportunities.remove(&old);
            }
        }
    }
}

fn notice(d: &Decision) -> DecisionNotice {
    DecisionNotice {
        decision_id: d.id.clone(),
        opportunity_id: d.opportunity_id.clone(),
        asset: d.action.asset.clone(),
        action: d.action.kind.as_str().to_string(),
        amount: d.action.amount,
        price: d.action.price,
        risk_check_passed: d.risk_check_passed,
        requires_approval: d.requires_approval,
        status: d.status.as_str().to_string(),
    }
}

/// Move a pending decision past its deadline to `expired`.
fn expire_if_due(d: &mut Decision, now: u64) -> bool {
    match d.expires_at {
        Some(deadline) if d.status == DecisionStatus::Pending && now >= deadline => {
            d.status = DecisionStatus::Expired;
            d.resolved_at = Some(now);
            true
        },
        _ => false,
    }
}

/// Turns signals into opportunities and opportunities into risk-gated,
/// sized decisions.
///
/// Decisions only move `pending → approved | rejected | expired`. Every state
/// change is published on the event bus; the engine holds no reference to
/// sessions or hooks.
pub struct DecisionEngine {
    config: DecisionsConfig,
    prices: Arc<dyn PriceProvider>,
    executor: Arc<dyn OrderExecutor>,
    events: EventPublisher,
    state: RwLock<EngineState>,
}

impl DecisionEngine {
    pub fn new(
        config: DecisionsConfig,
        prices: Arc<dyn PriceProvider>,
        executor: Arc<dyn OrderExecutor>,
        events: EventPublisher,
    ) -> Self {
        Self {
            config,
            prices,
            executor,
            events,
            state: RwLock::new(EngineState::default()),
        }
    }

    pub fn config(&self) -> &DecisionsConfig {
        &self.config
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    // ── Opportunities ────────────────────────────────────────────────────────

    /// Aggregate `signals` into a directional opportunity.
    ///
    /// Returns `None` for an empty set, a tie, or an aggregate that is not
    /// confident or one-sided enough.
    pub async fn analyze_signals(
        &self,
        signals: Vec<Signal>,
        asset: &str,
    ) -> Option<MarketOpportunity> {
        let agg = Aggregate::of(&signals);
        let direction = agg.direction()?;
        let confidence = agg.confidence();
        if confidence <= self.config.min_confidence || agg.dominance() < self.config.min_dominance
        {
            debug!(
                asset,
                confidence,
                dominance = agg.dominance(),
                "signals too weak for a directional call"
            );
            return None;
        }

        let opportunity = MarketOpportunity {
            id: uuid::Uuid::new_v4().to_string(),
            asset: asset.to_string(),
            action: match direction {
                Direction::Bullish => TradeAction::Buy,
                Direction::Bearish => TradeAction::Sell,
            },
            kind: OpportunityKind::Signal,
            confidence,
            risk_score: scoring::signal_risk(&agg),
            expected_return_percent: None,
            protocol: None,
            signals,
            created_at: now_ms(),
        };
        self.record(opportunity.clone()).await;
        Some(opportunity)
    }

    /// Build a staking opportunity for a yield pool. Always succeeds.
    pub async fn create_yield_opportunity(
        &self,
        protocol: &str,
        asset: &str,
        apy: f64,
        tvl: f64,
        extra_signals: Vec<Signal>,
    ) -> MarketOpportunity {
        let agg = Aggregate::of(&extra_signals);
        let risk_score = scoring::yield_risk(apy, tvl, &agg);
        let opportunity = MarketOpportunity {
            id: uuid::Uuid::new_v4().to_string(),
            asset: asset.to_string(),
            action: TradeAction::Stake,
            kind: OpportunityKind::Yield,
            confidence: 100.0 - risk_score,
            risk_score,
            expected_return_percent: Some(apy),
            protocol: Some(protocol.to_string()),
            signals: extra_signals,
            created_at: now_ms(),
        };
        self.record(opportunity.clone()).await;
        opportunity
    }

    async fn record(&self, opportunity: MarketOpportunity) {
        info!(
            opportunity_id = %opportunity.id,
            asset = %opportunity.asset,
            action = opportunity.action.as_str(),
            confidence = opportunity.confidence,
            risk_score = opportunity.risk_score,
            "opportunity detected"
        );
        let event = HookEvent::OpportunityDetected(OpportunityDetected {
            opportunity_id: opportunity.id.clone(),
            asset: opportunity.asset.clone(),
            action: opportunity.action.as_str().to_string(),
            kind: opportunity.kind.as_str().to_string(),
            confidence: opportunity.confidence,
            risk_score: opportunity.risk_score,
        });
        self.state.write().await.remember(opportunity);
        self.events.publish(event);
    }

    pub async fn opportunity(&self, id: &str) -> Option<MarketOpportunity> {
        self.state.read().await.opportunities.get(id).cloned()
    }

    /// Newest first.
    pub async fn opportunities(&self) -> Vec<MarketOpportunity> {
        let state = self.state.read().await;
        state
            .opportunity_order
            .iter()
            .rev()
            .filter_map(|id| state.opportunities.get(id).cloned())
            .collect()
    }

    // ── Goals ────────────────────────────────────────────────────────────────

    pub async fn set_goal(
        &self,
        goal_type: &str,
        risk_tolerance: RiskTolerance,
        time_horizon: &str,
    ) -> UserGoal {
        let goal = UserGoal {
            id: uuid::Uuid::new_v4().to_string(),
            goal_type: goal_type.to_string(),
            risk_tolerance,
            time_horizon: time_horizon.to_string(),
            created_at: now_ms(),
        };
        self.state.write().await.goal = Some(goal.clone());
        goal
    }

    pub async fn goal(&self) -> Option<UserGoal> {
        self.state.read().await.goal.clone()
    }

    /// Highest opportunity risk score acceptable under `tolerance`.
    pub fn risk_ceiling(&self, tolerance: RiskTolerance) -> f64 {
        let c = &self.config.risk_ceilings;
        match tolerance {
            RiskTolerance::Low => c.low,
            RiskTolerance::Moderate => c.moderate,
            RiskTolerance::High => c.high,
        }
    }

    // ── Prices ───────────────────────────────────────────────────────────────

    pub async fn price(&self, symbol: &str, market: Option<&str>) -> Result<f64> {
        let market = market.unwrap_or(&self.config.default_market);
        let price = self.prices.price(symbol, market).await?;
        if !price.is_finite() || price <= 0.0 {
            return Err(DecisionError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        Ok(price)
    }

    // ── Decisions ────────────────────────────────────────────────────────────

    /// Size and gate a decision for an opportunity.
    ///
    /// `Ok(None)` when the opportunity is unknown. A decision that fails the
    /// goal's risk ceiling is still produced, with `riskCheckPassed = false`.
    pub async fn make_decision(
        &self,
        opportunity_id: &str,
        autonomy_level: u8,
        account_balance: f64,
    ) -> Result<Option<Decision>> {
        let (opportunity, tolerance) = {
            let state = self.state.read().await;
            let Some(opportunity) = state.opportunities.get(opportunity_id).cloned() else {
                return Ok(None);
            };
            let tolerance = state
                .goal
                .as_ref()
                .map(|g| g.risk_tolerance)
                .unwrap_or_default();
            (opportunity, tolerance)
        };

        let market = self.config.default_market.clone();
        let price = self.price(&opportunity.asset, Some(&market)).await?;

        let risk_check_passed = opportunity.risk_score <= self.risk_ceiling(tolerance);
        let balance = if account_balance.is_finite() {
            account_balance.max(0.0)
        } else {
            0.0
        };
        let notional_usd =
            balance * self.config.max_position_pct * (1.0 - opportunity.risk_score / 100.0);
        let amount = notional_usd / price;

        let requires_approval = autonomy_level < self.config.approval_threshold;
        let now = now_ms();
        let (status, approved_at, approved_by, expires_at) = if requires_approval {
            let expires_at = (self.config.approval_timeout_secs > 0)
                .then(|| now + self.config.approval_timeout_secs * 1_000);
            (DecisionStatus::Pending, None, None, expires_at)
        } else {
            (
                DecisionStatus::Approved,
                Some(now),
                Some(ApprovedBy::Auto),
                None,
            )
        };

        let decision = Decision {
            id: uuid::Uuid::new_v4().to_string(),
            opportunity_id: opportunity.id.clone(),
            action: DecisionAction {
                kind: opportunity.action,
                asset: opportunity.asset.clone(),
                market,
                amount,
                price,
            },
            notional_usd,
            risk_score: opportunity.risk_score,
            risk_check_passed,
            requires_approval,
            autonomy_level,
            status,
            created_at: now,
            approved_at,
            approved_by,
            resolved_at: approved_at,
            expires_at,
            order_id: None,
            executed_at: None,
        };

        info!(
            decision_id = %decision.id,
            opportunity_id,
            asset = %decision.action.asset,
            amount,
            price,
            risk_check_passed,
            status = status.as_str(),
            "decision created"
        );
        self.state
            .write()
            .await
            .decisions
            .insert(decision.id.clone(), decision.clone());
        self.events
            .publish(HookEvent::DecisionCreated(notice(&decision)));
        Ok(Some(decision))
    }

    /// `pending → approved`.
    ///
    /// On a terminal decision this is a no-op returning the current state,
    /// except that an auto-approved decision which failed its risk check
    /// records the operator's sign-off.
    pub async fn approve_decision(&self, id: &str) -> Option<Decision> {
        self.resolve(id, DecisionStatus::Approved).await
    }

    /// `pending → rejected`. A no-op on terminal decisions.
    pub async fn reject_decision(&self, id: &str) -> Option<Decision> {
        self.resolve(id, DecisionStatus::Rejected).await
    }

    async fn resolve(&self, id: &str, target: DecisionStatus) -> Option<Decision> {
        let now = now_ms();
        let mut events = Vec::new();
        let decision = {
            let mut state = self.state.write().await;
            let d = state.decisions.get_mut(id)?;
            if expire_if_due(d, now) {
                events.push(HookEvent::DecisionExpired(notice(d)));
            }
            match (d.status, target) {
                (DecisionStatus::Pending, DecisionStatus::Approved) => {
                    info!(decision_id = id, "decision approved");
                    d.status = DecisionStatus::Approved;
                    d.approved_at = Some(now);
                    d.approved_by = Some(ApprovedBy::Operator);
                    d.resolved_at = Some(now);
                    events.push(HookEvent::DecisionApproved(notice(d)));
                },
                (DecisionStatus::Pending, _) => {
                    info!(decision_id = id, "decision rejected");
                    d.status = DecisionStatus::Rejected;
                    d.resolved_at = Some(now);
                    events.push(HookEvent::DecisionRejected(notice(d)));
                },
                (DecisionStatus::Approved, DecisionStatus::Approved)
                    if d.approved_by == Some(ApprovedBy::Auto) && !d.risk_check_passed =>
                {
                    info!(decision_id = id, "operator confirmed auto-approved decision");
                    d.approved_by = Some(ApprovedBy::Operator);
                    d.approved_at = Some(now);
                    events.push(HookEvent::DecisionApproved(notice(d)));
                },
                (current, _) => {
                    debug!(
                        decision_id = id,
                        status = current.as_str(),
                        requested = target.as_str(),
                        "decision already resolved"
                    );
                },
            }
            d.clone()
        };
        for event in events {
            self.events.publish(event);
        }
        Some(decision)
    }

    pub async fn decision(&self, id: &str) -> Option<Decision> {
        let now = now_ms();
        let (decision, expired) = {
            let mut state = self.state.write().await;
            let d = state.decisions.get_mut(id)?;
            let expired = expire_if_due(d, now);
            (d.clone(), expired)
        };
        if expired {
            self.events
                .publish(HookEvent::DecisionExpired(notice(&decision)));
        }
        Some(decision)
    }

    /// All decisions, newest first, optionally filtered by status.
    pub async fn decisions(&self, status: Option<DecisionStatus>) -> Vec<Decision> {
        self.expire_stale(now_ms()).await;
        let state = self.state.read().await;
        let mut list: Vec<Decision> = state
            .decisions
            .values()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Expire every pending decision whose deadline is at or before `now`.
    pub async fn expire_stale(&self, now: u64) -> Vec<Decision> {
        let expired: Vec<Decision> = {
            let mut state = self.state.write().await;
            state
                .decisions
                .values_mut()
                .filter_map(|d| expire_if_due(d, now).then(|| d.clone()))
                .collect()
        };
        for d in &expired {
            info!(decision_id = %d.id, "decision expired");
            self.events.publish(HookEvent::DecisionExpired(notice(d)));
        }
        expired
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Hand an approved decision to the order executor. Each decision is
    /// executed at most once.
    pub async fn execute_decision(&self, id: &str) -> Result<ExecutionReport> {
        let now = now_ms();
        let mut expired = None;
        let order = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let d = state
                .decisions
                .get_mut(id)
                .ok_or_else(|| DecisionError::NotFound(id.to_string()))?;
            if expire_if_due(d, now) {
                expired = Some(notice(d));
            }

            let refusal = if d.status != DecisionStatus::Approved {
                Some(format!("status is {}", d.status.as_str()))
            } else if d.order_id.is_some() {
                Some("already executed".to_string())
            } else if !d.risk_check_passed && d.approved_by == Some(ApprovedBy::Auto) {
                Some("risk check failed, operator approval required".to_string())
            } else if !state.executing.insert(id.to_string()) {
                Some("execution in progress".to_string())
            } else {
                None
            };

            match refusal {
                Some(reason) => Err(DecisionError::NotExecutable {
                    id: id.to_string(),
                    reason,
                }),
                None => Ok(OrderRequest {
                    decision_id: d.id.clone(),
                    asset: d.action.asset.clone(),
                    market: d.action.market.clone(),
                    side: d.action.kind,
                    amount: d.action.amount,
                    price: d.action.price,
                }),
            }
        };
        if let Some(n) = expired {
            self.events.publish(HookEvent::DecisionExpired(n));
        }
        let order = order?;

        let result = self.executor.execute(&order).await;

        let mut state = self.state.write().await;
        state.executing.remove(id);
        match result {
            Ok(report) => {
                if let Some(d) = state.decisions.get_mut(id) {
                    d.order_id = Some(report.order_id.clone());
                    d.executed_at = Some(report.filled_at);
                }
                drop(state);
                info!(
                    decision_id = id,
                    order_id = %report.order_id,
                    executor = self.executor.name(),
                    "decision executed"
                );
                self.events.publish(HookEvent::TradeExecuted(TradeExecuted {
                    decision_id: id.to_string(),
                    order_id: report.order_id.clone(),
                    asset: report.asset.clone(),
                    side: report.side.as_str().to_string(),
                    amount: report.amount,
                    price: report.price,
                }));
                Ok(report)
            },
            Err(e) => {
                drop(state);
                warn!(decision_id = id, error = %e, "order execution failed");
                Err(e)
            },
        }
    }
}
