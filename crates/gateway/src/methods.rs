use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use {
    serde::de::DeserializeOwned,
    serde_json::{Map, Value, json},
    tracing::{debug, warn},
};

use {
    tradeclaw_common::time::now_ms,
    tradeclaw_decisions::{DecisionError, DecisionStatus, RiskTolerance, Signal},
    tradeclaw_protocol::{ErrorShape, PROTOCOL_VERSION, ResponseFrame, error_codes, method_group},
    tradeclaw_sessions::{CreateOptions, ListFilter, SessionKey},
};

use crate::{chat, cron::CronError, state::GatewayState};

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: Value,
    pub conn_id: String,
    /// Session the connection is bound to.
    pub session_key: String,
    /// Identity the request counts against for rate limiting.
    pub principal: String,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces.
pub type MethodResult = Result<Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// Box an async fn as a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(MethodContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

/// JSON type a required parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Str,
    Number,
    U64,
    Bool,
    Array,
    Object,
}

impl Param {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Str => value.as_str().is_some_and(|s| !s.is_empty()),
            Self::Number => value.as_f64().is_some_and(f64::is_finite),
            Self::U64 => value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Str => "non-empty string",
            Self::Number => "number",
            Self::U64 => "non-negative integer",
            Self::Bool => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Required parameters of a method, checked before its handler runs.
pub type Required = &'static [(&'static str, Param)];

fn validate(params: &Value, required: Required) -> Result<(), ErrorShape> {
    for (name, kind) in required {
        match params.get(*name) {
            None | Some(Value::Null) => return Err(ErrorShape::missing_param(name)),
            Some(value) if !kind.accepts(value) => {
                return Err(ErrorShape::invalid_param(name, kind.expected()));
            },
            Some(_) => {},
        }
    }
    Ok(())
}

// ── Param helpers ────────────────────────────────────────────────────────────

fn str_param<'a>(params: &'a Value, name: &str) -> &'a str {
    params[name].as_str().unwrap_or_default()
}

fn opt_str<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params[name].as_str().filter(|s| !s.is_empty())
}

fn f64_param(params: &Value, name: &str) -> f64 {
    params[name].as_f64().unwrap_or_default()
}

fn opt_usize(params: &Value, name: &str) -> Result<Option<usize>, ErrorShape> {
    match &params[name] {
        Value::Null => Ok(None),
        v => v
            .as_u64()
            .map(|n| Some(usize::try_from(n).unwrap_or(usize::MAX)))
            .ok_or_else(|| ErrorShape::invalid_param(name, "non-negative integer")),
    }
}

fn parse<T: DeserializeOwned>(params: &Value, name: &str, expected: &str) -> Result<T, ErrorShape> {
    serde_json::from_value(params[name].clone())
        .map_err(|_| ErrorShape::invalid_param(name, expected))
}

fn to_json<T: serde::Serialize>(value: T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| ErrorShape::internal(e.to_string()))
}

fn found<T: serde::Serialize>(value: Option<T>, what: &str, id: &str) -> MethodResult {
    match value {
        Some(value) => to_json(value),
        None => Err(ErrorShape::not_found(format!("{what} not found: {id}"))),
    }
}

/// Session targeted by a request: `sessionKey` param, else the connection's.
fn target_session(ctx: &MethodContext) -> String {
    opt_str(&ctx.params, "sessionKey")
        .unwrap_or(&ctx.session_key)
        .to_string()
}

fn session_not_found(key: &str) -> ErrorShape {
    ErrorShape::new(
        error_codes::SESSION_NOT_FOUND,
        format!("session not found: {key}"),
    )
    .with_details(json!({ "key": key }))
}

fn decision_error(err: DecisionError) -> ErrorShape {
    match &err {
        DecisionError::NotFound(_) | DecisionError::PriceUnavailable { .. } => {
            ErrorShape::not_found(err.to_string())
        },
        DecisionError::NotExecutable { .. } => {
            ErrorShape::new(error_codes::FORBIDDEN, err.to_string())
        },
        DecisionError::InvalidPrice { .. } | DecisionError::Execution(_) => {
            ErrorShape::internal(err.to_string())
        },
    }
}

// ── Method registry ──────────────────────────────────────────────────────────

struct Method {
    required: Required,
    handler: HandlerFn,
}

pub struct MethodRegistry {
    handlers: HashMap<String, Method>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, required: Required, handler: HandlerFn) {
        self.handlers
            .insert(method.into(), Method { required, handler });
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Admit and run a client request.
    ///
    /// Rate limit, idempotency replay, method lookup and parameter checks run
    /// in that order; the handler runs last in its own task.
    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        if let Err(retry_after) = ctx.state.rate_limiter.check(&ctx.principal, &ctx.method) {
            let group = method_group(&ctx.method);
            warn!(
                method = %ctx.method,
                conn_id = %ctx.conn_id,
                principal = %ctx.principal,
                retry_after,
                "rate limited"
            );
            let limit = ctx.state.rate_limiter.limit_for(group);
            return ResponseFrame::err(
                &ctx.request_id,
                ErrorShape::new(
                    error_codes::RATE_LIMITED,
                    format!("rate limit exceeded for {group}.*"),
                )
                .with_details(json!({ "group": group, "limit": limit }))
                .with_retry_after(retry_after),
            );
        }
        self.invoke(ctx).await
    }

    /// Everything [`dispatch`](Self::dispatch) does except rate limiting.
    /// Scheduled jobs enter here.
    pub async fn invoke(&self, ctx: MethodContext) -> ResponseFrame {
        let request_id = ctx.request_id.clone();
        let result = if ctx.state.idempotency.applies_to(&ctx.method) {
            let key = format!("{}\u{1f}{}", ctx.session_key, ctx.request_id);
            let state = Arc::clone(&ctx.state);
            state
                .idempotency
                .run(&key, || self.execute(ctx))
                .await
                .map(|cached| cached.payload)
        } else {
            self.execute(ctx).await
        };
        match result {
            Ok(payload) => ResponseFrame::ok(&request_id, payload),
            Err(err) => ResponseFrame::err(&request_id, err),
        }
    }

    async fn execute(&self, ctx: MethodContext) -> MethodResult {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.conn_id.clone();

        let Some(entry) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return Err(ErrorShape::new(
                error_codes::UNKNOWN_METHOD,
                format!("unknown method: {method}"),
            ));
        };
        validate(&ctx.params, entry.required)?;

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match tokio::spawn((entry.handler)(ctx)).await {
            Ok(Ok(payload)) => {
                debug!(method, request_id = %request_id, "method ok");
                Ok(payload)
            },
            Ok(Err(err)) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                Err(err)
            },
            Err(e) => {
                warn!(method, request_id = %request_id, error = %e, "method handler panicked");
                Err(ErrorShape::internal(format!("{method} failed")))
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_gateway_methods();
        self.register_session_methods();
        self.register_chat_methods();
        self.register_market_methods();
        self.register_decision_methods();
        self.register_hook_methods();
        self.register_cron_methods();
    }

    // ── Gateway ──────────────────────────────────────────────────────────

    fn register_gateway_methods(&mut self) {
        self.register("ping", &[], handler(ping));
        self.register("health", &[], handler(health));
        self.register("status", &[], handler(status));
        self.register(
            "events.replay",
            &[("lastSeq", Param::U64)],
            handler(events_replay),
        );
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    fn register_session_methods(&mut self) {
        self.register("sessions.create", &[], handler(sessions_create));
        self.register("sessions.get", &[("key", Param::Str)], handler(sessions_get));
        self.register("sessions.list", &[], handler(sessions_list));
        self.register(
            "sessions.history",
            &[("key", Param::Str)],
            handler(sessions_history),
        );
        self.register(
            "sessions.patch",
            &[("key", Param::Str), ("metadata", Param::Object)],
            handler(sessions_patch),
        );
        self.register(
            "sessions.clear",
            &[("key", Param::Str)],
            handler(sessions_clear),
        );
        self.register(
            "sessions.delete",
            &[("key", Param::Str)],
            handler(sessions_delete),
        );
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    fn register_chat_methods(&mut self) {
        self.register(
            "chat.send",
            &[("message", Param::Str)],
            handler(|ctx: MethodContext| async move {
                let session_key = target_session(&ctx);
                chat::send(&ctx.state, &session_key, &ctx.request_id, &ctx.params).await
            }),
        );
        self.register(
            "chat.abort",
            &[("requestId", Param::Str)],
            handler(|ctx: MethodContext| async move {
                let session_key = target_session(&ctx);
                chat::abort(
                    &ctx.state,
                    &session_key,
                    str_param(&ctx.params, "requestId"),
                )
            }),
        );
        self.register(
            "chat.history",
            &[],
            handler(|ctx: MethodContext| async move {
                let session_key = target_session(&ctx);
                let limit = opt_usize(&ctx.params, "limit")?;
                chat::history(&ctx.state, &session_key, limit)
            }),
        );
    }

    // ── Market ───────────────────────────────────────────────────────────

    fn register_market_methods(&mut self) {
        self.register(
            "market.price",
            &[("symbol", Param::Str)],
            handler(market_price),
        );
        self.register(
            "market.analyze",
            &[("asset", Param::Str), ("signals", Param::Array)],
            handler(market_analyze),
        );
        self.register(
            "market.yield",
            &[
                ("protocol", Param::Str),
                ("asset", Param::Str),
                ("apy", Param::Number),
                ("tvl", Param::Number),
            ],
            handler(market_yield),
        );
        self.register("market.opportunities", &[], handler(market_opportunities));
    }

    // ── Decisions, goals, trades ─────────────────────────────────────────

    fn register_decision_methods(&mut self) {
        self.register(
            "decisions.make",
            &[
                ("opportunityId", Param::Str),
                ("accountBalance", Param::Number),
            ],
            handler(decisions_make),
        );
        self.register(
            "decisions.approve",
            &[("id", Param::Str)],
            handler(|ctx: MethodContext| async move {
                let id = str_param(&ctx.params, "id");
                found(ctx.state.services.decisions.approve_decision(id).await, "decision", id)
            }),
        );
        self.register(
            "decisions.reject",
            &[("id", Param::Str)],
            handler(|ctx: MethodContext| async move {
                let id = str_param(&ctx.params, "id");
                found(ctx.state.services.decisions.reject_decision(id).await, "decision", id)
            }),
        );
        self.register(
            "decisions.get",
            &[("id", Param::Str)],
            handler(|ctx: MethodContext| async move {
                let id = str_param(&ctx.params, "id");
                found(ctx.state.services.decisions.decision(id).await, "decision", id)
            }),
        );
        self.register("decisions.list", &[], handler(decisions_list));
        self.register(
            "goals.set",
            &[
                ("type", Param::Str),
                ("riskTolerance", Param::Str),
                ("timeHorizon", Param::Str),
            ],
            handler(goals_set),
        );
        self.register(
            "goals.get",
            &[],
            handler(|ctx: MethodContext| async move {
                let goal = ctx.state.services.decisions.goal().await;
                Ok(json!({ "goal": goal }))
            }),
        );
        self.register(
            "trade.execute",
            &[("decisionId", Param::Str)],
            handler(|ctx: MethodContext| async move {
                let id = str_param(&ctx.params, "decisionId");
                let report = ctx
                    .state
                    .services
                    .decisions
                    .execute_decision(id)
                    .await
                    .map_err(decision_error)?;
                to_json(report)
            }),
        );
    }

    // ── Hooks ────────────────────────────────────────────────────────────

    fn register_hook_methods(&mut self) {
        self.register(
            "hooks.list",
            &[],
            handler(|ctx: MethodContext| async move {
                Ok(json!({ "hooks": ctx.state.services.hooks.list() }))
            }),
        );
        self.register(
            "hooks.enable",
            &[("id", Param::Str)],
            handler(|ctx: MethodContext| async move { set_hook_enabled(&ctx, true) }),
        );
        self.register(
            "hooks.disable",
            &[("id", Param::Str)],
            handler(|ctx: MethodContext| async move { set_hook_enabled(&ctx, false) }),
        );
    }

    // ── Cron ─────────────────────────────────────────────────────────────

    fn register_cron_methods(&mut self) {
        self.register(
            "cron.add",
            &[
                ("name", Param::Str),
                ("schedule", Param::Str),
                ("method", Param::Str),
            ],
            handler(cron_add),
        );
        self.register(
            "cron.remove",
            &[("id", Param::Str)],
            handler(|ctx: MethodContext| async move {
                let id = str_param(&ctx.params, "id");
                match ctx.state.cron.remove(id) {
                    Some(job) => Ok(json!({ "removed": true, "job": job })),
                    None => Err(ErrorShape::not_found(format!("cron job not found: {id}"))),
                }
            }),
        );
        self.register(
            "cron.list",
            &[],
            handler(|ctx: MethodContext| async move {
                Ok(json!({ "jobs": ctx.state.cron.list() }))
            }),
        );
    }
}

// ── Gateway handlers ─────────────────────────────────────────────────────────

async fn ping(_ctx: MethodContext) -> MethodResult {
    Ok(json!({ "pong": now_ms() }))
}

async fn health(ctx: MethodContext) -> MethodResult {
    Ok(ctx.state.health().await)
}

async fn status(ctx: MethodContext) -> MethodResult {
    let state = &ctx.state;
    let clients: Vec<Value> = state
        .clients
        .read()
        .await
        .values()
        .map(|c| {
            json!({
                "connId": c.conn_id,
                "sessionKey": c.session_key,
                "clientId": c.client.id,
                "platform": c.client.platform,
                "channel": c.channel,
                "authLabel": c.auth_label,
                "connectedSecs": c.connected_at.elapsed().as_secs(),
            })
        })
        .collect();
    Ok(json!({
        "gatewayId": state.gateway_id,
        "version": state.version,
        "hostname": state.hostname,
        "protocol": PROTOCOL_VERSION,
        "uptime": state.uptime_secs(),
        "stateVersion": state.streams.state_version(),
        "clients": clients,
        "sessions": state.services.sessions.len(),
        "activeRuns": state.chat_runs.len(),
        "executor": state.services.decisions.executor_name(),
        "channels": state.services.channels.health_all().await,
    }))
}

async fn events_replay(ctx: MethodContext) -> MethodResult {
    let last_seq = ctx.params["lastSeq"].as_u64().unwrap_or_default();
    to_json(ctx.state.streams.replay(&ctx.session_key, last_seq))
}

// ── Session handlers ─────────────────────────────────────────────────────────

async fn sessions_create(ctx: MethodContext) -> MethodResult {
    let params = &ctx.params;
    let key = opt_str(params, "key")
        .map(str::to_string)
        .unwrap_or_else(|| SessionKey::generated().0);
    let metadata: Map<String, Value> = match &params["metadata"] {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        _ => return Err(ErrorShape::invalid_param("metadata", "object")),
    };
    let sessions = &ctx.state.services.sessions;
    let created = !sessions.contains(&key);
    sessions
        .get_or_restore(&key, CreateOptions {
            display_name: opt_str(params, "displayName").map(str::to_string),
            channel: opt_str(params, "channel").map(str::to_string),
            metadata,
        })
        .await;
    let summary = sessions
        .get(&key)
        .map(|s| s.summary())
        .ok_or_else(|| session_not_found(&key))?;
    Ok(json!({ "created": created, "session": summary }))
}

async fn sessions_get(ctx: MethodContext) -> MethodResult {
    let key = str_param(&ctx.params, "key");
    let session = ctx
        .state
        .services
        .sessions
        .get(key)
        .ok_or_else(|| session_not_found(key))?;
    to_json(session)
}

async fn sessions_list(ctx: MethodContext) -> MethodResult {
    let filter = ListFilter {
        channel: opt_str(&ctx.params, "channel").map(str::to_string),
        limit: opt_usize(&ctx.params, "limit")?,
    };
    Ok(json!({ "sessions": ctx.state.services.sessions.list(&filter) }))
}

async fn sessions_history(ctx: MethodContext) -> MethodResult {
    let key = str_param(&ctx.params, "key");
    let limit = opt_usize(&ctx.params, "limit")?;
    let messages = ctx
        .state
        .services
        .sessions
        .history(key, limit)
        .ok_or_else(|| session_not_found(key))?;
    Ok(json!({ "key": key, "messages": messages }))
}

async fn sessions_patch(ctx: MethodContext) -> MethodResult {
    let key = str_param(&ctx.params, "key");
    let patch = ctx.params["metadata"].as_object().cloned().unwrap_or_default();
    let summary = ctx
        .state
        .services
        .sessions
        .update_metadata(key, patch)
        .ok_or_else(|| session_not_found(key))?;
    to_json(summary)
}

async fn sessions_clear(ctx: MethodContext) -> MethodResult {
    let key = str_param(&ctx.params, "key");
    if !ctx.state.services.sessions.clear(key) {
        return Err(session_not_found(key));
    }
    Ok(json!({ "key": key, "cleared": true }))
}

async fn sessions_delete(ctx: MethodContext) -> MethodResult {
    let key = str_param(&ctx.params, "key");
    let state = &ctx.state;
    let session = state
        .services
        .sessions
        .delete(key)
        .ok_or_else(|| session_not_found(key))?;
    let bound = state
        .clients
        .read()
        .await
        .values()
        .any(|c| c.session_key == key);
    if !bound {
        state.streams.remove(key);
    }
    Ok(json!({ "key": key, "deleted": true, "messageCount": session.messages.len() }))
}

// ── Market handlers ──────────────────────────────────────────────────────────

async fn market_price(ctx: MethodContext) -> MethodResult {
    let symbol = str_param(&ctx.params, "symbol");
    let engine = &ctx.state.services.decisions;
    let market = opt_str(&ctx.params, "market").unwrap_or(&engine.config().default_market);
    let price = engine
        .price(symbol, Some(market))
        .await
        .map_err(decision_error)?;
    Ok(json!({ "symbol": symbol, "market": market, "price": price }))
}

async fn market_analyze(ctx: MethodContext) -> MethodResult {
    let asset = str_param(&ctx.params, "asset");
    let signals: Vec<Signal> = parse(&ctx.params, "signals", "array of signals")?;
    let opportunity = ctx
        .state
        .services
        .decisions
        .analyze_signals(signals, asset)
        .await;
    Ok(json!({ "opportunity": opportunity }))
}

async fn market_yield(ctx: MethodContext) -> MethodResult {
    let params = &ctx.params;
    let apy = f64_param(params, "apy");
    let tvl = f64_param(params, "tvl");
    if apy < 0.0 {
        return Err(ErrorShape::invalid_param("apy", "non-negative number"));
    }
    if tvl < 0.0 {
        return Err(ErrorShape::invalid_param("tvl", "non-negative number"));
    }
    let signals: Vec<Signal> = match &params["signals"] {
        Value::Null => Vec::new(),
        _ => parse(params, "signals", "array of signals")?,
    };
    let opportunity = ctx
        .state
        .services
        .decisions
        .create_yield_opportunity(
            str_param(params, "protocol"),
            str_param(params, "asset"),
            apy,
            tvl,
            signals,
        )
        .await;
    to_json(opportunity)
}

async fn market_opportunities(ctx: MethodContext) -> MethodResult {
    let mut opportunities = ctx.state.services.decisions.opportunities().await;
    if let Some(limit) = opt_usize(&ctx.params, "limit")? {
        opportunities.truncate(limit);
    }
    Ok(json!({ "opportunities": opportunities }))
}

// ── Decision handlers ────────────────────────────────────────────────────────

async fn decisions_make(ctx: MethodContext) -> MethodResult {
    let params = &ctx.params;
    let opportunity_id = str_param(params, "opportunityId");
    let balance = f64_param(params, "accountBalance");
    if balance < 0.0 {
        return Err(ErrorShape::invalid_param(
            "accountBalance",
            "non-negative number",
        ));
    }
    let autonomy_level = match &params["autonomyLevel"] {
        Value::Null => 0,
        v => v
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| ErrorShape::invalid_param("autonomyLevel", "integer 0-255"))?,
    };
    let decision = ctx
        .state
        .services
        .decisions
        .make_decision(opportunity_id, autonomy_level, balance)
        .await
        .map_err(decision_error)?
        .ok_or_else(|| {
            ErrorShape::not_found(format!("opportunity not found: {opportunity_id}"))
        })?;
    to_json(decision)
}

async fn decisions_list(ctx: MethodContext) -> MethodResult {
    let status: Option<DecisionStatus> = match &ctx.params["status"] {
        Value::Null => None,
        _ => Some(parse(
            &ctx.params,
            "status",
            "pending, approved, rejected or expired",
        )?),
    };
    let decisions = ctx.state.services.decisions.decisions(status).await;
    Ok(json!({ "decisions": decisions }))
}

async fn goals_set(ctx: MethodContext) -> MethodResult {
    let params = &ctx.params;
    let tolerance: RiskTolerance = parse(params, "riskTolerance", "low, moderate or high")?;
    let goal = ctx
        .state
        .services
        .decisions
        .set_goal(
            str_param(params, "type"),
            tolerance,
            str_param(params, "timeHorizon"),
        )
        .await;
    to_json(goal)
}

// ── Hook and cron handlers ───────────────────────────────────────────────────

fn set_hook_enabled(ctx: &MethodContext, enabled: bool) -> MethodResult {
    let id = str_param(&ctx.params, "id");
    let hooks = &ctx.state.services.hooks;
    if !hooks.set_enabled(id, enabled) {
        return Err(ErrorShape::not_found(format!("hook not found: {id}")));
    }
    found(hooks.get(id), "hook", id)
}

async fn cron_add(ctx: MethodContext) -> MethodResult {
    let params = &ctx.params;
    let enabled = match &params["enabled"] {
        Value::Null => true,
        v => v
            .as_bool()
            .ok_or_else(|| ErrorShape::invalid_param("enabled", "boolean"))?,
    };
    let job = ctx
        .state
        .cron
        .add(
            str_param(params, "name"),
            str_param(params, "schedule"),
            str_param(params, "method"),
            params.get("params").cloned().unwrap_or(Value::Null),
            enabled,
        )
        .map_err(|e| match e {
            CronError::InvalidSchedule { .. } => {
                ErrorShape::invalid_param("schedule", "cron expression with seconds")
                    .with_details(json!({ "param": "schedule", "reason": e.to_string() }))
            },
            CronError::ForbiddenMethod(_) => ErrorShape::new(error_codes::FORBIDDEN, e.to_string()),
        })?;
    to_json(job)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
        tradeclaw_common::EventPublisher,
        tradeclaw_config::TradeclawConfig,
    };

    use crate::{auth::ResolvedAuth, state::GatewayServices};

    fn gateway(config: TradeclawConfig) -> Arc<GatewayState> {
        let services = GatewayServices::in_memory(&config, EventPublisher::detached()).unwrap();
        GatewayState::new(config, ResolvedAuth::default(), services)
    }

    fn ctx(state: &Arc<GatewayState>, id: &str, method: &str, params: Value) -> MethodContext {
        MethodContext {
            request_id: id.into(),
            method: method.into(),
            params,
            conn_id: "conn-1".into(),
            session_key: "s1".into(),
            principal: "ip:127.0.0.1".into(),
            state: Arc::clone(state),
        }
    }

    #[tokio::test]
    async fn unknown_method_and_param_checks() {
        let state = gateway(TradeclawConfig::default());
        let methods = MethodRegistry::new();

        let res = methods.dispatch(ctx(&state, "1", "nope", json!({}))).await;
        assert_eq!(res.error_code(), Some(error_codes::UNKNOWN_METHOD));

        let res = methods
            .dispatch(ctx(&state, "2", "market.price", json!({})))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::MISSING_PARAMS));

        let res = methods
            .dispatch(ctx(&state, "3", "market.price", json!({ "symbol": 5 })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::INVALID_PARAMS));

        let res = methods
            .dispatch(ctx(&state, "4", "events.replay", json!({ "lastSeq": -1 })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn catalogue_is_complete() {
        let methods = MethodRegistry::new();
        for name in [
            "ping",
            "health",
            "status",
            "events.replay",
            "sessions.create",
            "sessions.get",
            "sessions.list",
            "sessions.history",
            "sessions.clear",
            "sessions.delete",
            "chat.send",
            "chat.abort",
            "chat.history",
            "market.price",
            "market.analyze",
            "market.yield",
            "market.opportunities",
            "decisions.make",
            "decisions.approve",
            "decisions.reject",
            "decisions.get",
            "decisions.list",
            "goals.set",
            "goals.get",
            "trade.execute",
            "hooks.list",
            "hooks.enable",
            "hooks.disable",
            "cron.add",
            "cron.remove",
            "cron.list",
        ] {
            assert!(methods.contains(name), "{name} not registered");
        }
    }

    #[tokio::test]
    async fn status_reports_channel_health() {
        let state = gateway(TradeclawConfig::default());
        let methods = MethodRegistry::new();

        let res = methods.dispatch(ctx(&state, "1", "status", json!({}))).await;
        let payload = res.payload.unwrap();
        assert_eq!(payload["protocol"], PROTOCOL_VERSION);
        assert_eq!(payload["channels"][0]["channel"], "log");
        assert_eq!(payload["channels"][0]["connected"], true);
        assert_eq!(payload["executor"], "paper");
    }

    #[tokio::test]
    async fn rate_limit_precedes_lookup() {
        let mut config = TradeclawConfig::default();
        config.rate_limits.default_limit = 2;
        let state = gateway(config);
        let methods = MethodRegistry::new();

        for id in ["1", "2"] {
            assert!(methods.dispatch(ctx(&state, id, "ping", json!({}))).await.ok);
        }
        let res = methods.dispatch(ctx(&state, "3", "ping", json!({}))).await;
        let err = res.error.unwrap();
        assert_eq!(err.code, error_codes::RATE_LIMITED);
        assert!(err.retry_after.is_some());

        // Internal invocations bypass the limiter.
        assert!(methods.invoke(ctx(&state, "4", "ping", json!({}))).await.ok);
    }

    #[tokio::test]
    async fn idempotent_methods_run_once() {
        let state = gateway(TradeclawConfig::default());
        let mut methods = MethodRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        methods.register(
            "sessions.create",
            &[],
            Box::new(move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(json!({ "n": n })) })
            }),
        );

        let first = methods
            .dispatch(ctx(&state, "r1", "sessions.create", json!({})))
            .await;
        let again = methods
            .dispatch(ctx(&state, "r1", "sessions.create", json!({})))
            .await;
        assert_eq!(first.payload, again.payload);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        methods
            .dispatch(ctx(&state, "r2", "sessions.create", json!({})))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let state = gateway(TradeclawConfig::default());
        let mut methods = MethodRegistry::new();
        methods.register(
            "boom",
            &[],
            handler(|_ctx: MethodContext| async move {
                if now_ms() > 0 {
                    panic!("boom");
                }
                Ok(Value::Null)
            }),
        );
        let res = methods.dispatch(ctx(&state, "1", "boom", json!({}))).await;
        assert_eq!(res.error_code(), Some(error_codes::INTERNAL_ERROR));
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let state = gateway(TradeclawConfig::default());
        let methods = MethodRegistry::new();

        let res = methods
            .dispatch(ctx(&state, "1", "sessions.create", json!({
                "key": "desk",
                "channel": "log",
                "metadata": { "owner": "ops" }
            })))
            .await;
        let payload = res.payload.unwrap();
        assert_eq!(payload["created"], true);
        assert_eq!(payload["session"]["metadata"]["owner"], "ops");

        let res = methods
            .dispatch(ctx(&state, "2", "sessions.list", json!({ "channel": "log" })))
            .await;
        assert_eq!(res.payload.unwrap()["sessions"].as_array().unwrap().len(), 1);

        let res = methods
            .dispatch(ctx(&state, "3", "sessions.clear", json!({ "key": "nope" })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::SESSION_NOT_FOUND));

        let res = methods
            .dispatch(ctx(&state, "4", "sessions.delete", json!({ "key": "desk" })))
            .await;
        assert!(res.ok);
        let res = methods
            .dispatch(ctx(&state, "5", "sessions.get", json!({ "key": "desk" })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::SESSION_NOT_FOUND));
    }

    #[tokio::test]
    async fn decision_flow_through_methods() {
        let mut config = TradeclawConfig::default();
        config.decisions.prices.insert("ETH".into(), 2000.0);
        let state = gateway(config);
        let methods = MethodRegistry::new();

        let res = methods
            .dispatch(ctx(&state, "1", "market.analyze", json!({
                "asset": "ETH",
                "signals": [
                    { "source": "rsi", "direction": "bullish", "strength": 80 },
                    { "source": "macd", "direction": "bullish", "strength": 75 }
                ]
            })))
            .await;
        let opportunity = res.payload.unwrap()["opportunity"].clone();
        assert_eq!(opportunity["action"], "buy");

        let res = methods
            .dispatch(ctx(&state, "2", "decisions.make", json!({
                "opportunityId": opportunity["id"],
                "accountBalance": 10_000.0
            })))
            .await;
        let decision = res.payload.unwrap();
        assert_eq!(decision["status"], "pending");

        let res = methods
            .dispatch(ctx(&state, "3", "trade.execute", json!({ "decisionId": decision["id"] })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::FORBIDDEN));

        let res = methods
            .dispatch(ctx(&state, "4", "decisions.approve", json!({ "id": decision["id"] })))
            .await;
        assert_eq!(res.payload.unwrap()["status"], "approved");

        let res = methods
            .dispatch(ctx(&state, "5", "trade.execute", json!({ "decisionId": decision["id"] })))
            .await;
        assert!(res.payload.unwrap()["orderId"].is_string());

        let res = methods
            .dispatch(ctx(&state, "6", "trade.execute", json!({ "decisionId": "missing" })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::NOT_FOUND));

        let res = methods
            .dispatch(ctx(&state, "7", "decisions.make", json!({
                "opportunityId": "missing",
                "accountBalance": 1.0
            })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::NOT_FOUND));
    }

    #[tokio::test]
    async fn goals_and_hooks() {
        let state = gateway(TradeclawConfig::default());
        let methods = MethodRegistry::new();

        let res = methods
            .dispatch(ctx(&state, "1", "goals.set", json!({
                "type": "growth",
                "riskTolerance": "reckless",
                "timeHorizon": "1y"
            })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::INVALID_PARAMS));

        let res = methods
            .dispatch(ctx(&state, "2", "goals.set", json!({
                "type": "growth",
                "riskTolerance": "low",
                "timeHorizon": "1y"
            })))
            .await;
        assert_eq!(res.payload.unwrap()["riskTolerance"], "low");

        let res = methods
            .dispatch(ctx(&state, "3", "hooks.disable", json!({ "id": "session-audit" })))
            .await;
        assert_eq!(res.payload.unwrap()["enabled"], false);
        let res = methods
            .dispatch(ctx(&state, "4", "hooks.enable", json!({ "id": "nope" })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::NOT_FOUND));
    }

    #[tokio::test]
    async fn cron_jobs_via_methods() {
        let state = gateway(TradeclawConfig::default());
        let methods = MethodRegistry::new();

        let res = methods
            .dispatch(ctx(&state, "1", "cron.add", json!({
                "name": "loop",
                "schedule": "0 * * * * *",
                "method": "cron.list"
            })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::FORBIDDEN));

        let res = methods
            .dispatch(ctx(&state, "2", "cron.add", json!({
                "name": "bad",
                "schedule": "whenever",
                "method": "health"
            })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::INVALID_PARAMS));

        let res = methods
            .dispatch(ctx(&state, "3", "cron.add", json!({
                "name": "health",
                "schedule": "0 * * * * *",
                "method": "health"
            })))
            .await;
        let id = res.payload.unwrap()["id"].as_str().unwrap().to_string();

        let res = methods.dispatch(ctx(&state, "4", "cron.list", json!({}))).await;
        assert_eq!(res.payload.unwrap()["jobs"].as_array().unwrap().len(), 1);
        let res = methods
            .dispatch(ctx(&state, "5", "cron.remove", json!({ "id": id })))
            .await;
        assert!(res.ok);
        let res = methods
            .dispatch(ctx(&state, "6", "cron.remove", json!({ "id": id })))
            .await;
        assert_eq!(res.error_code(), Some(error_codes::NOT_FOUND));
    }
}
