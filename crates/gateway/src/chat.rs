use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use {
    serde_json::{Value, json},
    tokio::task::AbortHandle,
    tracing::{debug, info, warn},
};

use {
    tradeclaw_agents::{AgentRunResult, LlmProvider, OnEvent, RunnerEvent, run_agent_loop},
    tradeclaw_common::{HookEvent, events::ChatFinished},
    tradeclaw_protocol::{ErrorShape, error_codes, events},
    tradeclaw_sessions::Role,
};

use crate::{methods::MethodResult, state::GatewayState};

// ── Run registry ─────────────────────────────────────────────────────────────

type RunKey = (String, String);

/// Chat runs in flight, keyed by `(session key, request id)`.
///
/// A slot is reserved before the run is spawned and holds its abort handle
/// once attached. Removing the slot is what decides whether a run ended by
/// completing or by being aborted.
#[derive(Default)]
pub struct ChatRuns {
    runs: Mutex<HashMap<RunKey, Option<AbortHandle>>>,
}

fn run_key(session_key: &str, request_id: &str) -> RunKey {
    (session_key.to_string(), request_id.to_string())
}

impl ChatRuns {
    fn lock(&self) -> MutexGuard<'_, HashMap<RunKey, Option<AbortHandle>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a slot. Fails when the request id is already running or the
    /// session has `max_per_session` runs.
    pub fn reserve(&self, session_key: &str, request_id: &str, max_per_session: usize) -> bool {
        let mut runs = self.lock();
        let key = run_key(session_key, request_id);
        let running = runs.keys().filter(|(s, _)| s == session_key).count();
        if runs.contains_key(&key) || running >= max_per_session.max(1) {
            return false;
        }
        runs.insert(key, None);
        true
    }

    /// Store the abort handle of a reserved run. Returns `false` when the run
    /// was aborted before it got a handle; the caller must abort it.
    pub fn attach(&self, session_key: &str, request_id: &str, handle: AbortHandle) -> bool {
        match self.lock().get_mut(&run_key(session_key, request_id)) {
            Some(slot) => {
                *slot = Some(handle);
                true
            },
            None => false,
        }
    }

    /// Release the slot of a finished run. `false` means it was aborted.
    pub fn finish(&self, session_key: &str, request_id: &str) -> bool {
        self.lock()
            .remove(&run_key(session_key, request_id))
            .is_some()
    }

    /// Cancel one run. Returns `false` if no such run is active.
    pub fn abort(&self, session_key: &str, request_id: &str) -> bool {
        match self.lock().remove(&run_key(session_key, request_id)) {
            Some(handle) => {
                if let Some(handle) = handle {
                    handle.abort();
                }
                true
            },
            None => false,
        }
    }

    pub fn count_for(&self, session_key: &str) -> usize {
        self.lock().keys().filter(|(s, _)| s == session_key).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ── chat.send ────────────────────────────────────────────────────────────────

fn resolve_provider(
    state: &GatewayState,
    model: Option<&str>,
) -> Result<Arc<dyn LlmProvider>, ErrorShape> {
    let providers = &state.services.providers;
    match model {
        Some(id) => providers.get(id).ok_or_else(|| {
            ErrorShape::invalid_param("model", &format!("one of {:?}", providers.ids()))
        }),
        None => providers
            .first()
            .ok_or_else(|| ErrorShape::internal("no AI providers configured")),
    }
}

/// System prompt followed by the most recent user and assistant turns.
fn build_prompt(state: &GatewayState, session_key: &str) -> Vec<Value> {
    let chat = &state.config.chat;
    let mut prompt = Vec::new();
    if let Some(system) = chat.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        prompt.push(json!({ "role": "system", "content": system }));
    }
    let history = state
        .services
        .sessions
        .history(session_key, None)
        .unwrap_or_default();
    let turns: Vec<Value> = history
        .iter()
        .filter(|m| m.role != Role::Tool)
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();
    let skip = turns.len().saturating_sub(chat.context_messages.max(1));
    prompt.extend(turns.into_iter().skip(skip));
    prompt
}

/// Maps runner events to `chat.*` stream events and records tool results in
/// the session history.
fn runner_events(
    state: &Arc<GatewayState>,
    session_key: &str,
    request_id: &str,
    stream: bool,
    partial: &Arc<Mutex<String>>,
) -> OnEvent {
    let state = Arc::clone(state);
    let session_key = session_key.to_string();
    let request_id = request_id.to_string();
    let partial = Arc::clone(partial);
    Box::new(move |event: RunnerEvent| match event {
        RunnerEvent::Iteration(n) => {
            debug!(request_id = %request_id, iteration = n, "chat iteration");
        },
        RunnerEvent::TextDelta(text) => {
            partial
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push_str(&text);
            if stream {
                state.streams.publish(
                    &session_key,
                    events::CHAT_CHUNK,
                    json!({ "requestId": request_id, "text": text }),
                );
            }
        },
        RunnerEvent::ToolCallStart {
            id,
            name,
            arguments,
        } => {
            if stream {
                state.streams.publish(
                    &session_key,
                    events::CHAT_TOOL,
                    json!({
                        "requestId": request_id,
                        "state": "start",
                        "toolCallId": id,
                        "tool": name,
                        "arguments": arguments,
                    }),
                );
            }
        },
        RunnerEvent::ToolCallEnd {
            id,
            name,
            success,
            result,
        } => {
            state.services.sessions.append_existing(
                &session_key,
                Role::Tool,
                result.to_string(),
                Some(json!({
                    "requestId": request_id,
                    "toolCallId": id,
                    "tool": name,
                    "success": success,
                })),
            );
            if stream {
                state.streams.publish(
                    &session_key,
                    events::CHAT_TOOL,
                    json!({
                        "requestId": request_id,
                        "state": "end",
                        "toolCallId": id,
                        "tool": name,
                        "success": success,
                        "result": result,
                    }),
                );
            }
        },
    })
}

fn session_channel(state: &GatewayState, session_key: &str) -> Option<String> {
    state
        .services
        .sessions
        .get(session_key)
        .and_then(|s| s.channel)
}

/// Run one chat turn on `session_key` and wait for it to finish.
///
/// Params: `message` (required), `stream` (default `true`), `model`.
pub async fn send(
    state: &Arc<GatewayState>,
    session_key: &str,
    request_id: &str,
    params: &Value,
) -> MethodResult {
    let message = params["message"].as_str().unwrap_or_default();
    let stream = params["stream"].as_bool().unwrap_or(true);
    let provider = resolve_provider(state, params["model"].as_str())?;

    let max_runs = state.config.chat.max_concurrent_runs;
    if !state.chat_runs.reserve(session_key, request_id, max_runs) {
        return Err(ErrorShape::new(
            error_codes::AGENT_BUSY,
            format!("session {session_key} already has {max_runs} active chat runs"),
        ));
    }

    state
        .services
        .sessions
        .add_message(session_key, Role::User, message, None);
    let prompt = build_prompt(state, session_key);
    let model = provider.id().to_string();

    info!(
        session_key,
        request_id,
        model = %model,
        stream,
        "chat run started"
    );
    if stream {
        state.streams.publish(
            session_key,
            events::CHAT_START,
            json!({ "requestId": request_id, "sessionKey": session_key, "model": model }),
        );
    }

    let partial = Arc::new(Mutex::new(String::new()));
    let on_event = runner_events(state, session_key, request_id, stream, &partial);
    let tools = Arc::clone(&state.services.tools);
    let max_iterations = state.config.chat.max_iterations;
    let handle = tokio::spawn(async move {
        run_agent_loop(provider, &tools, prompt, max_iterations, Some(&on_event)).await
    });
    if !state
        .chat_runs
        .attach(session_key, request_id, handle.abort_handle())
    {
        handle.abort();
    }

    let joined = handle.await;
    let still_active = state.chat_runs.finish(session_key, request_id);

    match joined {
        Ok(Ok(result)) if still_active => {
            Ok(complete(state, session_key, request_id, stream, result))
        },
        Ok(Ok(_)) => Ok(aborted(state, session_key, request_id, stream, &partial)),
        Err(e) if e.is_cancelled() => {
            Ok(aborted(state, session_key, request_id, stream, &partial))
        },
        Ok(Err(e)) => {
            warn!(session_key, request_id, error = %e, "chat run failed");
            if stream {
                state.streams.publish(
                    session_key,
                    events::CHAT_ERROR,
                    json!({ "requestId": request_id, "message": e.to_string() }),
                );
            }
            Err(ErrorShape::internal(format!("chat run failed: {e}")))
        },
        Err(e) => {
            warn!(session_key, request_id, error = %e, "chat run panicked");
            if stream {
                state.streams.publish(
                    session_key,
                    events::CHAT_ERROR,
                    json!({ "requestId": request_id, "message": "chat run panicked" }),
                );
            }
            Err(ErrorShape::internal("chat run panicked"))
        },
    }
}

fn complete(
    state: &GatewayState,
    session_key: &str,
    request_id: &str,
    stream: bool,
    result: AgentRunResult,
) -> Value {
    info!(
        session_key,
        request_id,
        iterations = result.iterations,
        tool_calls = result.tool_calls_made,
        "chat run complete"
    );
    if state
        .services
        .sessions
        .append_existing(session_key, Role::Assistant, result.text.clone(), None)
        .is_none()
    {
        debug!(session_key, request_id, "session deleted during run, reply not stored");
    }

    let payload = json!({
        "requestId": request_id,
        "sessionKey": session_key,
        "status": "complete",
        "text": result.text,
        "iterations": result.iterations,
        "toolCallsMade": result.tool_calls_made,
        "usage": result.usage,
    });
    if stream {
        state
            .streams
            .publish(session_key, events::CHAT_COMPLETE, payload.clone());
    }
    state.publish(HookEvent::ChatCompleted(ChatFinished {
        session_key: session_key.to_string(),
        channel: session_channel(state, session_key),
        request_id: request_id.to_string(),
        text: result.text,
    }));
    payload
}

fn aborted(
    state: &GatewayState,
    session_key: &str,
    request_id: &str,
    stream: bool,
    partial: &Mutex<String>,
) -> Value {
    info!(session_key, request_id, "chat run aborted");
    let text = partial
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    let payload = json!({
        "requestId": request_id,
        "sessionKey": session_key,
        "status": "aborted",
        "text": text,
    });
    if stream {
        state
            .streams
            .publish(session_key, events::CHAT_ABORTED, payload.clone());
    }
    state.publish(HookEvent::ChatAborted(ChatFinished {
        session_key: session_key.to_string(),
        channel: session_channel(state, session_key),
        request_id: request_id.to_string(),
        text,
    }));
    payload
}

// ── chat.abort / chat.history ────────────────────────────────────────────────

/// Cancel the run started by `request_id`. The run itself reports
/// `chat.aborted` to the session.
pub fn abort(state: &GatewayState, session_key: &str, request_id: &str) -> MethodResult {
    if !state.chat_runs.abort(session_key, request_id) {
        return Err(ErrorShape::not_found(format!(
            "no active chat run {request_id} in session {session_key}"
        )));
    }
    info!(session_key, request_id, "chat abort requested");
    Ok(json!({ "aborted": true, "requestId": request_id }))
}

pub fn history(state: &GatewayState, session_key: &str, limit: Option<usize>) -> MethodResult {
    let messages = state
        .services
        .sessions
        .history(session_key, limit)
        .ok_or_else(|| {
            ErrorShape::new(
                error_codes::SESSION_NOT_FOUND,
                format!("session not found: {session_key}"),
            )
        })?;
    Ok(json!({ "sessionKey": session_key, "messages": messages }))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::time::Duration,
        tokio::sync::mpsc,
        tradeclaw_agents::{EchoProvider, ProviderRegistry},
        tradeclaw_common::EventPublisher,
        tradeclaw_config::TradeclawConfig,
    };

    use crate::{auth::ResolvedAuth, state::GatewayServices};

    fn gateway(providers: ProviderRegistry) -> Arc<GatewayState> {
        let config = TradeclawConfig::default();
        let services = GatewayServices::in_memory(&config, EventPublisher::detached())
            .unwrap()
            .with_providers(providers);
        GatewayState::new(config, ResolvedAuth::default(), services)
    }

    fn slow_echo() -> ProviderRegistry {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(
            EchoProvider::new().with_chunk_delay(Duration::from_millis(200)),
        ));
        providers
    }

    fn event_names(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let frame: Value = serde_json::from_str(&text).unwrap();
            names.push(frame["event"].as_str().unwrap().to_string());
        }
        names
    }

    #[test]
    fn reserve_caps_runs_per_session() {
        let runs = ChatRuns::default();
        assert!(runs.reserve("s", "a", 2));
        assert!(!runs.reserve("s", "a", 2));
        assert!(runs.reserve("s", "b", 2));
        assert!(!runs.reserve("s", "c", 2));
        assert!(runs.reserve("other", "c", 2));
        assert_eq!(runs.count_for("s"), 2);

        assert!(runs.finish("s", "a"));
        assert!(!runs.finish("s", "a"));
        assert!(runs.abort("s", "b"));
        assert!(!runs.abort("s", "b"));
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn streams_start_chunks_and_complete() {
        let state = gateway(ProviderRegistry::with_echo());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.streams.subscribe("s1", "c1", tx, None);

        let out = send(&state, "s1", "r1", &json!({ "message": "hello there" }))
            .await
            .unwrap();
        assert_eq!(out["status"], "complete");
        assert_eq!(out["text"], "Echo: hello there");

        let names = event_names(&mut rx);
        assert_eq!(names.first().map(String::as_str), Some("chat.start"));
        assert_eq!(names.last().map(String::as_str), Some("chat.complete"));
        assert!(names.iter().filter(|n| *n == "chat.chunk").count() >= 1);

        let history = state.services.sessions.history("s1", None).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert!(state.chat_runs.is_empty());
    }

    #[tokio::test]
    async fn non_streaming_runs_emit_no_events() {
        let state = gateway(ProviderRegistry::with_echo());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.streams.subscribe("s1", "c1", tx, None);

        let out = send(&state, "s1", "r1", &json!({ "message": "hi", "stream": false }))
            .await
            .unwrap();
        assert_eq!(out["text"], "Echo: hi");
        assert!(event_names(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn unknown_model_is_invalid() {
        let state = gateway(ProviderRegistry::with_echo());
        let err = send(&state, "s1", "r1", &json!({ "message": "hi", "model": "gpt-9" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn tool_calls_are_recorded() {
        let state = gateway(ProviderRegistry::with_echo());
        let out = send(&state, "s1", "r1", &json!({
            "message": "/tool pending_decisions {}"
        }))
        .await
        .unwrap();
        assert_eq!(out["toolCallsMade"], 1);

        let history = state.services.sessions.history("s1", None).unwrap();
        let tool = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool.content, r#"{"result":[]}"#);
        assert_eq!(tool.metadata.as_ref().unwrap()["tool"], "pending_decisions");
    }

    #[tokio::test]
    async fn abort_cancels_only_that_run() {
        let state = gateway(slow_echo());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.streams.subscribe("s1", "c1", tx, None);

        let slow = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                send(&state, "s1", "r1", &json!({ "message": "one two three four" })).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.chat_runs.count_for("s1"), 1);

        assert!(abort(&state, "s1", "nope").is_err());
        assert_eq!(abort(&state, "s1", "r1").unwrap()["aborted"], true);

        let out = slow.await.unwrap().unwrap();
        assert_eq!(out["status"], "aborted");
        let names = event_names(&mut rx);
        assert!(names.contains(&"chat.aborted".to_string()));
        assert!(!names.contains(&"chat.complete".to_string()));
        assert!(state.chat_runs.is_empty());
    }

    #[tokio::test]
    async fn deleted_session_stays_deleted_after_run() {
        let state = gateway(slow_echo());
        let run = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                send(&state, "s1", "r1", &json!({ "message": "one two", "stream": false })).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.services.sessions.delete("s1").is_some());

        let out = run.await.unwrap().unwrap();
        assert_eq!(out["status"], "complete");
        assert!(!state.services.sessions.contains("s1"));
    }

    #[tokio::test]
    async fn busy_session_rejects_extra_runs() {
        let state = gateway(slow_echo());
        let max = state.config.chat.max_concurrent_runs;
        for i in 0..max {
            assert!(state.chat_runs.reserve("s1", &format!("held{i}"), max));
        }
        let err = send(&state, "s1", "r1", &json!({ "message": "hi" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::AGENT_BUSY);
    }

    #[test]
    fn history_of_unknown_session() {
        let state = gateway(ProviderRegistry::with_echo());
        let err = history(&state, "missing", None).unwrap_err();
        assert_eq!(err.code, error_codes::SESSION_NOT_FOUND);
    }
}
