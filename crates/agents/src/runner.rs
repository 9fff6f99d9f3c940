use std::sync::Arc;

use {
    anyhow::{Result, bail},
    serde_json::{Value, json},
    tokio_stream::StreamExt,
    tracing::{debug, info, warn},
};

use crate::{
    model::{LlmProvider, StreamEvent, ToolCall, Usage},
    tool_registry::ToolRegistry,
};

/// Result of running the agent loop.
#[derive(Debug)]
pub struct AgentRunResult {
    pub text: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub usage: Usage,
}

/// Callback for streaming events out of the runner.
pub type OnEvent = Box<dyn Fn(RunnerEvent) + Send + Sync>;

/// Events emitted during the agent run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Iteration(usize),
    TextDelta(String),
    ToolCallStart {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolCallEnd {
        id: String,
        name: String,
        success: bool,
        result: Value,
    },
}

fn emit(on_event: Option<&OnEvent>, event: RunnerEvent) {
    if let Some(cb) = on_event {
        cb(event);
    }
}

/// Run the agent loop: stream from the LLM, execute requested tools, repeat
/// until the model answers without tool calls.
///
/// `messages` is the full prompt (system, history, new user turn). Dropping
/// the returned future cancels the run, including a tool call in flight.
pub async fn run_agent_loop(
    provider: Arc<dyn LlmProvider>,
    tools: &ToolRegistry,
    mut messages: Vec<Value>,
    max_iterations: usize,
    on_event: Option<&OnEvent>,
) -> Result<AgentRunResult> {
    let tool_schemas = tools.list_schemas();
    let mut usage = Usage::default();
    let mut total_tool_calls = 0;

    for iteration in 1..=max_iterations {
        emit(on_event, RunnerEvent::Iteration(iteration));
        debug!(iteration, provider = provider.name(), "streaming from LLM");

        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        {
            let mut stream = provider.stream(messages.clone(), tool_schemas.clone());
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Delta(delta) => {
                        text.push_str(&delta);
                        emit(on_event, RunnerEvent::TextDelta(delta));
                    },
                    StreamEvent::ToolCall(call) => calls.push(call),
                    StreamEvent::Done(u) => {
                        usage.add(u);
                        break;
                    },
                    StreamEvent::Error(msg) => {
                        warn!(iteration, error = %msg, "LLM stream error");
                        bail!("provider error: {msg}");
                    },
                }
            }
        }

        if calls.is_empty() {
            info!(
                iterations = iteration,
                tool_calls = total_tool_calls,
                "agent loop complete"
            );
            return Ok(AgentRunResult {
                text,
                iterations: iteration,
                tool_calls_made: total_tool_calls,
                usage,
            });
        }

        let tool_calls_json: Vec<Value> = calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        let mut assistant_msg = json!({
            "role": "assistant",
            "tool_calls": tool_calls_json,
        });
        if !text.is_empty() {
            assistant_msg["content"] = Value::String(text);
        }
        messages.push(assistant_msg);

        for tc in calls {
            total_tool_calls += 1;
            emit(on_event, RunnerEvent::ToolCallStart {
                id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            });

            let (success, result) = match tools.get(&tc.name) {
                Some(tool) => match tool.execute(tc.arguments.clone()).await {
                    Ok(val) => (true, json!({ "result": val })),
                    Err(e) => {
                        warn!(tool = %tc.name, error = %e, "tool execution failed");
                        (false, json!({ "error": format!("{e:#}") }))
                    },
                },
                None => {
                    warn!(tool = %tc.name, "model requested unknown tool");
                    (false, json!({ "error": format!("unknown tool: {}", tc.name) }))
                },
            };

            emit(on_event, RunnerEvent::ToolCallEnd {
                id: tc.id.clone(),
                name: tc.name.clone(),
                success,
                result: result.clone(),
            });

            messages.push(json!({
                "role": "tool",
                "tool_call_id": tc.id,
                "name": tc.name,
                "content": result.to_string(),
            }));
        }
    }

    warn!(max_iterations, "agent loop exceeded max iterations");
    bail!("agent loop exceeded max iterations ({max_iterations})")
}
