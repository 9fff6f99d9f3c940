//! AI provider contract, tool registry and the streaming agent loop.

pub mod model;
pub mod providers;
pub mod runner;
pub mod tool_registry;

pub use {
    model::{CompletionResponse, EventStream, LlmProvider, StreamEvent, ToolCall, Usage},
    providers::{EchoProvider, ProviderRegistry},
    runner::{AgentRunResult, OnEvent, RunnerEvent, run_agent_loop},
    tool_registry::{AgentTool, ToolRegistry},
};
