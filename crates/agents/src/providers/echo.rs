//! Offline provider that echoes the last user turn back in word-sized chunks.
//!
//! A user turn of the form `/tool <name> [json-args]` makes it request that
//! tool instead; once the tool result is in the transcript it reports it.

use std::time::Duration;

use {
    async_trait::async_trait,
    serde_json::{Value, json},
};

use crate::model::{CompletionResponse, EventStream, LlmProvider, StreamEvent, ToolCall, Usage};

#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    chunk_delay: Option<Duration>,
}

enum Reply {
    Text(String),
    Call(ToolCall),
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep between streamed chunks, so runs stay abortable in tests.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    fn reply(messages: &[Value]) -> Reply {
        let Some(last) = messages.last() else {
            return Reply::Text(String::new());
        };
        let content = last["content"].as_str().unwrap_or_default();

        if last["role"] == "tool" {
            let name = last["name"].as_str().unwrap_or("tool");
            return Reply::Text(format!("{name} returned {content}"));
        }

        if let Some(rest) = content.strip_prefix("/tool ") {
            let (name, args) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            let arguments = serde_json::from_str(args).unwrap_or_else(|_| json!({}));
            let index = messages.iter().filter(|m| m["role"] == "tool").count();
            return Reply::Call(ToolCall {
                id: format!("call_{index}"),
                name: name.to_string(),
                arguments,
            });
        }

        Reply::Text(format!("Echo: {content}"))
    }

    fn input_tokens(messages: &[Value]) -> u32 {
        let words: usize = messages
            .iter()
            .filter_map(|m| m["content"].as_str())
            .map(|c| c.split_whitespace().count())
            .sum();
        u32::try_from(words).unwrap_or(u32::MAX)
    }
}

/// Split `text` after each run of whitespace, keeping the whitespace.
fn chunks(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_space = false;
    for ch in text.chars() {
        if !ch.is_whitespace() && in_space {
            out.push(std::mem::take(&mut current));
        }
        in_space = ch.is_whitespace();
        current.push(ch);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn id(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        messages: &[Value],
        _tools: &[Value],
    ) -> anyhow::Result<CompletionResponse> {
        let input_tokens = Self::input_tokens(messages);
        Ok(match Self::reply(messages) {
            Reply::Text(text) => CompletionResponse {
                usage: Usage {
                    input_tokens,
                    output_tokens: u32::try_from(chunks(&text).len()).unwrap_or(u32::MAX),
                },
                text: Some(text),
                tool_calls: vec![],
            },
            Reply::Call(call) => CompletionResponse {
                text: None,
                tool_calls: vec![call],
                usage: Usage {
                    input_tokens,
                    output_tokens: 1,
                },
            },
        })
    }

    fn stream(&self, messages: Vec<Value>, _tools: Vec<Value>) -> EventStream<'_> {
        let delay = self.chunk_delay;
        Box::pin(async_stream::stream! {
            let input_tokens = Self::input_tokens(&messages);
            match Self::reply(&messages) {
                Reply::Call(call) => {
                    yield StreamEvent::ToolCall(call);
                    yield StreamEvent::Done(Usage { input_tokens, output_tokens: 1 });
                },
                Reply::Text(text) => {
                    let parts = chunks(&text);
                    let output_tokens = u32::try_from(parts.len()).unwrap_or(u32::MAX);
                    for part in parts {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        yield StreamEvent::Delta(part);
                    }
                    yield StreamEvent::Done(Usage { input_tokens, output_tokens });
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tokio_stream::StreamExt};

    #[test]
    fn chunks_keep_whitespace() {
        assert_eq!(chunks("Echo: hello  world"), ["Echo: ", "hello  ", "world"]);
        assert!(chunks("").is_empty());
    }

    #[tokio::test]
    async fn streams_echo_in_chunks() {
        let provider = EchoProvider::new();
        let events: Vec<_> = provider
            .stream(vec![json!({"role": "user", "content": "buy the dip"})], vec![])
            .collect()
            .await;
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Echo: buy the dip");
        assert!(events.len() > 2);
        assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
    }

    #[tokio::test]
    async fn tool_directive_requests_tool_then_reports_result() {
        let provider = EchoProvider::new();
        let mut messages = vec![json!({"role": "user", "content": "/tool market_price {\"symbol\":\"ETH\"}"})];
        let response = provider.complete(&messages, &[]).await.unwrap();
        assert_eq!(response.tool_calls, [ToolCall {
            id: "call_0".into(),
            name: "market_price".into(),
            arguments: json!({"symbol": "ETH"}),
        }]);

        messages.push(json!({"role": "tool", "name": "market_price", "content": "{\"result\":2000}"}));
        let response = provider.complete(&messages, &[]).await.unwrap();
        assert_eq!(response.text.as_deref(), Some("market_price returned {\"result\":2000}"));
    }
}
