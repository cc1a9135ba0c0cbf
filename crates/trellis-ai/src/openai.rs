//! OpenAI-compatible chat-completions client.
//!
//! Speaks the `/chat/completions` dialect that OpenAI, OpenRouter, and most
//! self-hosted inference servers share: bearer auth, JSON request body,
//! optional `text/event-stream` streaming. Retryable HTTP statuses are
//! retried with bounded exponential backoff.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use trellis_core::BoundedBackoff;

use crate::{
    CompletionClient, CompletionError, CompletionRequest, CompletionResponse, CompletionUsage,
    ContentBlock, StreamDeltaHandler, ToolDefinition, Turn, TurnRole,
};

#[derive(Debug, Clone)]
/// Connection settings for one OpenAI-compatible endpoint.
pub struct OpenAiCompatConfig {
    /// Base URL up to but excluding `/chat/completions`.
    pub api_base: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
}

impl OpenAiCompatConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(120),
            max_retries: 2,
        }
    }
}

/// HTTP completion backend for OpenAI-compatible servers.
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, CompletionError> {
        if config.api_key.trim().is_empty() {
            return Err(CompletionError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|error| {
                CompletionError::InvalidResponse(format!("invalid api key header: {error}"))
            })?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        format!("{base}/chat/completions")
    }

    async fn complete_with_mode(
        &self,
        request: &CompletionRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<CompletionResponse, CompletionError> {
        let mut body = build_request_body(request);
        if on_delta.is_some() {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        let url = self.chat_completions_url();
        let mut backoff = BoundedBackoff::new(Duration::from_millis(250), Duration::from_secs(10));

        for attempt in 0..=self.config.max_retries {
            let response = self.client.post(&url).json(&body).send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        if let Some(delta_handler) = on_delta.clone() {
                            let is_event_stream = response
                                .headers()
                                .get(CONTENT_TYPE)
                                .and_then(|value| value.to_str().ok())
                                .map(|value| {
                                    value.to_ascii_lowercase().contains("text/event-stream")
                                })
                                .unwrap_or(false);
                            if is_event_stream {
                                return parse_stream_response(response, delta_handler).await;
                            }

                            // Server ignored the stream flag; surface the
                            // whole text as one delta.
                            let raw = response.text().await?;
                            let parsed = parse_response(&raw)?;
                            let text = parsed.turn.text_content();
                            if !text.is_empty() {
                                delta_handler(text);
                            }
                            return Ok(parsed);
                        }
                        let raw = response.text().await?;
                        return parse_response(&raw);
                    }

                    let raw = response.text().await?;
                    if attempt < self.config.max_retries && should_retry_status(status.as_u16()) {
                        sleep(backoff.next_delay()).await;
                        continue;
                    }
                    return Err(CompletionError::HttpStatus {
                        status: status.as_u16(),
                        body: raw,
                    });
                }
                Err(error) => {
                    let retryable = error.is_timeout() || error.is_connect() || error.is_request();
                    if attempt < self.config.max_retries && retryable {
                        sleep(backoff.next_delay()).await;
                        continue;
                    }
                    return Err(CompletionError::Http(error));
                }
            }
        }

        Err(CompletionError::InvalidResponse(
            "request retry loop terminated unexpectedly".to_string(),
        ))
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.complete_with_mode(&request, None).await
    }

    async fn complete_with_stream(
        &self,
        request: CompletionRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<CompletionResponse, CompletionError> {
        self.complete_with_mode(&request, on_delta).await
    }
}

fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 409 || status == 425 || status == 429 || status >= 500
}

fn build_request_body(request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": to_wire_messages(&request.turns),
    });
    if !request.tools.is_empty() {
        body["tools"] = to_wire_tools(&request.tools);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

fn to_wire_messages(turns: &[Turn]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(turns.len());
    for turn in turns {
        match turn.role {
            TurnRole::System => messages.push(json!({
                "role": "system",
                "content": turn.text_content(),
            })),
            TurnRole::User => messages.push(json!({
                "role": "user",
                "content": turn.text_content(),
            })),
            TurnRole::Assistant => {
                let mut message = json!({ "role": "assistant" });
                let text = turn.text_content();
                message["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text)
                };
                let calls = turn.tool_calls();
                if !calls.is_empty() {
                    message["tool_calls"] = Value::Array(
                        calls
                            .into_iter()
                            .map(|call| {
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                messages.push(message);
            }
            TurnRole::Tool => messages.push(json!({
                "role": "tool",
                "tool_call_id": turn.tool_call_id.clone().unwrap_or_default(),
                "content": turn.text_content(),
            })),
        }
    }
    messages
}

fn to_wire_tools(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl WireUsage {
    fn into_usage(self) -> CompletionUsage {
        CompletionUsage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

fn parse_response(raw: &str) -> Result<CompletionResponse, CompletionError> {
    let parsed: WireResponse = serde_json::from_str(raw)?;
    let choice = parsed.choices.into_iter().next().ok_or_else(|| {
        CompletionError::InvalidResponse("response contained no choices".to_string())
    })?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
    }
    if let Some(tool_calls) = choice.message.tool_calls {
        for call in tool_calls {
            if call.call_type != "function" {
                continue;
            }
            content.push(ContentBlock::ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: parse_tool_arguments(&call.function.arguments),
            });
        }
    }

    Ok(CompletionResponse {
        turn: Turn::assistant_blocks(content),
        finish_reason: choice.finish_reason,
        usage: parsed.usage.unwrap_or_default().into_usage(),
    })
}

/// Some backends emit arguments that are not valid JSON; those are preserved
/// verbatim as a string for the tool layer to reject with context.
fn parse_tool_arguments(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[derive(Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    delta: Option<WireStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Deserialize)]
struct WireStreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<WireStreamFunction>,
}

#[derive(Deserialize)]
struct WireStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct StreamState {
    text: String,
    tool_calls: Vec<ToolCallAccumulator>,
    finish_reason: Option<String>,
    usage: CompletionUsage,
}

async fn parse_stream_response(
    response: reqwest::Response,
    on_delta: StreamDeltaHandler,
) -> Result<CompletionResponse, CompletionError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut state = StreamState::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let fragment = std::str::from_utf8(chunk.as_ref()).map_err(|error| {
            CompletionError::InvalidResponse(format!(
                "invalid UTF-8 in streaming response: {error}"
            ))
        })?;
        buffer.push_str(fragment);

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(finalize_stream(state));
            }
            apply_stream_data(data, &on_delta, &mut state)?;
        }
    }

    // Stream ended without the [DONE] sentinel; whatever accumulated stands.
    if let Some(data) = buffer.trim().strip_prefix("data:") {
        let data = data.trim();
        if data != "[DONE]" && !data.is_empty() {
            apply_stream_data(data, &on_delta, &mut state)?;
        }
    }
    Ok(finalize_stream(state))
}

fn apply_stream_data(
    data: &str,
    on_delta: &StreamDeltaHandler,
    state: &mut StreamState,
) -> Result<(), CompletionError> {
    let chunk: WireStreamChunk = serde_json::from_str(data).map_err(|error| {
        CompletionError::InvalidResponse(format!("failed to parse stream chunk: {error}"))
    })?;

    if let Some(usage) = chunk.usage {
        state.usage = usage.into_usage();
    }

    for choice in chunk.choices {
        if let Some(reason) = choice.finish_reason {
            state.finish_reason = Some(reason);
        }
        let Some(delta) = choice.delta else { continue };

        if let Some(text) = delta.content {
            if !text.is_empty() {
                state.text.push_str(&text);
                on_delta(text);
            }
        }

        let Some(tool_calls) = delta.tool_calls else {
            continue;
        };
        for delta_call in tool_calls {
            let index = delta_call.index;
            if state.tool_calls.len() <= index {
                state
                    .tool_calls
                    .resize_with(index + 1, ToolCallAccumulator::default);
            }
            let current = &mut state.tool_calls[index];
            if let Some(id) = delta_call.id {
                if !id.is_empty() {
                    current.id = id;
                }
            }
            if let Some(function) = delta_call.function {
                if let Some(name) = function.name {
                    if !name.is_empty() {
                        current.name = name;
                    }
                }
                if let Some(arguments) = function.arguments {
                    current.arguments.push_str(&arguments);
                }
            }
        }
    }

    Ok(())
}

fn finalize_stream(state: StreamState) -> CompletionResponse {
    let mut content = Vec::new();
    if !state.text.is_empty() {
        content.push(ContentBlock::Text { text: state.text });
    }
    for (index, call) in state.tool_calls.into_iter().enumerate() {
        if call.name.trim().is_empty() {
            continue;
        }
        let id = if call.id.trim().is_empty() {
            format!("stream_tool_call_{}", index + 1)
        } else {
            call.id
        };
        content.push(ContentBlock::ToolCall {
            id,
            name: call.name,
            arguments: parse_tool_arguments(&call.arguments),
        });
    }

    CompletionResponse {
        turn: Turn::assistant_blocks(content),
        finish_reason: state.finish_reason,
        usage: state.usage,
    }
}
