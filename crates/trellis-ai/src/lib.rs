//! Completion-backend contract shared across Trellis crates.
//!
//! The gateway core never performs inference itself; it drives an external
//! completion/tool-calling interface through the [`CompletionClient`] trait
//! and the message/tool-call types defined here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod openai;

pub use openai::{OpenAiCompatClient, OpenAiCompatConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Role of one turn in a conversation context.
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One tool invocation instruction emitted by the completion backend.
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Content block inside a turn: plain text or a tool invocation.
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
}

impl ContentBlock {
    pub fn tool_call(call: ToolCall) -> Self {
        Self::ToolCall {
            id: call.id,
            name: call.name,
            arguments: call.arguments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One turn of a session history or in-flight execution context.
pub struct Turn {
    pub role: TurnRole,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_turn(TurnRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_turn(TurnRole::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text_turn(TurnRole::Assistant, text)
    }

    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: TurnRole::Tool,
            content: vec![ContentBlock::Text { text: text.into() }],
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            is_error,
        }
    }

    fn text_turn(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            tool_call_id: None,
            tool_name: None,
            is_error: false,
        }
    }

    /// Concatenated text blocks of this turn, skipping tool invocations.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolCall { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool invocation instructions carried by this turn, in emission order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                ContentBlock::Text { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Declarative description of one tool offered to the completion backend.
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One request against the completion backend: assembled context plus tools.
pub struct CompletionRequest {
    pub model: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Token accounting reported by the completion backend for one request.
pub struct CompletionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl CompletionUsage {
    pub fn accumulate(&mut self, other: &CompletionUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Terminal payload of one completion request.
pub struct CompletionResponse {
    pub turn: Turn,
    pub finish_reason: Option<String>,
    pub usage: CompletionUsage,
}

#[derive(Debug, Error)]
/// Failures surfaced by a completion backend.
pub enum CompletionError {
    #[error("completion backend error: {0}")]
    Backend(String),
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion backend returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("completion backend api key is missing")]
    MissingApiKey,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid completion response: {0}")]
    InvalidResponse(String),
}

/// Handler invoked with each incremental text delta while streaming.
pub type StreamDeltaHandler = Arc<dyn Fn(String) + Send + Sync>;

#[async_trait]
/// Contract the gateway core holds against an external completion backend.
///
/// Implementations live outside the core; tests use in-memory fakes.
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;

    /// Streaming variant; backends without streaming fall back to `complete`.
    async fn complete_with_stream(
        &self,
        request: CompletionRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<CompletionResponse, CompletionError> {
        let _ = on_delta;
        self.complete(request).await
    }
}
