//! Tool handler contract and execution result.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
/// Payload a tool hands back to the executor. Errors are injected into the
/// model context as error tool-results, never raised as process faults.
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }

    /// Text rendering injected back into the model context.
    pub fn as_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
/// One executable tool. Implementations should observe the run's cancellation
/// signal; a tool that does not will run to completion before the run can
/// finalize.
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, arguments: Value) -> ToolExecutionResult;
}
