//! Chat-completions wire types (OpenAI-compatible).

use serde::{Deserialize, Serialize};

use crate::message::{FunctionCall, ToolCall};

/// A completion request as the transport sees it. `messages` are already
/// rendered request entries; `tools` are raw schema values.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    /// Hint that this is the agent's first turn; prompt formatters use a
    /// different preamble on turn 1.
    #[serde(skip)]
    pub first_message: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<serde_json::Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            first_message: false,
        }
    }

    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
        }
        self
    }

    pub fn with_first_message(mut self, first_message: bool) -> Self {
        self.first_message = first_message;
        self
    }
}

/// The assistant message inside a completion choice.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Deprecated single-call form still emitted by some backends.
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
    pub finish_reason: String,
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct UsageStatistics {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// <https://platform.openai.com/docs/api-reference/chat/object>
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: UsageStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tool_call_reply() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "choices": [{
                "finish_reason": "tool_calls",
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "thinking out loud",
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "send_message", "arguments": "{\"message\": \"hi\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let resp: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.choices[0].finish_reason, "tool_calls");
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "send_message");
        assert_eq!(resp.usage.total_tokens, 15);
    }

    #[test]
    fn decodes_legacy_function_call_reply() {
        let raw = r#"{
            "id": "chatcmpl-2",
            "choices": [{
                "finish_reason": "function_call",
                "message": {
                    "role": "assistant",
                    "function_call": {"name": "send_message", "arguments": "{}"}
                }
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        }"#;
        let resp: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.choices[0].message.tool_calls.is_none());
        assert_eq!(
            resp.choices[0].message.function_call.as_ref().unwrap().name,
            "send_message"
        );
    }

    #[test]
    fn request_serialization_skips_empty_tools() {
        let req = CompletionRequest::new("gpt-4", vec![]);
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("tools").is_none());

        let req = CompletionRequest::new("gpt-4", vec![]).with_tools(vec![serde_json::json!({
            "type": "function", "function": {"name": "noop"}
        })]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["tools"][0]["function"]["name"], "noop");
    }
}
