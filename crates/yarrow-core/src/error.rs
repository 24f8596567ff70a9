//! Error taxonomy for the agent core.
//!
//! Errors are grouped by kind rather than by origin: protocol errors from
//! the completion endpoint, context overflow, rate limiting, tool failures,
//! input validation, concurrency rejections, and core-memory invariant
//! violations. Local recovery rules live with the step engine; everything
//! here is just classification.

use thiserror::Error;
use uuid::Uuid;

use crate::memory::core::CoreMemoryError;

/// Errors surfaced by the completion and embedding transports.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status with the raw body preserved for
    /// classification (overflow detection pattern-matches on it).
    #[error("LLM API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("rate limited: maximum number of retries ({0}) exceeded")]
    RateLimitExhausted(u32),

    #[error("completion response contained no choices")]
    EmptyResponse,

    #[error("API call finished with bad finish reason: {0}")]
    BadFinishReason(String),

    /// The model ran out of context window, either reported via
    /// `finish_reason == "length"` or via an overflow error body.
    #[error("context window exhausted: {0}")]
    ContextOverflow(String),

    #[error("failed to decode completion response: {0}")]
    Decode(String),
}

impl LlmError {
    /// Classify an error as context overflow (based on common OpenAI
    /// response shapes: the `context_length_exceeded` code or the
    /// "maximum context length" message).
    pub fn is_context_overflow(&self) -> bool {
        const MATCH_STRING: &str = "maximum context length";

        match self {
            LlmError::ContextOverflow(_) => true,
            LlmError::Api { body, .. } => {
                if body.contains(MATCH_STRING) {
                    return true;
                }
                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) else {
                    return false;
                };
                let error = &parsed["error"];
                error["code"].as_str() == Some("context_length_exceeded")
                    || error["message"]
                        .as_str()
                        .is_some_and(|m| m.contains(MATCH_STRING))
            }
            _ => false,
        }
    }
}

/// Errors surfaced by the step engine and its callers.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Rejected at ingest, before any state mutation.
    #[error("invalid input: '{0}'")]
    InvalidInput(String),

    #[error("agent '{0}' is currently busy")]
    Busy(Uuid),

    #[error("agent '{0}' does not exist")]
    UnknownAgent(Uuid),

    #[error("invalid credentials")]
    Unauthorized,

    #[error(transparent)]
    Llm(#[from] LlmError),

    /// All reply-repair strategies were exhausted.
    #[error("failed to decode valid agent JSON from LLM output:\n=====\n{0}\n=====")]
    Parse(String),

    #[error(
        "summarize error: tried to run summarize, but couldn't find enough messages to compress [len={candidates}]"
    )]
    NotEnoughToSummarize { candidates: usize },

    /// A second overflow inside the same step; compaction retries at most
    /// once.
    #[error("context overflowed again after compaction")]
    OverflowAfterCompaction,

    #[error("hit first message retry limit ({0})")]
    FirstMessageRetryLimit(usize),

    #[error(transparent)]
    CoreMemory(#[from] CoreMemoryError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, AgentError::Llm(e) if e.is_context_overflow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_from_finish_reason() {
        let err = LlmError::ContextOverflow("finish reason was length".into());
        assert!(err.is_context_overflow());
    }

    #[test]
    fn overflow_from_error_code() {
        let body = r#"{"error":{"code":"context_length_exceeded","message":"too long"}}"#;
        let err = LlmError::Api { status: 400, body: body.into() };
        assert!(err.is_context_overflow());
    }

    #[test]
    fn overflow_from_message_text() {
        let body = r#"{"error":{"message":"This model's maximum context length is 8192 tokens"}}"#;
        let err = LlmError::Api { status: 400, body: body.into() };
        assert!(err.is_context_overflow());
    }

    #[test]
    fn non_overflow_api_error() {
        let err = LlmError::Api { status: 500, body: "internal".into() };
        assert!(!err.is_context_overflow());
        assert!(!LlmError::EmptyResponse.is_context_overflow());
    }

    #[test]
    fn agent_error_classification() {
        let err = AgentError::Llm(LlmError::ContextOverflow("length".into()));
        assert!(err.is_context_overflow());
        assert!(!AgentError::InvalidInput("x".into()).is_context_overflow());
    }
}
