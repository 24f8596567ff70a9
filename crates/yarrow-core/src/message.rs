//! Durable message records.
//!
//! Messages are created by the step engine, never mutated, and never
//! deleted except by trimming during compaction (they stay in recall;
//! only their slot in the in-context log is revoked). `created_at` is
//! strictly UTC; anything else read back from storage is converted on
//! load.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a minted tool-call id.
pub const TOOL_CALL_ID_MAX_LEN: usize = 29;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// The function half of a tool call (OpenAI wire shape). `arguments` is a
/// raw JSON string and frequently malformed; see `llm::json_repair`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// A tool call attached to an assistant message. Only `type: "function"`
/// exists on the wire today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Mint a fresh tool-call id of bounded length.
pub fn fresh_tool_call_id() -> String {
    let mut id = Uuid::new_v4().to_string();
    id.truncate(TOOL_CALL_ID_MAX_LEN);
    id
}

/// A single entry in the durable message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub role: Role,
    pub text: Option<String>,
    /// The tool name when `role == Tool`; otherwise a caller-supplied
    /// sender name lifted out of packaged user JSON.
    pub name: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn base(agent_id: Uuid, owner_id: Uuid, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            owner_id,
            role,
            text: Some(text.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            model: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(agent_id: Uuid, owner_id: Uuid, text: impl Into<String>) -> Self {
        Self::base(agent_id, owner_id, Role::System, text)
    }

    pub fn user(agent_id: Uuid, owner_id: Uuid, text: impl Into<String>) -> Self {
        Self::base(agent_id, owner_id, Role::User, text)
    }

    pub fn assistant(agent_id: Uuid, owner_id: Uuid, text: impl Into<String>) -> Self {
        Self::base(agent_id, owner_id, Role::Assistant, text)
    }

    /// A tool-role message answering a specific assistant tool call.
    pub fn tool(
        agent_id: Uuid,
        owner_id: Uuid,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(agent_id, owner_id, Role::Tool, text);
        msg.name = Some(tool_name.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    /// Convert a timestamp read from storage to the strict-UTC invariant.
    pub fn normalize_loaded_timestamp(raw: DateTime<FixedOffset>) -> DateTime<Utc> {
        raw.with_timezone(&Utc)
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    /// Render this message as an OpenAI chat-completions request entry.
    pub fn to_request_value(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "role": self.role.as_str(),
            "content": self.text,
        });
        if let Some(name) = &self.name {
            value["name"] = serde_json::json!(name);
        }
        if let Some(tool_calls) = &self.tool_calls {
            value["tool_calls"] = serde_json::json!(tool_calls);
        }
        if let Some(tool_call_id) = &self.tool_call_id {
            value["tool_call_id"] = serde_json::json!(tool_call_id);
        }
        value
    }
}
