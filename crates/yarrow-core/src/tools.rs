//! Tool contract, registry, and the built-in memory tool set.
//!
//! Tools receive a capability handle (`ToolContext`) instead of a
//! back-reference to the agent: core-memory edits, recall/archival
//! search, archival insert, and user-visible message emission are the
//! only powers a tool has. The handle is never echoed back into the
//! conversation.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::interface::AgentInterface;
use crate::memory::archival::ArchivalMemory;
use crate::memory::core::{CoreMemory, CoreMemoryField};
use crate::memory::recall::RecallMemory;
use crate::message::Message;
use crate::system::format_time;

/// Tool returns longer than this are truncated unless the tool pages.
pub const FUNCTION_RETURN_CHAR_LIMIT: usize = 3000;

/// Tools that manage overflow through their own paging and are exempt
/// from return truncation.
pub const PAGING_TOOLS: [&str; 3] = [
    "conversation_search",
    "conversation_search_date",
    "archival_memory_search",
];

/// Results per page for the search tools.
pub const RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE: usize = 5;

pub const REQUEST_HEARTBEAT_PARAM: &str = "request_heartbeat";

const REQUEST_HEARTBEAT_DESCRIPTION: &str = "Request an immediate heartbeat after function execution. Set to 'true' if you want to send a follow-up message or run a follow-up function.";

/// Longest a heartbeat pause can run, in minutes.
pub const MAX_PAUSE_HEARTBEATS: i64 = 360;

/// Heartbeat pause state shared between the agent and the
/// pause_heartbeats tool.
pub type PauseState = Arc<Mutex<Option<(DateTime<Utc>, i64)>>>;

/// Capability handle passed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    core: Arc<RwLock<CoreMemory>>,
    recall: RecallMemory,
    archival: ArchivalMemory,
    interface: Arc<dyn AgentInterface>,
    pause: PauseState,
    /// Identity of the assistant message that requested the call;
    /// user-visible sends are stamped with it.
    request_id: Uuid,
    request_date: DateTime<Utc>,
}

impl ToolContext {
    pub fn new(
        core: Arc<RwLock<CoreMemory>>,
        recall: RecallMemory,
        archival: ArchivalMemory,
        interface: Arc<dyn AgentInterface>,
        pause: PauseState,
        request_id: Uuid,
        request_date: DateTime<Utc>,
    ) -> Self {
        Self {
            core,
            recall,
            archival,
            interface,
            pause,
            request_id,
            request_date,
        }
    }

    pub fn edit_core_append(&self, field: &str, content: &str) -> Result<usize> {
        let field = CoreMemoryField::parse(field)?;
        let mut core = self
            .core
            .write()
            .map_err(|_| anyhow!("core memory lock poisoned"))?;
        Ok(core.edit_append(field, content, "\n")?)
    }

    pub fn edit_core_replace(&self, field: &str, old: &str, new: &str) -> Result<usize> {
        let field = CoreMemoryField::parse(field)?;
        let mut core = self
            .core
            .write()
            .map_err(|_| anyhow!("core memory lock poisoned"))?;
        Ok(core.edit_replace(field, old, new)?)
    }

    pub async fn search_recall(
        &self,
        query: &str,
        page: usize,
    ) -> Result<(Vec<Message>, usize)> {
        self.recall
            .text_search(
                query,
                page * RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE,
                RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE,
            )
            .await
    }

    pub async fn search_recall_date(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: usize,
    ) -> Result<(Vec<Message>, usize)> {
        self.recall
            .date_search(
                start,
                end,
                page * RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE,
                RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE,
            )
            .await
    }

    pub async fn insert_archival(&self, content: &str) -> Result<Vec<Uuid>> {
        self.archival.insert(content).await
    }

    pub async fn search_archival(
        &self,
        query: &str,
        page: usize,
    ) -> Result<(Vec<crate::memory::archival::ArchivalSearchResult>, usize)> {
        self.archival
            .search(
                query,
                page * RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE,
                RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE,
            )
            .await
    }

    /// Emit a user-visible message through the interface.
    pub fn send_user_message(&self, text: &str) {
        self.interface
            .assistant_message(text, self.request_id, self.request_date);
    }

    /// Pause timed heartbeats, clamped to the maximum.
    pub fn pause_heartbeats(&self, minutes: i64) -> Result<i64> {
        let minutes = minutes.min(MAX_PAUSE_HEARTBEATS);
        *self
            .pause
            .lock()
            .map_err(|_| anyhow!("pause state lock poisoned"))? = Some((Utc::now(), minutes));
        Ok(minutes)
    }
}

/// Decoded tool arguments, typed against the declared parameter schema.
#[derive(Debug, Clone, Default)]
pub struct ToolArgs {
    map: Map<String, Value>,
}

impl ToolArgs {
    /// Decode a raw argument object against a JSON-schema `parameters`
    /// declaration: required fields must be present, and each declared
    /// field is coerced to its declared primitive type.
    pub fn decode(parameters: &Value, map: Map<String, Value>) -> Result<Self> {
        let properties = parameters["properties"].as_object();
        if let Some(required) = parameters["required"].as_array() {
            for name in required.iter().filter_map(|v| v.as_str()) {
                if name == REQUEST_HEARTBEAT_PARAM {
                    continue;
                }
                if !map.contains_key(name) {
                    bail!("missing required argument '{name}'");
                }
            }
        }

        let mut decoded = Map::new();
        for (name, value) in map {
            let declared = properties
                .and_then(|p| p.get(&name))
                .and_then(|s| s["type"].as_str());
            let coerced = match declared {
                Some("string") => match value {
                    Value::String(s) => Value::String(s),
                    other => bail!("argument '{name}' must be a string (got {other})"),
                },
                Some("integer") => match value {
                    Value::Number(n) if n.is_i64() || n.is_u64() => Value::Number(n),
                    Value::String(s) => Value::Number(
                        s.parse::<i64>()
                            .map_err(|_| anyhow!("argument '{name}' must be an integer (got '{s}')"))?
                            .into(),
                    ),
                    other => bail!("argument '{name}' must be an integer (got {other})"),
                },
                Some("number") => match value {
                    Value::Number(n) => Value::Number(n),
                    other => bail!("argument '{name}' must be a number (got {other})"),
                },
                Some("boolean") => match value {
                    Value::Bool(b) => Value::Bool(b),
                    Value::String(s) => Value::Bool(s == "true"),
                    other => bail!("argument '{name}' must be a boolean (got {other})"),
                },
                // undeclared or structured arguments pass through
                _ => value,
            };
            decoded.insert(name, coerced);
        }
        Ok(Self { map: decoded })
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.map
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing required argument '{name}'"))
    }

    pub fn int_or(&self, name: &str, default: i64) -> i64 {
        self.map.get(name).and_then(|v| v.as_i64()).unwrap_or(default)
    }

    /// The raw decoded map, for echoing arguments into log lines.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema `parameters` object, without `request_heartbeat`
    /// (injected at schema-rendering time).
    fn parameters(&self) -> Value;

    /// Run the tool. `Ok(None)` means "no output" and packages as the
    /// string "None".
    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>>;
}

/// Ordered, append-only per-agent tool registry.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// The built-in memory tool set every preset starts from.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SendMessageTool));
        registry.register(Arc::new(CoreMemoryAppendTool));
        registry.register(Arc::new(CoreMemoryReplaceTool));
        registry.register(Arc::new(ConversationSearchTool));
        registry.register(Arc::new(ConversationSearchDateTool));
        registry.register(Arc::new(ArchivalMemoryInsertTool));
        registry.register(Arc::new(ArchivalMemorySearchTool));
        registry.register(Arc::new(PauseHeartbeatsTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if self.get(tool.name()).is_some() {
            tracing::warn!(name = tool.name(), "tool already registered, skipping");
            return;
        }
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Render the OpenAI `tools` array, with the heartbeat parameter
    /// injected into every schema.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                let mut parameters = tool.parameters();
                parameters["properties"][REQUEST_HEARTBEAT_PARAM] = json!({
                    "type": "boolean",
                    "description": REQUEST_HEARTBEAT_DESCRIPTION,
                });
                if let Some(required) = parameters["required"].as_array_mut() {
                    required.push(json!(REQUEST_HEARTBEAT_PARAM));
                }
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": parameters,
                    }
                })
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Built-in tools
// ============================================================================

fn format_page_header(shown: usize, total: usize, page: usize) -> String {
    let pages = total.div_ceil(RETRIEVAL_QUERY_DEFAULT_PAGE_SIZE).max(1);
    format!("Showing {shown} of {total} results (page {}/{pages}):", page + 1)
}

/// Send a user-visible message through the interface.
pub struct SendMessageTool;

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Sends a message to the human user."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Message contents. All unicode (including emojis) are supported.",
                }
            },
            "required": ["message"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        ctx.send_user_message(args.str("message")?);
        Ok(None)
    }
}

/// Append to a core-memory block.
pub struct CoreMemoryAppendTool;

#[async_trait]
impl Tool for CoreMemoryAppendTool {
    fn name(&self) -> &str {
        "core_memory_append"
    }

    fn description(&self) -> &str {
        "Append to the contents of core memory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Section of the memory to be edited (persona or human).",
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the memory. All unicode (including emojis) are supported.",
                }
            },
            "required": ["name", "content"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        ctx.edit_core_append(args.str("name")?, args.str("content")?)?;
        Ok(None)
    }
}

/// Replace exact text in a core-memory block.
pub struct CoreMemoryReplaceTool;

#[async_trait]
impl Tool for CoreMemoryReplaceTool {
    fn name(&self) -> &str {
        "core_memory_replace"
    }

    fn description(&self) -> &str {
        "Replace the contents of core memory. To delete memories, use an empty string for new_content."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Section of the memory to be edited (persona or human).",
                },
                "old_content": {
                    "type": "string",
                    "description": "String to replace. Must be an exact match.",
                },
                "new_content": {
                    "type": "string",
                    "description": "Content to write to the memory. All unicode (including emojis) are supported.",
                }
            },
            "required": ["name", "old_content", "new_content"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        ctx.edit_core_replace(
            args.str("name")?,
            args.str("old_content")?,
            args.str("new_content")?,
        )?;
        Ok(None)
    }
}

/// Text search over recall memory.
pub struct ConversationSearchTool;

#[async_trait]
impl Tool for ConversationSearchTool {
    fn name(&self) -> &str {
        "conversation_search"
    }

    fn description(&self) -> &str {
        "Search prior conversation history using case-insensitive string matching."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "String to search for.",
                },
                "page": {
                    "type": "integer",
                    "description": "Allows you to page through results. Only use on a follow-up query. Defaults to 0 (first page).",
                }
            },
            "required": ["query"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        let query = args.str("query")?;
        let page = args.int_or("page", 0).max(0) as usize;
        let (results, total) = ctx.search_recall(query, page).await?;
        if results.is_empty() {
            return Ok(Some("No results found.".to_string()));
        }
        let formatted: Vec<String> = results
            .iter()
            .map(|m| {
                format!(
                    "timestamp: {}, {} - {}",
                    format_time(m.created_at),
                    m.role.as_str(),
                    m.text_or_empty()
                )
            })
            .collect();
        Ok(Some(format!(
            "{} {}",
            format_page_header(results.len(), total, page),
            serde_json::to_string(&formatted)?
        )))
    }
}

/// Date-range search over recall memory.
pub struct ConversationSearchDateTool;

fn parse_day(value: &str, name: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| anyhow!("{name} must be formatted YYYY-MM-DD (got '{value}')"))
}

#[async_trait]
impl Tool for ConversationSearchDateTool {
    fn name(&self) -> &str {
        "conversation_search_date"
    }

    fn description(&self) -> &str {
        "Search prior conversation history using a date range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "start_date": {
                    "type": "string",
                    "description": "The start of the date range to search, in the format 'YYYY-MM-DD'.",
                },
                "end_date": {
                    "type": "string",
                    "description": "The end of the date range to search, in the format 'YYYY-MM-DD'.",
                },
                "page": {
                    "type": "integer",
                    "description": "Allows you to page through results. Only use on a follow-up query. Defaults to 0 (first page).",
                }
            },
            "required": ["start_date", "end_date"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        let start_day = parse_day(args.str("start_date")?, "start_date")?;
        let end_day = parse_day(args.str("end_date")?, "end_date")?;
        let page = args.int_or("page", 0).max(0) as usize;

        let start = start_day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("invalid start_date"))?
            .and_utc();
        let end = end_day
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| anyhow!("invalid end_date"))?
            .and_utc();

        let (results, total) = ctx.search_recall_date(start, end, page).await?;
        if results.is_empty() {
            return Ok(Some("No results found.".to_string()));
        }
        let formatted: Vec<String> = results
            .iter()
            .map(|m| {
                format!(
                    "timestamp: {}, {} - {}",
                    format_time(m.created_at),
                    m.role.as_str(),
                    m.text_or_empty()
                )
            })
            .collect();
        Ok(Some(format!(
            "{} {}",
            format_page_header(results.len(), total, page),
            serde_json::to_string(&formatted)?
        )))
    }
}

/// Write a passage into archival memory.
pub struct ArchivalMemoryInsertTool;

#[async_trait]
impl Tool for ArchivalMemoryInsertTool {
    fn name(&self) -> &str {
        "archival_memory_insert"
    }

    fn description(&self) -> &str {
        "Add to archival memory. Make sure to phrase the memory contents such that it can be easily queried later."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Content to write to the memory. All unicode (including emojis) are supported.",
                }
            },
            "required": ["content"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        ctx.insert_archival(args.str("content")?).await?;
        Ok(None)
    }
}

/// Similarity search over archival memory.
pub struct ArchivalMemorySearchTool;

#[async_trait]
impl Tool for ArchivalMemorySearchTool {
    fn name(&self) -> &str {
        "archival_memory_search"
    }

    fn description(&self) -> &str {
        "Search archival memory using semantic (embedding-based) search."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "String to search for.",
                },
                "page": {
                    "type": "integer",
                    "description": "Allows you to page through results. Only use on a follow-up query. Defaults to 0 (first page).",
                }
            },
            "required": ["query"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        let query = args.str("query")?;
        let page = args.int_or("page", 0).max(0) as usize;
        let (results, total) = ctx.search_archival(query, page).await?;
        if results.is_empty() {
            return Ok(Some("No results found.".to_string()));
        }
        let formatted: Vec<String> = results
            .iter()
            .map(|r| format!("timestamp: {}, memory: {}", r.timestamp, r.content))
            .collect();
        Ok(Some(format!(
            "{} {}",
            format_page_header(results.len(), total, page),
            serde_json::to_string(&formatted)?
        )))
    }
}

/// Pause timed heartbeats for a while (manual heartbeats still work).
pub struct PauseHeartbeatsTool;

#[async_trait]
impl Tool for PauseHeartbeatsTool {
    fn name(&self) -> &str {
        "pause_heartbeats"
    }

    fn description(&self) -> &str {
        "Temporarily ignore timed heartbeats. You may still receive messages from manual heartbeats and other events."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "minutes": {
                    "type": "integer",
                    "description": "Number of minutes to ignore heartbeats for. Max value of 360 minutes (6 hours).",
                }
            },
            "required": ["minutes"],
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> Result<Option<String>> {
        let minutes = ctx.pause_heartbeats(args.int_or("minutes", 0))?;
        Ok(Some(format!(
            "Pausing timed heartbeats for {minutes} min"
        )))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::interface::NullInterface;
    use crate::memory::archival::InMemoryArchivalStorage;
    use crate::memory::embedding::testing::DeterministicEmbedder;
    use crate::memory::recall::InMemoryRecallStorage;

    /// A context over fresh in-memory stores for tool tests.
    pub fn test_context() -> ToolContext {
        let agent_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();
        ToolContext::new(
            Arc::new(RwLock::new(CoreMemory::new(
                Some("I am Yarrow.".into()),
                Some("First name: ?".into()),
            ))),
            RecallMemory::new(Arc::new(InMemoryRecallStorage::new())),
            ArchivalMemory::new(
                agent_id,
                owner_id,
                Arc::new(InMemoryArchivalStorage::new()),
                Arc::new(DeterministicEmbedder::new(16)),
                300,
            ),
            Arc::new(NullInterface),
            Arc::new(Mutex::new(None)),
            Uuid::new_v4(),
            Utc::now(),
        )
    }
}
