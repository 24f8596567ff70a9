//! The agent step engine.
//!
//! A step is a straight-line state machine: normalize the incoming
//! message, regenerate the system preamble, call the completion endpoint,
//! dispatch the reply (plain turn or tool call), check context pressure,
//! then commit everything produced to the log and the recall store in one
//! batch. Context overflow compacts the log through recursive
//! summarization and retries the step exactly once.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::error::{AgentError, LlmError};
use crate::interface::AgentInterface;
use crate::llm::json_repair::parse_json_lenient;
use crate::llm::types::{ChatCompletionResponse, CompletionRequest, ResponseMessage};
use crate::llm::CompletionTransport;
use crate::memory::archival::{ArchivalMemory, ArchivalStorage};
use crate::memory::core::CoreMemory;
use crate::memory::recall::{RecallMemory, RecallStorage};
use crate::memory::summarize::{
    choose_cutoff, summarize_messages, MESSAGE_SUMMARY_TRUNC_KEEP_N_LAST,
    MESSAGE_SUMMARY_TRUNC_TOKEN_FRAC, MESSAGE_SUMMARY_WARNING_FRAC,
};
use crate::memory::Embedder;
use crate::message::{fresh_tool_call_id, Message, Role, ToolCall};
use crate::system;
use crate::tokens::TokenCounter;
use crate::tools::{
    ToolArgs, ToolContext, ToolRegistry, FUNCTION_RETURN_CHAR_LIMIT, PAGING_TOOLS,
    REQUEST_HEARTBEAT_PARAM,
};

/// Retry bound for the first-turn completion guard.
pub const FIRST_MESSAGE_ATTEMPTS: usize = 10;

/// A preset: the static pieces an agent is created from.
#[derive(Debug, Clone)]
pub struct Preset {
    pub name: String,
    pub system: String,
    pub persona: String,
    pub human: String,
}

impl Preset {
    pub fn default_chat(persona: impl Into<String>, human: impl Into<String>) -> Self {
        Self {
            name: "yarrow_chat".to_string(),
            system: system::DEFAULT_SYSTEM_PROMPT.to_string(),
            persona: persona.into(),
            human: human.into(),
        }
    }
}

/// Injected collaborators (see DESIGN.md: no process-global state).
pub struct AgentHandles {
    pub transport: Arc<dyn CompletionTransport>,
    pub interface: Arc<dyn AgentInterface>,
    pub recall_storage: Arc<dyn RecallStorage>,
    pub archival_storage: Arc<dyn ArchivalStorage>,
    pub embedder: Arc<dyn Embedder>,
}

/// Input to a step: either raw text or a pre-formed user message.
#[derive(Debug, Clone)]
pub enum StepInput {
    Raw(String),
    Message(Box<Message>),
}

#[derive(Debug, Clone)]
pub struct StepOptions {
    pub first_message: bool,
    pub first_message_retry_limit: usize,
    /// Skip the first-turn verification loop entirely.
    pub skip_verify: bool,
    /// Recreate `created_at` at UTC-now on pre-formed input messages.
    pub recreate_message_timestamp: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            first_message: false,
            first_message_retry_limit: FIRST_MESSAGE_ATTEMPTS,
            skip_verify: false,
            recreate_message_timestamp: true,
        }
    }
}

/// What a step hands back to the chaining loop.
#[derive(Debug)]
pub struct StepOutcome {
    /// Everything committed by this step, in commit order.
    pub messages: Vec<Message>,
    pub heartbeat_request: bool,
    pub tool_failed: bool,
    pub memory_warning: bool,
    pub completion_tokens: u32,
}

pub struct Agent {
    id: Uuid,
    owner_id: Uuid,
    preset_name: String,
    llm_config: LlmConfig,
    transport: Arc<dyn CompletionTransport>,
    interface: Arc<dyn AgentInterface>,
    system: String,
    core: Arc<RwLock<CoreMemory>>,
    recall: RecallMemory,
    archival: ArchivalMemory,
    tools: ToolRegistry,
    counter: TokenCounter,
    pause: crate::tools::PauseState,
    /// The in-context log. Position 0 is always the system message.
    messages: Vec<Message>,
    /// All-time message count; monotonically non-decreasing.
    messages_total: usize,
    messages_total_init: usize,
    alerted_memory_pressure: bool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("preset_name", &self.preset_name)
            .field("llm_config", &self.llm_config)
            .field("system", &self.system)
            .field("messages", &self.messages)
            .field("messages_total", &self.messages_total)
            .field("messages_total_init", &self.messages_total_init)
            .field("alerted_memory_pressure", &self.alerted_memory_pressure)
            .finish()
    }
}

impl Agent {
    /// Create a fresh agent from a preset, seeding the boot sequence into
    /// the log and the recall store.
    pub async fn create(
        id: Uuid,
        owner_id: Uuid,
        preset: Preset,
        llm_config: LlmConfig,
        embedding_config: &EmbeddingConfig,
        tools: ToolRegistry,
        handles: AgentHandles,
    ) -> Result<Self, AgentError> {
        let core = Arc::new(RwLock::new(CoreMemory::new(
            Some(preset.persona.clone()),
            Some(preset.human.clone()),
        )));
        let recall = RecallMemory::new(handles.recall_storage);
        let archival = ArchivalMemory::new(
            id,
            owner_id,
            handles.archival_storage,
            handles.embedder,
            embedding_config.embedding_chunk_size,
        );

        let counter = TokenCounter::for_model(&llm_config.model);
        let mut agent = Self {
            id,
            owner_id,
            preset_name: preset.name,
            llm_config,
            transport: handles.transport,
            interface: handles.interface,
            system: preset.system,
            core,
            recall,
            archival,
            tools,
            counter,
            pause: Arc::new(Mutex::new(None)),
            messages: Vec::new(),
            messages_total: 0,
            messages_total_init: 0,
            alerted_memory_pressure: false,
        };

        let init_messages = agent.initial_message_sequence().await?;
        agent.append_to_messages(init_messages).await?;
        agent.messages_total = agent.messages.len() - 1;
        agent.messages_total_init = agent.messages.len() - 1;

        tracing::info!(agent_id = %id, messages_total = agent.messages_total, "agent initialized");
        Ok(agent)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn preset_name(&self) -> &str {
        &self.preset_name
    }

    pub fn messages_total(&self) -> usize {
        self.messages_total
    }

    pub fn in_context_messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn core_memory(&self) -> Arc<RwLock<CoreMemory>> {
        self.core.clone()
    }

    pub fn recall(&self) -> &RecallMemory {
        &self.recall
    }

    /// Swap the event interface (one per request on the HTTP path).
    pub fn set_interface(&mut self, interface: Arc<dyn AgentInterface>) {
        self.interface = interface;
    }

    /// The boot sequence of a fresh agent: system preamble, an assistant
    /// send_message exemplar with its tool return, and the login event.
    async fn initial_message_sequence(&self) -> Result<Vec<Message>, AgentError> {
        let preamble = self.render_system_preamble().await?;
        let system_message = Message::system(self.id, self.owner_id, preamble)
            .with_model(self.llm_config.model.clone());

        let tool_call_id = fresh_tool_call_id();
        let boot_arguments = serde_json::json!({
            "message": system::INITIAL_BOOT_MESSAGE_SEND_MESSAGE_FIRST_MSG,
        })
        .to_string();
        let boot_assistant = Message::assistant(
            self.id,
            self.owner_id,
            system::INITIAL_BOOT_MESSAGE_SEND_MESSAGE_THOUGHT,
        )
        .with_tool_calls(vec![ToolCall::new(
            tool_call_id.clone(),
            "send_message",
            boot_arguments,
        )])
        .with_model(self.llm_config.model.clone());

        let boot_return = Message::tool(
            self.id,
            self.owner_id,
            "send_message",
            system::package_function_response(true, "None"),
            tool_call_id,
        )
        .with_model(self.llm_config.model.clone());

        let login = Message::user(self.id, self.owner_id, system::get_login_event())
            .with_model(self.llm_config.model.clone());

        Ok(vec![system_message, boot_assistant, boot_return, login])
    }

    async fn render_system_preamble(&self) -> Result<String, AgentError> {
        let recall_count = self.recall.size().await?;
        let archival_count = self.archival.size().await?;
        let core = self
            .core
            .read()
            .map_err(|_| AgentError::Internal("core memory lock poisoned".into()))?;
        Ok(system::construct_system_preamble(
            &self.system,
            &core,
            recall_count,
            archival_count,
        ))
    }

    /// Regenerate the position-0 system message from the template; it is
    /// derived state, not a persisted message.
    async fn rebuild_system_message(&mut self) -> Result<(), AgentError> {
        let preamble = self.render_system_preamble().await?;
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.text = Some(preamble);
                Ok(())
            }
            _ => Err(AgentError::Internal(
                "message log does not start with a system message".into(),
            )),
        }
    }

    /// Append a batch to the in-context log, writing through to recall.
    /// The batch commits as a unit.
    async fn append_to_messages(&mut self, added: Vec<Message>) -> Result<(), AgentError> {
        self.recall.insert_many(added.clone()).await?;
        self.messages_total += added.len();
        self.messages.extend(added);
        Ok(())
    }

    /// Normalize incoming input into a user message: raw strings that
    /// look like JSON are validated, and a top-level `name` field is
    /// lifted onto the message before the body is re-serialized.
    fn normalize_input(
        &self,
        input: StepInput,
        recreate_timestamp: bool,
    ) -> Result<Message, AgentError> {
        fn strip_name_field(text: &str) -> (String, Option<String>) {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(mut map)) => {
                    let name = map
                        .remove("name")
                        .and_then(|v| v.as_str().map(|s| s.to_string()));
                    (Value::Object(map).to_string(), name)
                }
                _ => {
                    tracing::warn!("couldn't parse user input message as JSON");
                    (text.to_string(), None)
                }
            }
        }

        let message = match input {
            StepInput::Raw(text) => {
                if text.is_empty() {
                    return Err(AgentError::InvalidInput(text));
                }
                let (clean_text, name) = strip_name_field(&text);
                Message::user(self.id, self.owner_id, clean_text)
                    .with_name(name)
                    .with_model(self.llm_config.model.clone())
            }
            StepInput::Message(boxed) => {
                let mut message = *boxed;
                if message.text_or_empty().is_empty() {
                    return Err(AgentError::InvalidInput(String::new()));
                }
                let (clean_text, name) = strip_name_field(message.text_or_empty());
                message.text = Some(clean_text);
                if name.is_some() {
                    message.name = name;
                }
                if recreate_timestamp {
                    message.created_at = Utc::now();
                }
                message
            }
        };
        Ok(message)
    }

    /// Call the completion endpoint over a message sequence and enforce
    /// the finish-reason contract.
    async fn get_ai_reply(
        &self,
        message_sequence: &[Message],
        first_message: bool,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let request = CompletionRequest::new(
            self.llm_config.model.clone(),
            message_sequence
                .iter()
                .map(Message::to_request_value)
                .collect(),
        )
        .with_tools(self.tools.schemas())
        .with_first_message(first_message);

        let response = self.transport.create(&request).await?;
        let choice = response.choices.first().ok_or(LlmError::EmptyResponse)?;

        if choice.finish_reason == "length" {
            return Err(LlmError::ContextOverflow(
                "finish reason was length (maximum context length)".into(),
            ));
        }
        if !matches!(
            choice.finish_reason.as_str(),
            "stop" | "function_call" | "tool_calls"
        ) {
            return Err(LlmError::BadFinishReason(choice.finish_reason.clone()));
        }
        Ok(response)
    }

    /// Coerce a tool return to a string and truncate it unless the tool
    /// pages its own output.
    fn validate_function_response(tool_name: &str, response: Option<String>) -> String {
        let mut text = response.unwrap_or_else(|| "None".to_string());
        let truncate = !PAGING_TOOLS.contains(&tool_name);
        if truncate && text.len() > FUNCTION_RETURN_CHAR_LIMIT {
            let total = text.len();
            let mut end = FUNCTION_RETURN_CHAR_LIMIT;
            while !text.is_char_boundary(end) && end > 0 {
                end -= 1;
            }
            text.truncate(end);
            text.push_str(&format!(
                "... [NOTE: function output was truncated since it exceeded the character limit ({total} > {FUNCTION_RETURN_CHAR_LIMIT})]"
            ));
            tracing::warn!(tool = tool_name, total, "function return was over limit and was truncated");
        }
        text
    }

    /// Handle one completion reply: either a plain assistant turn or a
    /// single tool call run through the dispatch pipeline. Returns the
    /// produced messages plus `(heartbeat_request, tool_failed)`.
    async fn handle_ai_response(
        &self,
        mut response_message: ResponseMessage,
    ) -> (Vec<Message>, bool, bool) {
        let mut messages: Vec<Message> = Vec::new();

        // Legacy function_call replies are normalized into tool_calls.
        if let Some(function_call) = response_message.function_call.take() {
            response_message.tool_calls = Some(vec![ToolCall::new(
                fresh_tool_call_id(),
                function_call.name,
                function_call.arguments,
            )]);
        }

        let has_tool_call = response_message
            .tool_calls
            .as_ref()
            .is_some_and(|calls| !calls.is_empty());

        if !has_tool_call {
            // Standard non-function reply.
            let content = response_message.content.clone().unwrap_or_default();
            let assistant = Message::assistant(self.id, self.owner_id, content.clone())
                .with_model(self.llm_config.model.clone());
            self.interface.internal_monologue(&content, &assistant);
            messages.push(assistant);
            return (messages, false, false);
        }

        let mut tool_calls = response_message.tool_calls.take().unwrap_or_default();
        if tool_calls.len() > 1 {
            tracing::warn!(
                dropped = tool_calls.len() - 1,
                ">1 tool call not supported, using index=0 only"
            );
            tool_calls.truncate(1);
        }

        // Legacy replies and some providers supply no id; mint a bounded
        // one when needed.
        let mut tool_call = tool_calls.remove(0);
        let tool_call_id = if tool_call.id.is_empty() {
            fresh_tool_call_id()
        } else {
            tool_call.id.clone()
        };
        tool_call.id = tool_call_id.clone();

        let tool_name = tool_call.function.name.clone();
        let raw_arguments = tool_call.function.arguments.clone();
        let monologue = response_message.content.clone().unwrap_or_default();

        let assistant = Message::assistant(self.id, self.owner_id, monologue.clone())
            .with_tool_calls(vec![tool_call])
            .with_model(self.llm_config.model.clone());
        self.interface.internal_monologue(&monologue, &assistant);
        tracing::debug!(tool = %tool_name, %tool_call_id, "request to call function");

        let push_tool_error = |messages: &mut Vec<Message>, error_msg: String| {
            let packaged = system::package_function_response(false, &error_msg);
            let tool_message = Message::tool(
                self.id,
                self.owner_id,
                tool_name.clone(),
                packaged,
                tool_call_id.clone(),
            )
            .with_model(self.llm_config.model.clone());
            self.interface
                .function_message(&format!("Error: {error_msg}"), &tool_message);
            messages.push(tool_message);
        };

        // Failure case 1: unknown tool name.
        let Some(tool) = self.tools.get(&tool_name) else {
            messages.push(assistant);
            let error_msg = format!("No function named {tool_name}");
            push_tool_error(&mut messages, error_msg);
            return (messages, false, true);
        };
        let tool = tool.clone();

        // Failure case 2: arguments are bad JSON beyond repair.
        let parsed_args = match parse_json_lenient(&raw_arguments) {
            Ok(Value::Object(map)) => map,
            _ => {
                messages.push(assistant);
                let error_msg = format!(
                    "Error parsing JSON for function '{tool_name}' arguments: {raw_arguments}"
                );
                push_tool_error(&mut messages, error_msg);
                return (messages, false, true);
            }
        };

        // Pop the heartbeat flag; anything non-bool coerces to false.
        let mut args_map = parsed_args;
        let heartbeat_request = match args_map.remove(REQUEST_HEARTBEAT_PARAM) {
            Some(Value::Bool(b)) => b,
            Some(other) => {
                tracing::warn!(
                    value = %other,
                    "'request_heartbeat' arg was not a bool, coercing to false"
                );
                false
            }
            None => false,
        };

        let args_echo = Value::Object(args_map.clone()).to_string();
        self.interface
            .function_message(&format!("Running {tool_name}({args_echo})"), &assistant);

        let context = ToolContext::new(
            self.core.clone(),
            self.recall.clone(),
            self.archival.clone(),
            self.interface.clone(),
            self.pause.clone(),
            assistant.id,
            assistant.created_at,
        );
        messages.push(assistant);

        // Failure case 3: argument typing or execution failed.
        let invoke_result = match ToolArgs::decode(&tool.parameters(), args_map) {
            Ok(decoded) => tool.invoke(&context, decoded).await,
            Err(e) => Err(e),
        };

        match invoke_result {
            Ok(returned) => {
                let response_string = Self::validate_function_response(&tool_name, returned);
                let packaged = system::package_function_response(true, &response_string);
                let tool_message = Message::tool(
                    self.id,
                    self.owner_id,
                    tool_name.clone(),
                    packaged,
                    tool_call_id.clone(),
                )
                .with_model(self.llm_config.model.clone());
                self.interface
                    .function_message(&format!("Ran {tool_name}({args_echo})"), &tool_message);
                self.interface
                    .function_message(&format!("Success: {response_string}"), &tool_message);
                messages.push(tool_message);
                (messages, heartbeat_request, false)
            }
            Err(e) => {
                let error_msg = format!("Error calling function {tool_name}: {e:#}");
                tracing::warn!(tool = %tool_name, "{error_msg}");
                push_tool_error(&mut messages, error_msg);
                (messages, false, true)
            }
        }
    }

    /// One pass of the step state machine, without overflow recovery.
    async fn step_once(
        &mut self,
        input: StepInput,
        options: &StepOptions,
    ) -> Result<StepOutcome, AgentError> {
        let user_message = self.normalize_input(input, options.recreate_message_timestamp)?;
        self.rebuild_system_message().await?;
        self.interface
            .user_message(user_message.text_or_empty(), &user_message);

        // Tentative append: the input sequence sees the new message, but
        // nothing is committed until the step succeeds.
        let mut sequence: Vec<Message> = self.messages.clone();
        sequence.push(user_message.clone());
        if sequence.len() > 1 && sequence[sequence.len() - 1].role != Role::User {
            tracing::warn!("running completion without user as the last message in the queue");
        }

        let first_turn = options.first_message
            || self.messages_total == self.messages_total_init;

        let response = if !options.skip_verify && first_turn {
            // The prompt formatter uses a different preamble on turn 1,
            // which some backends reject intermittently; retry within the
            // bound before giving up.
            let mut counter = 0;
            loop {
                match self.get_ai_reply(&sequence, true).await {
                    Ok(response) => break response,
                    Err(e) => {
                        counter += 1;
                        if counter > options.first_message_retry_limit {
                            return Err(AgentError::FirstMessageRetryLimit(
                                options.first_message_retry_limit,
                            ));
                        }
                        tracing::warn!(
                            attempt = counter,
                            "first-message completion failed, retrying: {e}"
                        );
                    }
                }
            }
        } else {
            self.get_ai_reply(&sequence, false).await?
        };

        let choice = response
            .choices
            .first()
            .ok_or(AgentError::Llm(LlmError::EmptyResponse))?;
        let (response_messages, heartbeat_request, tool_failed) =
            self.handle_ai_response(choice.message.clone()).await;

        // Context-pressure check against the usage the provider reported.
        let current_total_tokens = response.usage.total_tokens;
        let warning_threshold =
            MESSAGE_SUMMARY_WARNING_FRAC * self.llm_config.context_window as f32;
        let mut memory_warning = false;
        if current_total_tokens as f32 > warning_threshold {
            tracing::warn!(
                total_tokens = current_total_tokens,
                threshold = warning_threshold as usize,
                "memory pressure"
            );
            if !self.alerted_memory_pressure {
                memory_warning = true;
                self.alerted_memory_pressure = true;
            }
        }

        // Commit: the user message and everything the reply produced land
        // together.
        let mut all_new_messages = vec![user_message];
        all_new_messages.extend(response_messages);
        self.append_to_messages(all_new_messages.clone()).await?;

        Ok(StepOutcome {
            messages: all_new_messages,
            heartbeat_request,
            tool_failed,
            memory_warning,
            completion_tokens: response.usage.completion_tokens,
        })
    }

    /// Top-level step: on context overflow, compact once and retry once;
    /// a second overflow is fatal.
    pub async fn step(
        &mut self,
        input: StepInput,
        options: &StepOptions,
    ) -> Result<StepOutcome, AgentError> {
        match self.step_once(input.clone(), options).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_context_overflow() => {
                tracing::warn!("step hit context overflow, summarizing and retrying");
                self.summarize_messages_inplace().await?;
                match self.step_once(input, options).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e2) if e2.is_context_overflow() => {
                        Err(AgentError::OverflowAfterCompaction)
                    }
                    Err(e2) => Err(e2),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Compact the in-context log: summarize a prefix, trim, and prepend
    /// the synthetic summary message at position 1.
    pub async fn summarize_messages_inplace(&mut self) -> Result<(), AgentError> {
        if self.messages.first().map(|m| m.role) != Some(Role::System) {
            return Err(AgentError::Internal(
                "message log does not start with a system message".into(),
            ));
        }

        let roles: Vec<Role> = self.messages.iter().map(|m| m.role).collect();
        let token_counts: Vec<usize> = self
            .messages
            .iter()
            .map(|m| self.counter.count(&m.to_request_value().to_string()))
            .collect();

        let cutoff = choose_cutoff(
            &roles,
            &token_counts,
            MESSAGE_SUMMARY_TRUNC_KEEP_N_LAST,
            MESSAGE_SUMMARY_TRUNC_TOKEN_FRAC,
        )?;

        let to_summarize = &self.messages[1..cutoff];
        tracing::info!(
            count = to_summarize.len(),
            of = self.messages.len(),
            "attempting to summarize messages"
        );
        let summary =
            summarize_messages(self.transport.as_ref(), &self.llm_config, to_summarize).await?;

        let all_time_count = self.messages_total;
        let remaining_count = self.messages.len() - cutoff;
        let hidden_count = all_time_count.saturating_sub(remaining_count);
        let packaged =
            system::package_summarize_message(&summary, to_summarize.len(), hidden_count, all_time_count);

        let summary_message = Message::user(self.id, self.owner_id, packaged)
            .with_model(self.llm_config.model.clone());

        let prior_len = self.messages.len();
        let mut trimmed = Vec::with_capacity(self.messages.len() - cutoff + 2);
        trimmed.push(self.messages[0].clone());
        trimmed.push(summary_message.clone());
        trimmed.extend_from_slice(&self.messages[cutoff..]);
        self.messages = trimmed;

        // The summary is a real message: mirror it to recall and count it.
        self.recall.insert(summary_message).await?;
        self.messages_total += 1;

        self.alerted_memory_pressure = false;
        tracing::info!(
            prior_len,
            new_len = self.messages.len(),
            "ran summarizer, trimmed context"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Frame, StreamingInterface};
    use crate::llm::testing::{assistant_reply, tool_call_reply, ScriptedTransport};
    use crate::memory::archival::InMemoryArchivalStorage;
    use crate::memory::embedding::testing::DeterministicEmbedder;
    use crate::memory::recall::InMemoryRecallStorage;
    use crate::interface::NullInterface;

    const WINDOW: usize = 8192;

    async fn test_agent(
        replies: Vec<Result<ChatCompletionResponse, LlmError>>,
    ) -> (Agent, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(replies));
        let llm_config = LlmConfig::new("gpt-4", "http://localhost/v1")
            .with_context_window(WINDOW);
        let embedding_config =
            EmbeddingConfig::new("http://localhost/v1", "test-embed", 16);
        let agent = Agent::create(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Preset::default_chat("I am Yarrow.", "First name: ?"),
            llm_config,
            &embedding_config,
            ToolRegistry::with_builtin_tools(),
            AgentHandles {
                transport: transport.clone(),
                interface: Arc::new(NullInterface),
                recall_storage: Arc::new(InMemoryRecallStorage::new()),
                archival_storage: Arc::new(InMemoryArchivalStorage::new()),
                embedder: Arc::new(DeterministicEmbedder::new(16)),
            },
        )
        .await
        .unwrap();
        (agent, transport)
    }

    fn user_turn(text: &str) -> StepInput {
        StepInput::Raw(system::package_user_message(text, None))
    }

    fn chat_options() -> StepOptions {
        StepOptions {
            skip_verify: true,
            ..StepOptions::default()
        }
    }

    #[tokio::test]
    async fn boot_sequence_shape() {
        let (agent, _) = test_agent(vec![]).await;
        let log = agent.in_context_messages();
        assert_eq!(log[0].role, Role::System);
        assert_eq!(log[1].role, Role::Assistant);
        assert_eq!(log[2].role, Role::Tool);
        assert_eq!(log[3].role, Role::User);
        // tool return references the boot assistant's call
        let boot_call_id = &log[1].tool_calls.as_ref().unwrap()[0].id;
        assert_eq!(log[2].tool_call_id.as_ref().unwrap(), boot_call_id);
        assert_eq!(agent.messages_total(), 3);
        assert_eq!(agent.recall().size().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn plain_turn() {
        let (mut agent, _) = test_agent(vec![Ok(assistant_reply("Hello to you too", 100))]).await;
        let outcome = agent
            .step(user_turn("Hello"), &chat_options())
            .await
            .unwrap();

        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[0].role, Role::User);
        assert_eq!(outcome.messages[1].role, Role::Assistant);
        assert!(!outcome.tool_failed);
        assert!(!outcome.heartbeat_request);
        assert!(!outcome.memory_warning);
        assert_eq!(outcome.completion_tokens, 10);
    }

    #[tokio::test]
    async fn unknown_tool_forces_heartbeat() {
        let (mut agent, _) = test_agent(vec![Ok(tool_call_reply("nope", "{}", 100))]).await;
        let outcome = agent
            .step(user_turn("do something"), &chat_options())
            .await
            .unwrap();

        assert!(outcome.tool_failed);
        // user + assistant request + tool error
        assert_eq!(outcome.messages.len(), 3);
        let tool_msg = &outcome.messages[2];
        assert_eq!(tool_msg.role, Role::Tool);
        let packaged: Value = serde_json::from_str(tool_msg.text_or_empty()).unwrap();
        assert_eq!(packaged["status"], "Failed");
        assert_eq!(packaged["message"], "No function named nope");
        // linkage invariant holds even on the failure path
        let assistant = &outcome.messages[1];
        assert_eq!(
            tool_msg.tool_call_id.as_ref().unwrap(),
            &assistant.tool_calls.as_ref().unwrap()[0].id
        );
    }

    #[tokio::test]
    async fn unknown_tool_error_is_stable() {
        let (mut agent, _) = test_agent(vec![
            Ok(tool_call_reply("nope", "{}", 100)),
            Ok(tool_call_reply("nope", "{}", 100)),
        ])
        .await;
        let first = agent.step(user_turn("x"), &chat_options()).await.unwrap();
        let second = agent.step(user_turn("x"), &chat_options()).await.unwrap();

        let payload = |outcome: &StepOutcome| -> Value {
            let mut value: Value =
                serde_json::from_str(outcome.messages[2].text_or_empty()).unwrap();
            value.as_object_mut().unwrap().remove("time");
            value
        };
        assert_eq!(payload(&first), payload(&second));
    }

    #[tokio::test]
    async fn bad_json_arguments_fail_after_repair() {
        let (mut agent, _) = test_agent(vec![Ok(tool_call_reply(
            "send_message",
            "{\"message\": \"hi",
            100,
        ))])
        .await;
        let outcome = agent
            .step(user_turn("speak"), &chat_options())
            .await
            .unwrap();

        assert!(outcome.tool_failed);
        let packaged: Value =
            serde_json::from_str(outcome.messages[2].text_or_empty()).unwrap();
        assert_eq!(packaged["status"], "Failed");
        assert!(packaged["message"]
            .as_str()
            .unwrap()
            .starts_with("Error parsing JSON for function 'send_message' arguments"));
    }

    #[tokio::test]
    async fn heartbeat_request_round_trip() {
        let (mut agent, _) = test_agent(vec![Ok(tool_call_reply(
            "send_message",
            r#"{"message": "hi there", "request_heartbeat": true}"#,
            100,
        ))])
        .await;
        let (interface, mut rx) = StreamingInterface::new();
        agent.set_interface(Arc::new(interface));

        let outcome = agent
            .step(user_turn("talk to me"), &chat_options())
            .await
            .unwrap();

        assert!(outcome.heartbeat_request);
        assert!(!outcome.tool_failed);
        let packaged: Value =
            serde_json::from_str(outcome.messages[2].text_or_empty()).unwrap();
        assert_eq!(packaged["status"], "OK");

        // the echoed Running frame carries the arguments, minus the
        // heartbeat flag and with no capability handle anywhere
        let mut running_line = None;
        let mut saw_assistant_frame = false;
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Data(v) = frame {
                if let Some(call) = v["function_call"].as_str() {
                    if call.starts_with("send_message(") {
                        running_line = Some(call.to_string());
                    }
                }
                if v["assistant_message"].as_str() == Some("hi there") {
                    saw_assistant_frame = true;
                }
            }
        }
        let running_line = running_line.expect("no Running frame emitted");
        assert!(running_line.contains("hi there"));
        assert!(!running_line.contains("request_heartbeat"));
        assert!(!running_line.contains("self"));
        assert!(saw_assistant_frame);
    }

    #[tokio::test]
    async fn non_bool_heartbeat_coerces_to_false() {
        let (mut agent, _) = test_agent(vec![Ok(tool_call_reply(
            "send_message",
            r#"{"message": "hi", "request_heartbeat": "yes please"}"#,
            100,
        ))])
        .await;
        let outcome = agent
            .step(user_turn("talk"), &chat_options())
            .await
            .unwrap();
        assert!(!outcome.heartbeat_request);
        assert!(!outcome.tool_failed);
    }

    #[tokio::test]
    async fn tool_execution_failure_forces_heartbeat() {
        // exact-match replace over content that is not present
        let (mut agent, _) = test_agent(vec![Ok(tool_call_reply(
            "core_memory_replace",
            r#"{"name": "human", "old_content": "nonexistent", "new_content": "x"}"#,
            100,
        ))])
        .await;
        let outcome = agent
            .step(user_turn("update memory"), &chat_options())
            .await
            .unwrap();

        assert!(outcome.tool_failed);
        let packaged: Value =
            serde_json::from_str(outcome.messages[2].text_or_empty()).unwrap();
        assert_eq!(packaged["status"], "Failed");
        assert!(packaged["message"]
            .as_str()
            .unwrap()
            .starts_with("Error calling function core_memory_replace"));
    }

    #[tokio::test]
    async fn memory_warning_latches_until_compaction() {
        let heavy = (WINDOW as f32 * 0.8) as u32;
        let (mut agent, _) = test_agent(vec![
            Ok(assistant_reply("one", heavy)),
            Ok(assistant_reply("two", heavy)),
        ])
        .await;

        let first = agent.step(user_turn("a"), &chat_options()).await.unwrap();
        assert!(first.memory_warning);

        // latched: same pressure, no second warning
        let second = agent.step(user_turn("b"), &chat_options()).await.unwrap();
        assert!(!second.memory_warning);
    }

    #[tokio::test]
    async fn compaction_trims_and_prepends_summary() {
        let mut replies: Vec<Result<ChatCompletionResponse, LlmError>> = Vec::new();
        for i in 0..8 {
            replies.push(Ok(assistant_reply(&format!("reply {i}"), 100)));
        }
        replies.push(Ok(assistant_reply("the conversation so far", 10)));
        let (mut agent, _) = test_agent(replies).await;

        for i in 0..8 {
            agent
                .step(user_turn(&format!("message {i}")), &chat_options())
                .await
                .unwrap();
        }

        let persona_before = agent.core_memory().read().unwrap().persona().to_string();
        let len_before = agent.in_context_messages().len();
        let recall_before = agent.recall().size().await.unwrap();
        let total_before = agent.messages_total();

        agent.summarize_messages_inplace().await.unwrap();

        let log = agent.in_context_messages();
        // log strictly shrinks, recall strictly grows, core memory intact
        assert!(log.len() < len_before);
        assert!(agent.recall().size().await.unwrap() > recall_before);
        assert_eq!(agent.core_memory().read().unwrap().persona(), persona_before);
        assert!(agent.messages_total() > total_before);

        // shape: [system, summary(user), tail with the last 3 preserved]
        assert_eq!(log[0].role, Role::System);
        assert_eq!(log[1].role, Role::User);
        let packaged: Value = serde_json::from_str(log[1].text_or_empty()).unwrap();
        assert_eq!(packaged["type"], "system_alert");
        assert!(packaged["message"]
            .as_str()
            .unwrap()
            .contains("the conversation so far"));
        assert!(log.len() >= 2 + MESSAGE_SUMMARY_TRUNC_KEEP_N_LAST);
        assert_ne!(log[2].role, Role::Tool);
    }

    #[tokio::test]
    async fn compaction_with_tiny_log_is_an_error() {
        let (mut agent, _) = test_agent(vec![]).await;
        let err = agent.summarize_messages_inplace().await.unwrap_err();
        assert!(matches!(err, AgentError::NotEnoughToSummarize { .. }));
    }

    #[tokio::test]
    async fn overflow_compacts_and_retries_once() {
        let mut replies: Vec<Result<ChatCompletionResponse, LlmError>> = Vec::new();
        for i in 0..6 {
            replies.push(Ok(assistant_reply(&format!("reply {i}"), 100)));
        }
        replies.push(Err(LlmError::ContextOverflow("too big".into())));
        replies.push(Ok(assistant_reply("summary of it all", 10)));
        replies.push(Ok(assistant_reply("made it", 100)));
        let (mut agent, transport) = test_agent(replies).await;

        for i in 0..6 {
            agent
                .step(user_turn(&format!("filler {i}")), &chat_options())
                .await
                .unwrap();
        }

        let outcome = agent
            .step(user_turn("one more"), &chat_options())
            .await
            .unwrap();
        assert_eq!(outcome.messages[1].text_or_empty(), "made it");
        // overflow + summarizer + retry
        assert_eq!(transport.call_count(), 6 + 3);
        // summary message sits at position 1
        let log = agent.in_context_messages();
        assert_eq!(log[1].role, Role::User);
        assert!(log[1].text_or_empty().contains("summary of it all"));
    }

    #[tokio::test]
    async fn second_overflow_is_fatal() {
        let mut replies: Vec<Result<ChatCompletionResponse, LlmError>> = Vec::new();
        for i in 0..6 {
            replies.push(Ok(assistant_reply(&format!("reply {i}"), 100)));
        }
        replies.push(Err(LlmError::ContextOverflow("too big".into())));
        replies.push(Ok(assistant_reply("summary", 10)));
        replies.push(Err(LlmError::ContextOverflow("still too big".into())));
        let (mut agent, _) = test_agent(replies).await;

        for i in 0..6 {
            agent
                .step(user_turn(&format!("filler {i}")), &chat_options())
                .await
                .unwrap();
        }
        let err = agent
            .step(user_turn("one more"), &chat_options())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::OverflowAfterCompaction));
    }

    #[tokio::test]
    async fn first_message_retries_until_success() {
        let (mut agent, transport) = test_agent(vec![
            Err(LlmError::Api { status: 500, body: "flaky".into() }),
            Err(LlmError::Api { status: 500, body: "flaky again".into() }),
            Ok(assistant_reply("welcome!", 100)),
        ])
        .await;

        let options = StepOptions {
            first_message: true,
            ..StepOptions::default()
        };
        let outcome = agent.step(user_turn("hi"), &options).await.unwrap();
        assert_eq!(outcome.messages[1].text_or_empty(), "welcome!");
        assert_eq!(transport.call_count(), 3);
        // the hint was passed through on every attempt
        assert!(transport.calls.lock().unwrap().iter().all(|r| r.first_message));
    }

    #[tokio::test]
    async fn first_message_retry_limit_propagates() {
        let replies = (0..4)
            .map(|_| Err(LlmError::Api { status: 500, body: "down".into() }))
            .collect();
        let (mut agent, transport) = test_agent(replies).await;

        let options = StepOptions {
            first_message: true,
            first_message_retry_limit: 3,
            ..StepOptions::default()
        };
        let err = agent.step(user_turn("hi"), &options).await.unwrap_err();
        assert!(matches!(err, AgentError::FirstMessageRetryLimit(3)));
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn name_field_is_lifted_from_json_input() {
        let (mut agent, _) = test_agent(vec![Ok(assistant_reply("ok", 100))]).await;
        let raw = r#"{"type": "user_message", "message": "hi", "name": "chad"}"#;
        let outcome = agent
            .step(StepInput::Raw(raw.into()), &chat_options())
            .await
            .unwrap();

        let user = &outcome.messages[0];
        assert_eq!(user.name.as_deref(), Some("chad"));
        let body: Value = serde_json::from_str(user.text_or_empty()).unwrap();
        assert!(body.get("name").is_none());
        assert_eq!(body["message"], "hi");
    }

    #[tokio::test]
    async fn empty_input_is_rejected_before_mutation() {
        let (mut agent, _) = test_agent(vec![]).await;
        let total_before = agent.messages_total();
        let err = agent
            .step(StepInput::Raw(String::new()), &chat_options())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
        assert_eq!(agent.messages_total(), total_before);
    }

    #[tokio::test]
    async fn failed_step_commits_nothing() {
        let (mut agent, _) = test_agent(vec![Err(LlmError::Api {
            status: 500,
            body: "kaboom".into(),
        })])
        .await;
        let len_before = agent.in_context_messages().len();
        let recall_before = agent.recall().size().await.unwrap();

        let err = agent.step(user_turn("hello?"), &chat_options()).await;
        assert!(err.is_err());
        assert_eq!(agent.in_context_messages().len(), len_before);
        assert_eq!(agent.recall().size().await.unwrap(), recall_before);
    }

    #[tokio::test]
    async fn messages_total_is_monotonic() {
        let (mut agent, _) = test_agent(vec![
            Ok(assistant_reply("one", 100)),
            Ok(tool_call_reply("nope", "{}", 100)),
        ])
        .await;
        let t0 = agent.messages_total();
        agent.step(user_turn("a"), &chat_options()).await.unwrap();
        let t1 = agent.messages_total();
        agent.step(user_turn("b"), &chat_options()).await.unwrap();
        let t2 = agent.messages_total();
        assert!(t0 < t1 && t1 < t2);
    }
}
