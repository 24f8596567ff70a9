//! Yarrow Core Library
//!
//! A long-lived conversational agent with a bounded in-context working
//! set and two tiers of overflow memory, mediating between a user, an
//! LLM completion endpoint, and callable tools.

pub mod agent;
pub mod config;
pub mod error;
pub mod interface;
pub mod llm;
pub mod memory;
pub mod message;
pub mod registry;
pub mod server;
pub mod system;
pub mod tokens;
pub mod tools;

// Re-export key types for convenience
pub use agent::{Agent, AgentHandles, Preset, StepInput, StepOptions, StepOutcome};
pub use config::{Config, EmbeddingConfig, LlmConfig};
pub use error::{AgentError, LlmError};
pub use message::{Message, Role, ToolCall};
pub use registry::{AgentRegistry, InMemoryMetadataStore, MetadataStore};
pub use tools::{Tool, ToolContext, ToolRegistry};
