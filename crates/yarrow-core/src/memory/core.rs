//! Core memory: two bounded text blocks always present in the prompt.
//!
//! Mutated only through the edit operations below, each of which enforces
//! the character limits before committing. Edits are surfaced to the
//! model as tool errors when they violate a limit.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub const CORE_MEMORY_PERSONA_CHAR_LIMIT: usize = 2000;
pub const CORE_MEMORY_HUMAN_CHAR_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMemoryField {
    Persona,
    Human,
}

impl CoreMemoryField {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreMemoryField::Persona => "persona",
            CoreMemoryField::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreMemoryError> {
        match s {
            "persona" => Ok(CoreMemoryField::Persona),
            "human" => Ok(CoreMemoryField::Human),
            other => Err(CoreMemoryError::UnknownField(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreMemoryError {
    #[error(
        "Edit failed: Exceeds {limit} character limit (requested {requested}). \
         Consider summarizing existing core memories in '{field}' and/or moving lower priority \
         content to archival memory to free up space in core memory, then trying again."
    )]
    LimitExceeded {
        field: &'static str,
        limit: usize,
        requested: usize,
    },

    #[error("No memory section named {0} (must be either \"persona\" or \"human\")")]
    UnknownField(String),

    #[error("old_content cannot be an empty string (must specify old_content to replace)")]
    EmptyOldContent,

    #[error("Content not found in {0} (make sure to use exact string)")]
    ContentNotFound(&'static str),
}

#[derive(Debug, Clone)]
pub struct CoreMemory {
    persona: String,
    human: String,
    persona_char_limit: usize,
    human_char_limit: usize,
    last_modified: DateTime<Utc>,
}

impl CoreMemory {
    pub fn new(persona: Option<String>, human: Option<String>) -> Self {
        Self {
            persona: persona.unwrap_or_default(),
            human: human.unwrap_or_default(),
            persona_char_limit: CORE_MEMORY_PERSONA_CHAR_LIMIT,
            human_char_limit: CORE_MEMORY_HUMAN_CHAR_LIMIT,
            last_modified: Utc::now(),
        }
    }

    pub fn with_limits(mut self, persona_char_limit: usize, human_char_limit: usize) -> Self {
        self.persona_char_limit = persona_char_limit;
        self.human_char_limit = human_char_limit;
        self
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn human(&self) -> &str {
        &self.human
    }

    pub fn persona_char_limit(&self) -> usize {
        self.persona_char_limit
    }

    pub fn human_char_limit(&self) -> usize {
        self.human_char_limit
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    fn limit_for(&self, field: CoreMemoryField) -> usize {
        match field {
            CoreMemoryField::Persona => self.persona_char_limit,
            CoreMemoryField::Human => self.human_char_limit,
        }
    }

    fn content_of(&self, field: CoreMemoryField) -> &str {
        match field {
            CoreMemoryField::Persona => &self.persona,
            CoreMemoryField::Human => &self.human,
        }
    }

    /// Overwrite a field. Returns the new length.
    pub fn edit(
        &mut self,
        field: CoreMemoryField,
        content: impl Into<String>,
    ) -> Result<usize, CoreMemoryError> {
        let content = content.into();
        let limit = self.limit_for(field);
        if content.len() > limit {
            return Err(CoreMemoryError::LimitExceeded {
                field: field.as_str(),
                limit,
                requested: content.len(),
            });
        }
        let len = content.len();
        match field {
            CoreMemoryField::Persona => self.persona = content,
            CoreMemoryField::Human => self.human = content,
        }
        self.last_modified = Utc::now();
        Ok(len)
    }

    /// Append with a separator. Returns the new length.
    pub fn edit_append(
        &mut self,
        field: CoreMemoryField,
        content: &str,
        sep: &str,
    ) -> Result<usize, CoreMemoryError> {
        let new_content = format!("{}{sep}{content}", self.content_of(field));
        self.edit(field, new_content)
    }

    /// Replace an exact substring. Fails when `old_content` is empty or
    /// not present.
    pub fn edit_replace(
        &mut self,
        field: CoreMemoryField,
        old_content: &str,
        new_content: &str,
    ) -> Result<usize, CoreMemoryError> {
        if old_content.is_empty() {
            return Err(CoreMemoryError::EmptyOldContent);
        }
        let current = self.content_of(field);
        if !current.contains(old_content) {
            return Err(CoreMemoryError::ContentNotFound(field.as_str()));
        }
        let replaced = current.replace(old_content, new_content);
        self.edit(field, replaced)
    }
}
