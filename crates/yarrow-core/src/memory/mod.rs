//! Layered memory.
//!
//! Three tiers plus a compactor:
//! 1. Core memory — two bounded text blocks (persona, human) always
//!    present verbatim in the system preamble.
//! 2. Recall memory — append-only mirror of the full message log,
//!    searchable by text and date, independent of the context window.
//! 3. Archival memory — vector-indexed passages inserted by tools.
//! 4. Summarization — compaction of the in-context log under pressure.
//!
//! Storage backends live behind the `RecallStorage` / `ArchivalStorage`
//! traits; the in-memory connectors here are the reference implementation.

pub mod archival;
pub mod core;
pub mod embedding;
pub mod recall;
pub mod summarize;

pub use self::archival::{
    ArchivalMemory, ArchivalSearchResult, ArchivalStorage, InMemoryArchivalStorage,
    MAX_EMBEDDING_DIM,
};
pub use self::core::{CoreMemory, CoreMemoryError, CoreMemoryField};
pub use self::embedding::{Embedder, HttpEmbedder};
pub use self::recall::{InMemoryRecallStorage, RecallMemory, RecallStorage};
pub use self::summarize::{
    choose_cutoff, summarize_messages, MESSAGE_SUMMARY_TRUNC_KEEP_N_LAST,
    MESSAGE_SUMMARY_TRUNC_TOKEN_FRAC, MESSAGE_SUMMARY_WARNING_FRAC,
};
