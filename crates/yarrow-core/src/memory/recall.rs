//! Recall memory: the append-only mirror of the full message log.
//!
//! Every message the engine commits is written through here, independent
//! of whether it is still in the context window. Search is paged with
//! `(offset, limit)` and always reports the total match count so tools
//! can page.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::message::Message;

/// Storage contract for recall memory. Implementations must be safe for
/// concurrent use by distinct agents.
#[async_trait]
pub trait RecallStorage: Send + Sync {
    async fn insert_many(&self, messages: Vec<Message>) -> Result<()>;

    async fn size(&self) -> Result<usize>;

    /// Case-insensitive substring search over message text.
    async fn query_text(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, usize)>;

    /// Messages created inside `[start, end]`, inclusive.
    async fn query_date(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, usize)>;

    async fn get(&self, id: Uuid) -> Result<Option<Message>>;
}

/// Reference connector backed by a plain vector.
#[derive(Default)]
pub struct InMemoryRecallStorage {
    messages: RwLock<Vec<Message>>,
}

impl InMemoryRecallStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T: Clone>(matches: Vec<T>, offset: usize, limit: usize) -> (Vec<T>, usize) {
    let total = matches.len();
    let page = matches
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect();
    (page, total)
}

#[async_trait]
impl RecallStorage for InMemoryRecallStorage {
    async fn insert_many(&self, messages: Vec<Message>) -> Result<()> {
        self.messages
            .write()
            .map_err(|_| anyhow::anyhow!("recall lock poisoned"))?
            .extend(messages);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self
            .messages
            .read()
            .map_err(|_| anyhow::anyhow!("recall lock poisoned"))?
            .len())
    }

    async fn query_text(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, usize)> {
        let needle = query.to_lowercase();
        let matches: Vec<Message> = self
            .messages
            .read()
            .map_err(|_| anyhow::anyhow!("recall lock poisoned"))?
            .iter()
            .filter(|m| {
                m.text
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        Ok(page(matches, offset, limit))
    }

    async fn query_date(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, usize)> {
        let matches: Vec<Message> = self
            .messages
            .read()
            .map_err(|_| anyhow::anyhow!("recall lock poisoned"))?
            .iter()
            .filter(|m| m.created_at >= start && m.created_at <= end)
            .cloned()
            .collect();
        Ok(page(matches, offset, limit))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .map_err(|_| anyhow::anyhow!("recall lock poisoned"))?
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }
}

/// Per-agent handle over a recall connector.
#[derive(Clone)]
pub struct RecallMemory {
    storage: Arc<dyn RecallStorage>,
}

impl RecallMemory {
    pub fn new(storage: Arc<dyn RecallStorage>) -> Self {
        Self { storage }
    }

    pub async fn insert(&self, message: Message) -> Result<()> {
        self.storage.insert_many(vec![message]).await
    }

    pub async fn insert_many(&self, messages: Vec<Message>) -> Result<()> {
        self.storage.insert_many(messages).await
    }

    pub async fn size(&self) -> Result<usize> {
        self.storage.size().await
    }

    pub async fn text_search(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, usize)> {
        self.storage.query_text(query, offset, limit).await
    }

    pub async fn date_search(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Message>, usize)> {
        self.storage.query_date(start, end, offset, limit).await
    }
}
