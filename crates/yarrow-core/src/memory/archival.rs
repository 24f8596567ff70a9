//! Archival memory: vector-indexed long-term storage.
//!
//! Inserted text is split into passages by a sentence-aware chunker, one
//! embedding per passage. Query vectors are zero-padded to
//! `MAX_EMBEDDING_DIM` so backends with fixed-width vector columns stay
//! compatible when the embedding model changes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use super::embedding::Embedder;
use crate::system::format_time;
use crate::tokens::TokenCounter;

/// Maximum supported embedding size. Do NOT change or fixed-width vector
/// columns will need to be rebuilt.
pub const MAX_EMBEDDING_DIM: usize = 4096;

/// Default ranked pool per query; paging slices into it.
const DEFAULT_TOP_K: usize = 100;

/// A stored passage. Never mutated after insert.
#[derive(Debug, Clone)]
pub struct Passage {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub text: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// What archival search hands back to tools.
#[derive(Debug, Clone)]
pub struct ArchivalSearchResult {
    pub timestamp: String,
    pub content: String,
}

/// Storage contract for archival memory.
#[async_trait]
pub trait ArchivalStorage: Send + Sync {
    async fn insert_many(&self, passages: Vec<Passage>) -> Result<()>;

    async fn size(&self) -> Result<usize>;

    /// Passages ranked by similarity to the (padded) query vector.
    async fn query(&self, query_vec: &[f32], top_k: usize) -> Result<Vec<(Passage, f32)>>;
}

/// Zero-pad a query vector to the fixed column width.
pub fn pad_query_embedding(mut vec: Vec<f32>) -> Vec<f32> {
    vec.truncate(MAX_EMBEDDING_DIM);
    vec.resize(MAX_EMBEDDING_DIM, 0.0);
    vec
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Split text into passages of roughly `chunk_size` tokens, preferring
/// sentence boundaries and hard-splitting oversized sentences.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let counter = TokenCounter::default();
    let char_budget = chunk_size * 4;

    let mut sentences: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut chunk = String::new();
    for sentence in sentences {
        // Oversized single sentence: flush and hard-split on char
        // boundaries.
        if counter.count(&sentence) > chunk_size {
            if !chunk.is_empty() {
                chunks.push(std::mem::take(&mut chunk));
            }
            let mut piece = String::new();
            for ch in sentence.chars() {
                piece.push(ch);
                if piece.len() >= char_budget {
                    chunks.push(std::mem::take(&mut piece));
                }
            }
            if !piece.is_empty() {
                chunks.push(piece);
            }
            continue;
        }

        if !chunk.is_empty() && counter.count(&chunk) + counter.count(&sentence) > chunk_size {
            chunks.push(std::mem::take(&mut chunk));
        }
        if !chunk.is_empty() {
            chunk.push(' ');
        }
        chunk.push_str(&sentence);
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks
}

/// Reference connector: brute-force cosine ranking over an in-memory
/// vector of passages.
#[derive(Default)]
pub struct InMemoryArchivalStorage {
    passages: RwLock<Vec<Passage>>,
}

impl InMemoryArchivalStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchivalStorage for InMemoryArchivalStorage {
    async fn insert_many(&self, passages: Vec<Passage>) -> Result<()> {
        self.passages
            .write()
            .map_err(|_| anyhow::anyhow!("archival lock poisoned"))?
            .extend(passages);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self
            .passages
            .read()
            .map_err(|_| anyhow::anyhow!("archival lock poisoned"))?
            .len())
    }

    async fn query(&self, query_vec: &[f32], top_k: usize) -> Result<Vec<(Passage, f32)>> {
        let mut ranked: Vec<(Passage, f32)> = self
            .passages
            .read()
            .map_err(|_| anyhow::anyhow!("archival lock poisoned"))?
            .iter()
            .map(|p| {
                let padded = pad_query_embedding(p.embedding.clone());
                (p.clone(), cosine_similarity(&padded, query_vec))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(top_k);
        Ok(ranked)
    }
}

/// Per-agent handle over an archival connector plus the embedder.
#[derive(Clone)]
pub struct ArchivalMemory {
    agent_id: Uuid,
    owner_id: Uuid,
    storage: Arc<dyn ArchivalStorage>,
    embedder: Arc<dyn Embedder>,
    chunk_size: usize,
    top_k: usize,
}

impl ArchivalMemory {
    pub fn new(
        agent_id: Uuid,
        owner_id: Uuid,
        storage: Arc<dyn ArchivalStorage>,
        embedder: Arc<dyn Embedder>,
        chunk_size: usize,
    ) -> Self {
        Self {
            agent_id,
            owner_id,
            storage,
            embedder,
            chunk_size,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub async fn size(&self) -> Result<usize> {
        self.storage.size().await
    }

    /// Chunk, embed, and store. Returns the ids of the created passages.
    pub async fn insert(&self, text: &str) -> Result<Vec<Uuid>> {
        let mut passages = Vec::new();
        for chunk in chunk_text(text, self.chunk_size) {
            let embedding = self.embedder.embed(&chunk).await?;
            passages.push(Passage {
                id: Uuid::new_v4(),
                agent_id: self.agent_id,
                owner_id: self.owner_id,
                text: chunk,
                embedding,
                created_at: Utc::now(),
            });
        }
        let ids = passages.iter().map(|p| p.id).collect();
        self.storage.insert_many(passages).await?;
        Ok(ids)
    }

    /// Similarity search with `(offset, limit)` paging over the ranked
    /// top-k pool. Returns the page and the pool size.
    pub async fn search(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ArchivalSearchResult>, usize)> {
        let query_vec = pad_query_embedding(self.embedder.embed(query).await?);
        let ranked = self.storage.query(&query_vec, self.top_k).await?;
        let total = ranked.len();
        let page = ranked
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(p, _score)| ArchivalSearchResult {
                timestamp: format_time(p.created_at),
                content: p.text,
            })
            .collect();
        Ok((page, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embedding::testing::DeterministicEmbedder;

    fn archival() -> ArchivalMemory {
        ArchivalMemory::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Arc::new(InMemoryArchivalStorage::new()),
            Arc::new(DeterministicEmbedder::new(16)),
            300,
        )
    }

    #[test]
    fn padding_is_fixed_width() {
        let padded = pad_query_embedding(vec![1.0, 2.0]);
        assert_eq!(padded.len(), MAX_EMBEDDING_DIM);
        assert_eq!(padded[0], 1.0);
        assert_eq!(padded[2], 0.0);
    }

    #[test]
    fn chunking_respects_sentences_and_budget() {
        let text = "First sentence. Second sentence. Third sentence.";
        let chunks = chunk_text(text, 300);
        assert_eq!(chunks.len(), 1);

        // Tiny budget: one sentence per chunk.
        let chunks = chunk_text(text, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "First sentence.");

        // A single run-on sentence longer than the budget is hard-split.
        let long = "x".repeat(100);
        let chunks = chunk_text(&long, 5);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 20));
    }

    #[tokio::test]
    async fn insert_creates_one_passage_per_chunk() {
        let archival = archival();
        let ids = archival.insert("A fact worth keeping.").await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(archival.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_ranks_similar_content_first() {
        let archival = archival();
        archival.insert("The user loves sailing boats.").await.unwrap();
        archival.insert("Quarterly report deadline is March.").await.unwrap();

        let (results, total) = archival
            .search("The user loves sailing boats.", 0, 1)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("sailing"));
        assert!(results[0].timestamp.ends_with("UTC"));
    }

    #[tokio::test]
    async fn search_paging_offsets_into_ranked_pool() {
        let archival = archival();
        for i in 0..5 {
            archival.insert(&format!("note number {i}.")).await.unwrap();
        }
        let (page1, total) = archival.search("note", 0, 2).await.unwrap();
        let (page2, _) = archival.search("note", 2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_ne!(page1[0].content, page2[0].content);
    }
}
