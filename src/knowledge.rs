//! Knowledge-base lookup interface.
//!
//! The vector store itself lives outside the engine; agents consume this
//! read-only capability when composing prompts.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Snippet {
    pub source: String,
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Snippet>>;
}

/// Default implementation used when no knowledge base is attached.
#[derive(Debug, Default)]
pub struct NullKnowledge;

#[async_trait]
impl KnowledgeSearch for NullKnowledge {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Snippet>> {
        Ok(Vec::new())
    }
}
