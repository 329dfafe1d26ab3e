pub mod embeddings;
pub mod vector_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AlimError, Result};
use self::embeddings::EmbeddingGenerator;
use self::vector_store::VectorStore;

/// A retrieved knowledge-base passage with its citation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub source: String,
    pub reference: Option<String>,
    pub chunk_index: usize,
    pub score: f32,
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: u64) -> Result<Vec<Passage>>;
}

pub struct RagEngine {
    embeddings: EmbeddingGenerator,
    vector_store: VectorStore,
}

impl RagEngine {
    pub fn new(embeddings: EmbeddingGenerator, vector_store: VectorStore) -> Self {
        Self {
            embeddings,
            vector_store,
        }
    }

    pub async fn connect(
        embeddings: EmbeddingGenerator,
        qdrant_url: &str,
        collection_name: &str,
    ) -> anyhow::Result<Self> {
        let vector_store = VectorStore::connect(qdrant_url, collection_name).await?;
        let points = vector_store.count().await?;
        tracing::info!(
            "Knowledge index '{}' holds {} chunks (embeddings: {})",
            collection_name,
            points,
            embeddings.describe()
        );
        Ok(Self::new(embeddings, vector_store))
    }
}

#[async_trait]
impl ContextRetriever for RagEngine {
    async fn retrieve(&self, query: &str, top_k: u64) -> Result<Vec<Passage>> {
        let query_embedding = self
            .embeddings
            .generate_single(query)
            .await
            .map_err(|e| AlimError::Embedding(e.to_string()))?;

        let passages = self
            .vector_store
            .search(query_embedding, top_k)
            .await
            .map_err(|e| AlimError::VectorStore(e.to_string()))?;

        tracing::debug!("Retrieved {} passages", passages.len());
        Ok(passages)
    }
}
