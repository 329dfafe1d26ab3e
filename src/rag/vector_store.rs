use anyhow::Result;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::Passage;

/// A chunk ready to be written to the index.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub id: u64,
    pub text: String,
    pub source: String,
    pub reference: Option<String>,
    pub chunk_index: usize,
    pub embedding: Vec<f32>,
}

/// Stable point id for the `ordinal`-th chunk of a file, so re-running the
/// indexer overwrites points instead of duplicating them.
pub fn point_id(file: &str, ordinal: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(file.as_bytes());
    hasher.update(b"#");
    hasher.update(ordinal.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

pub struct VectorStore {
    client: Qdrant,
    collection_name: String,
}

impl VectorStore {
    /// Connect without touching the collection. Used by the indexer, which
    /// (re)creates it once the embedding dimension is known.
    pub fn new(url: &str, collection_name: &str) -> Result<Self> {
        tracing::info!("Building Qdrant client for URL: {}", url);
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| anyhow::anyhow!("Qdrant client build failed: {}", e))?;

        Ok(Self {
            client,
            collection_name: collection_name.to_string(),
        })
    }

    /// Connect to a prebuilt index. Fails if the collection does not exist.
    pub async fn connect(url: &str, collection_name: &str) -> Result<Self> {
        let store = Self::new(url, collection_name)?;
        if !store.client.collection_exists(&store.collection_name).await? {
            anyhow::bail!(
                "Collection '{}' does not exist; run alim-indexer first",
                store.collection_name
            );
        }
        tracing::info!("Qdrant collection '{}' ready", store.collection_name);
        Ok(store)
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub async fn recreate_collection(&self, dimension: u64) -> Result<()> {
        if self.client.collection_exists(&self.collection_name).await? {
            tracing::info!("Dropping collection '{}'", self.collection_name);
            self.client.delete_collection(&self.collection_name).await?;
        }
        self.create_collection(dimension).await
    }

    pub async fn ensure_collection(&self, dimension: u64) -> Result<()> {
        if !self.client.collection_exists(&self.collection_name).await? {
            self.create_collection(dimension).await?;
        }
        Ok(())
    }

    async fn create_collection(&self, dimension: u64) -> Result<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name)
                    .vectors_config(VectorParamsBuilder::new(dimension, Distance::Cosine)),
            )
            .await?;
        tracing::info!(
            "Created collection '{}' ({} dimensions)",
            self.collection_name,
            dimension
        );
        Ok(())
    }

    pub async fn upsert(&self, chunks: Vec<IndexedChunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = chunks
            .into_iter()
            .map(|chunk| {
                let id = chunk.id;
                let mut payload = JsonMap::new();
                payload.insert("text".to_string(), JsonValue::String(chunk.text));
                payload.insert("source".to_string(), JsonValue::String(chunk.source));
                if let Some(reference) = chunk.reference {
                    payload.insert("reference".to_string(), JsonValue::String(reference));
                }
                payload.insert("chunk_index".to_string(), JsonValue::from(chunk.chunk_index));
                PointStruct::new(id, chunk.embedding, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await?;

        Ok(())
    }

    pub async fn search(&self, query_vector: Vec<f32>, limit: u64) -> Result<Vec<Passage>> {
        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, query_vector, limit)
                    .with_payload(true),
            )
            .await?;

        Ok(search_result
            .result
            .into_iter()
            .filter_map(|point| passage_from_payload(&point.payload, point.score))
            .collect())
    }

    pub async fn count(&self) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection_name).exact(true))
            .await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }
}

fn passage_from_payload(payload: &HashMap<String, QdrantValue>, score: f32) -> Option<Passage> {
    let text = payload.get("text")?.as_str()?.to_string();
    let source = payload
        .get("source")
        .and_then(|v| v.as_str())
        .cloned()
        .unwrap_or_default();
    let reference = payload.get("reference").and_then(|v| v.as_str()).cloned();
    let chunk_index = payload
        .get("chunk_index")
        .and_then(|v| v.as_integer())
        .unwrap_or(0) as usize;

    Some(Passage {
        text,
        source,
        reference,
        chunk_index,
        score,
    })
}
