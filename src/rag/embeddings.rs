use std::path::Path;

use anyhow::{Context, Result};
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};

use crate::config::{EmbeddingProvider, EmbeddingSettings};
use crate::llm::OpenAiClient;

/// Turns text into vectors, either through the hosted embeddings endpoint or a
/// local ONNX model. Queries must be embedded with the same backend that built
/// the index.
pub enum EmbeddingGenerator {
    OpenAi { client: OpenAiClient, model: String },
    Local { model: TextEmbedding },
}

impl EmbeddingGenerator {
    pub fn from_settings(settings: &EmbeddingSettings, client: &OpenAiClient) -> Result<Self> {
        match settings.provider {
            EmbeddingProvider::OpenAi => {
                if !client.has_api_key() {
                    anyhow::bail!("OpenAI embeddings selected but no API key is configured");
                }
                Ok(Self::OpenAi {
                    client: client.clone(),
                    model: settings.model.clone(),
                })
            }
            EmbeddingProvider::Local => Self::local(&settings.local_model_dir),
        }
    }

    pub fn local(model_dir: &Path) -> Result<Self> {
        tracing::info!("Initializing embedding model from {}", model_dir.display());

        if !model_dir.exists() {
            anyhow::bail!("Model directory not found: {}", model_dir.display());
        }

        let read = |name: &str| {
            std::fs::read(model_dir.join(name)).with_context(|| format!("Failed to read {}", name))
        };

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read("model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read("tokenizer.json")?,
                config_file: read("config.json")?,
                special_tokens_map_file: read("special_tokens_map.json")?,
                tokenizer_config_file: read("tokenizer_config.json")?,
            },
        };

        let model =
            TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
                .map_err(|e| anyhow::anyhow!("Failed to initialize embedding model: {}", e))?;

        tracing::info!("Embedding model initialized successfully");
        Ok(Self::Local { model })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::OpenAi { model, .. } => format!("openai:{}", model),
            Self::Local { .. } => "local".to_string(),
        }
    }

    pub async fn generate(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::OpenAi { client, model } => Ok(client.embeddings(model, &texts).await?),
            Self::Local { model } => model
                .embed(texts, None)
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e)),
        }
    }

    pub async fn generate_single(&self, text: &str) -> Result<Vec<f32>> {
        self.generate(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .context("Embedding backend returned no vector")
    }
}
