use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    /// One `<session_id>.json` file per conversation lives here.
    pub memory_dir: PathBuf,
    pub openai: OpenAiSettings,
    pub chat: ChatSettings,
    pub embedding: EmbeddingSettings,
    pub vector_store: VectorStoreSettings,
    pub voice: VoiceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            memory_dir: PathBuf::from("conversation_memories"),
            openai: OpenAiSettings::default(),
            chat: ChatSettings::default(),
            embedding: EmbeddingSettings::default(),
            vector_store: VectorStoreSettings::default(),
            voice: VoiceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub model: String,
    pub temperature: f32,
    pub top_k: u64,
    pub history_token_budget: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            top_k: 4,
            history_token_budget: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAi,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub local_model_dir: PathBuf,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::OpenAi,
            model: "text-embedding-3-large".to_string(),
            local_model_dir: PathBuf::from("models/bge-small-en-v1.5"),
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreSettings {
    pub url: String,
    pub collection: String,
}

impl Default for VectorStoreSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            collection: "alim_knowledge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub transcription_model: String,
    pub speech_model: String,
    pub voice: String,
    pub arabic_voice: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            transcription_model: "whisper-1".to_string(),
            speech_model: "tts-1".to_string(),
            voice: "onyx".to_string(),
            arabic_voice: "alloy".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `alim.{toml,yaml,json}` if present, then `ALIM_*` env vars.
    pub fn load() -> Result<Self> {
        Self::load_from(config::Environment::with_prefix("ALIM"))
    }

    fn load_from(env: config::Environment) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name("alim").required(false))
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut settings: Settings = raw
            .try_deserialize()
            .context("Invalid configuration")?;

        if settings.openai.api_key.is_none() {
            settings.openai.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty());
        }

        Ok(settings)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| {
                format!("Invalid bind address {}:{}", self.server.host, self.server.port)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("ALIM").source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.chat.model, "gpt-4o-mini");
        assert_eq!(settings.chat.top_k, 4);
        assert_eq!(settings.embedding.provider, EmbeddingProvider::OpenAi);
        assert_eq!(settings.memory_dir, PathBuf::from("conversation_memories"));
        assert_eq!(settings.voice.voice, "onyx");
    }

    #[test]
    fn test_env_overrides_nested_values() {
        let settings = Settings::load_from(env(&[
            ("ALIM_SERVER__PORT", "9100"),
            ("ALIM_CHAT__MODEL", "gpt-4o"),
            ("ALIM_EMBEDDING__PROVIDER", "local"),
            ("ALIM_MEMORY_DIR", "/tmp/alim-sessions"),
        ]))
        .unwrap();

        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.chat.model, "gpt-4o");
        assert_eq!(settings.embedding.provider, EmbeddingProvider::Local);
        assert_eq!(settings.memory_dir, PathBuf::from("/tmp/alim-sessions"));
        // untouched sections keep their defaults
        assert_eq!(settings.vector_store.collection, "alim_knowledge");
    }

    #[test]
    fn test_cors_origins_list_parsing() {
        let settings = Settings::load_from(env(&[(
            "ALIM_SERVER__CORS_ORIGINS",
            "https://alim.example,http://localhost:3000",
        )]))
        .unwrap();

        assert_eq!(
            settings.server.cors_origins,
            vec!["https://alim.example", "http://localhost:3000"]
        );
    }

    #[test]
    fn test_bind_addr() {
        let settings = Settings::default();
        assert_eq!(settings.bind_addr().unwrap().port(), 8000);
    }
}
