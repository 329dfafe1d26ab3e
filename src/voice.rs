use axum::body::Bytes;
use futures::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};

use crate::config::VoiceSettings;
use crate::error::{AlimError, Result};
use crate::llm::{check_status, OpenAiClient};
use crate::models::SpeechRequest;

/// Pass-through to the hosted speech-to-text and text-to-speech endpoints.
pub struct VoiceService {
    client: OpenAiClient,
    settings: VoiceSettings,
}

impl VoiceService {
    pub fn new(client: OpenAiClient, settings: VoiceSettings) -> Self {
        Self { client, settings }
    }

    pub fn default_voice(&self) -> &str {
        &self.settings.voice
    }

    pub fn arabic_voice(&self) -> &str {
        &self.settings.arabic_voice
    }

    pub async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String> {
        if audio.is_empty() {
            return Err(AlimError::InvalidInput("audio file is empty".to_string()));
        }

        // the upstream infers the container from the file name
        let part = Part::bytes(audio).file_name(filename.to_string());
        let form = Form::new()
            .text("model", self.settings.transcription_model.clone())
            .part("file", part);

        let response = check_status(
            self.client
                .post("audio/transcriptions")
                .multipart(form)
                .send()
                .await?,
        )
        .await?;

        let status = response.status().as_u16();
        let payload: serde_json::Value = response.json().await?;
        let Some(text) = payload.get("text").and_then(|t| t.as_str()) else {
            return Err(AlimError::Upstream {
                status,
                body: format!("transcription response has no text: {}", payload),
            });
        };
        let text = text.to_string();
        tracing::info!("Transcribed {} characters", text.chars().count());
        Ok(text)
    }

    /// MP3 audio for `text`, streamed as it arrives.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<impl Stream<Item = Result<Bytes>> + Send + 'static> {
        let body = SpeechRequest {
            model: &self.settings.speech_model,
            voice,
            input: text,
            response_format: "mp3",
        };
        let response =
            check_status(self.client.post("audio/speech").json(&body).send().await?).await?;

        Ok(response.bytes_stream().map(|chunk| chunk.map_err(AlimError::from)))
    }
}
