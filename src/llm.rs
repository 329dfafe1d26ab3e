use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{AlimError, Result};
use crate::models::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse, Message,
    StreamChunk,
};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Hosted chat model used by the generation step.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: Vec<Message>) -> Result<String>;

    /// Text deltas in arrival order. The stream ends when the completion does.
    async fn stream(&self, messages: Vec<Message>) -> Result<TokenStream>;
}

/// Client for an OpenAI-compatible HTTP API.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(self.url(path));
        match self.api_key {
            Some(ref key) => req.bearer_auth(key),
            None => req,
        }
    }

    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let response = check_status(self.post("chat/completions").json(request).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Stream a completion, yielding content deltas.
    pub async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let response = check_status(self.post("chat/completions").json(request).send().await?).await?;

        let (tx, rx) = mpsc::channel(64);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            while let Some(item) = bytes.next().await {
                match item {
                    Ok(chunk) => {
                        if !forward(&tx, decoder.push(&chunk)).await {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(AlimError::Http(e))).await;
                        return;
                    }
                }
            }
            // upstream closed without a trailing newline
            forward(&tx, decoder.finish()).await;
        });

        Ok(rx)
    }

    pub async fn embeddings(&self, model: &str, input: &[String]) -> Result<Vec<Vec<f32>>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest { model, input };
        let response = check_status(self.post("embeddings").json(&body).send().await?).await?;
        let mut payload: EmbeddingResponse = response.json().await?;

        if payload.data.len() != input.len() {
            return Err(AlimError::Embedding(format!(
                "expected {} embeddings, got {}",
                input.len(),
                payload.data.len()
            )));
        }
        payload.data.sort_by_key(|d| d.index);
        Ok(payload.data.into_iter().map(|d| d.embedding).collect())
    }

    pub async fn health_check(&self) -> Result<bool> {
        let mut req = self.client.get(self.url("models"));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await?;
        Ok(response.status().is_success())
    }
}

/// Send decoded deltas; false once `[DONE]` is seen or the receiver is gone.
async fn forward(tx: &mpsc::Sender<Result<String>>, events: Vec<SseData>) -> bool {
    for event in events {
        match event {
            SseData::Done => return false,
            SseData::Delta(text) => {
                if tx.send(Ok(text)).await.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AlimError::Upstream { status: status.as_u16(), body })
}

/// `ChatModel` bound to one model name and temperature.
pub struct OpenAiChatModel {
    client: OpenAiClient,
    model: String,
    temperature: f32,
}

impl OpenAiChatModel {
    pub fn new(client: OpenAiClient, model: impl Into<String>, temperature: f32) -> Self {
        Self { client, model: model.into(), temperature }
    }

    fn request(&self, messages: Vec<Message>, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            stream,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, messages: Vec<Message>) -> Result<String> {
        let response = self.client.chat_completion(&self.request(messages, false)).await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream(&self, messages: Vec<Message>) -> Result<TokenStream> {
        let rx = self.client.chat_completion_stream(&self.request(messages, true)).await?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug, PartialEq)]
enum SseData {
    Delta(String),
    Done,
}

/// Incremental decoder for `data:` lines. Network chunks may split a line,
/// so the partial tail is kept until its newline arrives.
/// Bytes are buffered rather than text so a multibyte character split
/// across chunks survives.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseData> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_sse_line(String::from_utf8_lossy(&line).trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the byte stream has ended.
    fn finish(&mut self) -> Vec<SseData> {
        let rest = std::mem::take(&mut self.buffer);
        parse_sse_line(String::from_utf8_lossy(&rest).trim())
            .into_iter()
            .collect()
    }
}

fn parse_sse_line(line: &str) -> Option<SseData> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseData::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    let content = chunk.choices.into_iter().next()?.delta.content?;
    if content.is_empty() {
        None
    } else {
        Some(SseData::Delta(content))
    }
}
