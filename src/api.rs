//! HTTP routes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderValue, Method},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{AlimError, ApiError, ErrorBody};
use crate::models::{
    ChatRequest, ChatResponse, ChatStreamQuery, HistoryMessage, SessionInfo, SynthesizeQuery,
    TranscriptionResponse,
};
use crate::pipeline::{AlimPipeline, ChatEvent};
use crate::voice::VoiceService;

/// Hosted transcription rejects uploads above 25 MB.
const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

pub struct AppState {
    pub pipeline: Arc<AlimPipeline>,
    pub voice: Option<VoiceService>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let chat = Router::new()
        .route("/message", post(chat_message_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/:session_id", get(session_history_handler));

    let voice = Router::new()
        .route("/transcribe", post(transcribe_handler))
        .route("/synthesize", post(synthesize_handler))
        .route("/synthesize_arabic", post(synthesize_arabic_handler))
        .layer(DefaultBodyLimit::max(MAX_AUDIO_BYTES));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .nest("/api/v1/chat", chat)
        .nest("/api/v1/voice", voice)
        // paths the bundled web client calls
        .route("/api/message", post(chat_message_json_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/:session_id", get(session_history_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    layer
        .allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(true)
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Welcome to the Alim API!" }))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "API is running",
        "services": {
            "retrieval": state.pipeline.has_retriever(),
            "voice": state.voice.is_some(),
        }
    }))
}

async fn chat_message_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ChatStreamQuery>, QueryRejection>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let Json(request) = payload?;
    if query.stream == Some(false) {
        return answer_json(&state, request).await.map(IntoResponse::into_response);
    }

    let events = state
        .pipeline
        .answer_stream(&request.message, &request.session_id)
        .await?;

    let session_id = request.session_id;
    let stream = events.map(move |event| Ok::<_, Infallible>(sse_event(event, &session_id)));

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn chat_message_json_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload?;
    answer_json(&state, request).await
}

async fn answer_json(state: &AppState, request: ChatRequest) -> Result<Json<ChatResponse>, ApiError> {
    let answer = state
        .pipeline
        .answer(&request.message, &request.session_id)
        .await?;
    Ok(Json(ChatResponse {
        answer,
        session_id: request.session_id,
    }))
}

fn sse_event(event: ChatEvent, session_id: &str) -> Event {
    match event {
        ChatEvent::Token(delta) => Event::default()
            .event("token")
            .data(normalize_newlines(&delta)),
        ChatEvent::Done { answer } => {
            let body = ChatResponse {
                answer,
                session_id: session_id.to_string(),
            };
            Event::default()
                .event("done")
                .data(serde_json::to_string(&body).unwrap_or_default())
        }
        ChatEvent::Error(detail) => Event::default()
            .event("error")
            .data(serde_json::to_string(&ErrorBody { detail }).unwrap_or_default()),
    }
}

/// SSE data lines cannot carry a bare carriage return.
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

async fn list_sessions_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    Ok(Json(state.pipeline.sessions().list().await?))
}

async fn session_history_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<HistoryMessage>>, ApiError> {
    let messages = state.pipeline.sessions().history(&session_id).await?;
    if messages.is_empty() {
        return Err(ApiError::NotFound("Session not found or empty.".to_string()));
    }
    Ok(Json(messages))
}

fn voice_service(state: &AppState) -> Result<&VoiceService, ApiError> {
    state
        .voice
        .as_ref()
        .ok_or_else(|| AlimError::Unavailable("Voice service".to_string()).into())
}

async fn transcribe_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<TranscriptionResponse>, ApiError> {
    let voice = voice_service(&state)?;
    let mut multipart = multipart?;

    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read multipart field: {}", e)))?
    {
        if !matches!(field.name(), Some("file") | Some("audio")) {
            continue;
        }
        let filename = field.file_name().unwrap_or("recording.webm").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read file data: {}", e)))?;
        upload = Some((filename, data.to_vec()));
    }

    let (filename, audio) = upload.ok_or_else(|| {
        ApiError::BadRequest("Missing 'file' field in multipart form data".to_string())
    })?;

    let transcription = voice.transcribe(audio, &filename).await?;
    Ok(Json(TranscriptionResponse { transcription }))
}

async fn synthesize_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SynthesizeQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let voice = voice_service(&state)?;
    let Query(query) = query?;
    speech_response(voice, &query.text, voice.default_voice()).await
}

async fn synthesize_arabic_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SynthesizeQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let voice = voice_service(&state)?;
    let Query(query) = query?;
    speech_response(voice, &query.text, voice.arabic_voice()).await
}

async fn speech_response(
    service: &VoiceService,
    text: &str,
    voice: &str,
) -> Result<Response, ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".to_string()));
    }
    let audio = service.synthesize(text, voice).await?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], Body::from_stream(audio)).into_response())
}
