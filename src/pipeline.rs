//! The two-step answer pipeline: retrieve, then generate.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::{AlimError, Result};
use crate::llm::ChatModel;
use crate::models::Message;
use crate::prompt::{PromptBuilder, NO_ANSWER_FALLBACK};
use crate::rag::{ContextRetriever, Passage};
use crate::session::{validate_session_id, SessionStore, Turn};

/// State threaded through the retrieve and generate steps.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub question: String,
    pub context: Vec<Passage>,
    pub answer: String,
    pub chat_history: Vec<Turn>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Token(String),
    Done { answer: String },
    Error(String),
}

pub struct AlimPipeline {
    sessions: Arc<SessionStore>,
    retriever: Option<Arc<dyn ContextRetriever>>,
    model: Arc<dyn ChatModel>,
    prompt: PromptBuilder,
    top_k: u64,
}

impl AlimPipeline {
    pub fn new(
        sessions: Arc<SessionStore>,
        retriever: Option<Arc<dyn ContextRetriever>>,
        model: Arc<dyn ChatModel>,
        prompt: PromptBuilder,
        top_k: u64,
    ) -> Self {
        Self { sessions, retriever, model, prompt, top_k }
    }

    pub fn has_retriever(&self) -> bool {
        self.retriever.is_some()
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    async fn start(&self, message: &str, session_id: &str) -> Result<ChatState> {
        validate_session_id(session_id)?;
        if message.trim().is_empty() {
            return Err(AlimError::EmptyMessage);
        }
        Ok(ChatState {
            question: message.to_string(),
            chat_history: self.sessions.load(session_id).await?,
            ..ChatState::default()
        })
    }

    async fn retrieve(&self, state: &mut ChatState) -> Result<()> {
        let Some(ref retriever) = self.retriever else {
            tracing::debug!("No knowledge index loaded, answering without context");
            return Ok(());
        };
        state.context = retriever.retrieve(&state.question, self.top_k).await?;
        tracing::info!("Retrieved {} passages", state.context.len());
        Ok(())
    }

    fn messages(&self, state: &ChatState) -> Vec<Message> {
        self.prompt.build(&state.question, &state.context, &state.chat_history)
    }

    /// Only the question is kept when no answer was produced.
    async fn persist_failure(&self, session_id: &str, question: &str) {
        if let Err(e) = self.sessions.append(session_id, &[Turn::human(question)]).await {
            tracing::error!("Failed to save session {}: {}", session_id, e);
        }
    }

    /// Run the pipeline to completion and return the answer.
    pub async fn answer(&self, message: &str, session_id: &str) -> Result<String> {
        let request_id = Uuid::new_v4();
        let mut state = self.start(message, session_id).await?;
        tracing::info!(%request_id, session_id, "Answering question");

        let outcome = async {
            self.retrieve(&mut state).await?;
            self.model.complete(self.messages(&state)).await
        }
        .await;

        match outcome {
            Ok(answer) => {
                state.answer = non_empty_answer(answer);
                self.sessions
                    .append(
                        session_id,
                        &[Turn::human(&state.question), Turn::ai(&state.answer)],
                    )
                    .await?;
                Ok(state.answer)
            }
            Err(e) => {
                tracing::error!(%request_id, "Pipeline failed: {}", e);
                self.persist_failure(session_id, &state.question).await;
                Err(e)
            }
        }
    }

    /// Retrieve and build the prompt up front, then stream the generation.
    ///
    /// Errors before the model starts answering are returned directly; later
    /// ones arrive as `ChatEvent::Error`. The turn is saved once the model
    /// stream ends, whether or not the receiver is still listening.
    pub async fn answer_stream(
        self: &Arc<Self>,
        message: &str,
        session_id: &str,
    ) -> Result<ReceiverStream<ChatEvent>> {
        let request_id = Uuid::new_v4();
        let mut state = self.start(message, session_id).await?;
        tracing::info!(%request_id, session_id, "Streaming answer");

        let tokens = async {
            self.retrieve(&mut state).await?;
            self.model.stream(self.messages(&state)).await
        }
        .await;

        let mut tokens = match tokens {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(%request_id, "Pipeline failed: {}", e);
                self.persist_failure(session_id, &state.question).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let pipeline = Arc::clone(self);
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut answer = String::new();
            let mut listening = true;

            while let Some(item) = tokens.next().await {
                match item {
                    Ok(delta) => {
                        answer.push_str(&delta);
                        if listening && tx.send(ChatEvent::Token(delta)).await.is_err() {
                            tracing::debug!(%request_id, "Client went away, finishing in background");
                            listening = false;
                        }
                    }
                    Err(e) => {
                        tracing::error!(%request_id, "Generation stream failed: {}", e);
                        pipeline.persist_failure(&session_id, &state.question).await;
                        let _ = tx.send(ChatEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }

            state.answer = non_empty_answer(answer);
            let saved = pipeline
                .sessions
                .append(
                    &session_id,
                    &[Turn::human(&state.question), Turn::ai(&state.answer)],
                )
                .await;
            let event = match saved {
                Ok(()) => ChatEvent::Done { answer: state.answer },
                Err(e) => {
                    tracing::error!(%request_id, "Failed to save session {}: {}", session_id, e);
                    ChatEvent::Error(e.to_string())
                }
            };
            let _ = tx.send(event).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

fn non_empty_answer(answer: String) -> String {
    if answer.trim().is_empty() {
        NO_ANSWER_FALLBACK.to_string()
    } else {
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TokenStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedRetriever {
        passages: Vec<Passage>,
        fail: bool,
    }

    #[async_trait]
    impl ContextRetriever for FixedRetriever {
        async fn retrieve(&self, _query: &str, top_k: u64) -> Result<Vec<Passage>> {
            if self.fail {
                return Err(AlimError::VectorStore("index offline".to_string()));
            }
            Ok(self.passages.iter().take(top_k as usize).cloned().collect())
        }
    }

    /// Replays canned deltas and records the prompts it was given.
    struct ScriptedModel {
        deltas: Vec<Result<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(deltas: Vec<Result<String>>) -> Self {
            Self { deltas, prompts: Mutex::new(Vec::new()) }
        }

        fn replay(&self, messages: &[Message]) -> Vec<Result<String>> {
            self.prompts.lock().unwrap().push(messages[0].content.clone());
            self.deltas
                .iter()
                .map(|d| match d {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(AlimError::Upstream { status: 500, body: e.to_string() }),
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, messages: Vec<Message>) -> Result<String> {
            self.replay(&messages).into_iter().collect()
        }

        async fn stream(&self, messages: Vec<Message>) -> Result<TokenStream> {
            Ok(Box::pin(futures::stream::iter(self.replay(&messages))))
        }
    }

    fn passage(text: &str) -> Passage {
        Passage {
            text: text.to_string(),
            source: "kb.txt".to_string(),
            reference: None,
            chunk_index: 0,
            score: 0.8,
        }
    }

    fn pipeline(
        retriever: Option<FixedRetriever>,
        model: ScriptedModel,
    ) -> (tempfile::TempDir, Arc<ScriptedModel>, Arc<AlimPipeline>) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path()).unwrap());
        let model = Arc::new(model);
        let pipeline = AlimPipeline::new(
            sessions,
            retriever.map(|r| Arc::new(r) as Arc<dyn ContextRetriever>),
            model.clone(),
            PromptBuilder::new(2000),
            4,
        );
        (dir, model, Arc::new(pipeline))
    }

    #[tokio::test]
    async fn test_answer_persists_both_turns() {
        let retriever = FixedRetriever { passages: vec![passage("Le Ramadan est le mois du jeûne.")], fail: false };
        let model = ScriptedModel::new(vec![Ok("Le Ramadan est ".to_string()), Ok("le neuvième mois.".to_string())]);
        let (_dir, model, pipeline) = pipeline(Some(retriever), model);

        let answer = pipeline.answer("Qu'est-ce que le Ramadan ?", "s1").await.unwrap();
        assert_eq!(answer, "Le Ramadan est le neuvième mois.");

        let turns = pipeline.sessions().load("s1").await.unwrap();
        assert_eq!(turns, vec![Turn::human("Qu'est-ce que le Ramadan ?"), Turn::ai(answer)]);

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("Le Ramadan est le mois du jeûne."));
    }

    #[tokio::test]
    async fn test_history_feeds_next_prompt() {
        let model = ScriptedModel::new(vec![Ok("ok".to_string())]);
        let (_dir, model, pipeline) = pipeline(None, model);

        pipeline.answer("Première question", "s2").await.unwrap();
        pipeline.answer("Deuxième question", "s2").await.unwrap();

        let prompts = model.prompts.lock().unwrap();
        assert!(!prompts[0].contains("Utilisateur: Première question"));
        assert!(prompts[1].contains("Utilisateur: Première question\nAlim: ok"));
        assert_eq!(pipeline.sessions().load("s2").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_model_output_uses_fallback() {
        let (_dir, _model, pipeline) = pipeline(None, ScriptedModel::new(vec![Ok("  ".to_string())]));
        let answer = pipeline.answer("Question", "s3").await.unwrap();
        assert_eq!(answer, NO_ANSWER_FALLBACK);
    }

    #[tokio::test]
    async fn test_retrieval_failure_keeps_only_question() {
        let retriever = FixedRetriever { passages: vec![], fail: true };
        let (_dir, _model, pipeline) = pipeline(Some(retriever), ScriptedModel::new(vec![Ok("x".to_string())]));

        let err = pipeline.answer("Question", "s4").await.unwrap_err();
        assert!(matches!(err, AlimError::VectorStore(_)));
        assert_eq!(pipeline.sessions().load("s4").await.unwrap(), vec![Turn::human("Question")]);
    }

    #[tokio::test]
    async fn test_rejects_bad_input_without_writing() {
        let (_dir, _model, pipeline) = pipeline(None, ScriptedModel::new(vec![]));
        assert!(matches!(pipeline.answer("Question", "").await, Err(AlimError::InvalidSessionId(_))));
        assert!(matches!(pipeline.answer("   ", "s5").await, Err(AlimError::EmptyMessage)));
        assert!(pipeline.sessions().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_emits_tokens_then_done() {
        let model = ScriptedModel::new(vec![Ok("As-".to_string()), Ok("salam".to_string())]);
        let (_dir, _model, pipeline) = pipeline(None, model);

        let events: Vec<ChatEvent> = pipeline.answer_stream("Salam", "s6").await.unwrap().collect().await;
        assert_eq!(
            events,
            vec![
                ChatEvent::Token("As-".to_string()),
                ChatEvent::Token("salam".to_string()),
                ChatEvent::Done { answer: "As-salam".to_string() },
            ]
        );
        assert_eq!(pipeline.sessions().load("s6").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stream_error_mid_generation() {
        let model = ScriptedModel::new(vec![
            Ok("Début".to_string()),
            Err(AlimError::EmptyMessage),
        ]);
        let (_dir, _model, pipeline) = pipeline(None, model);

        let events: Vec<ChatEvent> = pipeline.answer_stream("Question", "s7").await.unwrap().collect().await;
        assert_eq!(events[0], ChatEvent::Token("Début".to_string()));
        assert!(matches!(events[1], ChatEvent::Error(_)));
        assert_eq!(pipeline.sessions().load("s7").await.unwrap(), vec![Turn::human("Question")]);
    }

    #[tokio::test]
    async fn test_stream_saves_after_client_disconnect() {
        let model = ScriptedModel::new((0..200).map(|i| Ok(format!("{} ", i))).collect());
        let (_dir, _model, pipeline) = pipeline(None, model);

        let stream = pipeline.answer_stream("Question", "s8").await.unwrap();
        drop(stream);

        // the background task finishes on its own
        for _ in 0..50 {
            if pipeline.sessions().load("s8").await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let turns = pipeline.sessions().load("s8").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert!(turns[1].content.starts_with("0 1 2 "));
    }
}
