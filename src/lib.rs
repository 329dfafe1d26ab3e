pub mod api;
pub mod config;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod rag;
pub mod session;
pub mod voice;
