pub mod chunker;
pub mod extractor;
pub mod walker;
