use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use alim_backend::config::{EmbeddingProvider, Settings};
use alim_backend::indexer::chunker::chunk_text;
use alim_backend::indexer::extractor::extract_documents;
use alim_backend::indexer::walker::{collect_files, SupportedFormat};
use alim_backend::llm::OpenAiClient;
use alim_backend::logging;
use alim_backend::rag::embeddings::EmbeddingGenerator;
use alim_backend::rag::vector_store::{point_id, IndexedChunk, VectorStore};

#[derive(Parser, Debug)]
#[command(name = "alim-indexer")]
#[command(about = "Build the Alim knowledge index from a text/PDF/JSONL corpus")]
struct Args {
    /// Knowledge-base file or directory to index
    #[arg(short, long, default_value = "knowledge_base/islamic_knowledge_base.txt")]
    input: PathBuf,

    /// Qdrant server URL (defaults to the configured one)
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Qdrant collection name (defaults to the configured one)
    #[arg(long)]
    collection: Option<String>,

    /// Maximum chunk size in characters
    #[arg(long, default_value_t = 1000)]
    chunk_size: usize,

    /// Overlap between chunks in characters
    #[arg(long, default_value_t = 200)]
    chunk_overlap: usize,

    /// Embedding backend (defaults to the configured one)
    #[arg(long, value_parser = parse_provider)]
    embedding: Option<EmbeddingProvider>,

    /// Add to the existing collection instead of rebuilding it
    #[arg(long)]
    append: bool,
}

fn parse_provider(value: &str) -> Result<EmbeddingProvider, String> {
    match value {
        "openai" => Ok(EmbeddingProvider::OpenAi),
        "local" => Ok(EmbeddingProvider::Local),
        other => Err(format!("unknown embedding provider '{}' (openai|local)", other)),
    }
}

struct Indexer {
    embeddings: EmbeddingGenerator,
    vector_store: VectorStore,
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
    collection_ready: bool,
    rebuild: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init("warn");

    let args = Args::parse();
    let mut settings = Settings::load()?;
    if let Some(provider) = args.embedding {
        settings.embedding.provider = provider;
    }
    let qdrant_url = args.qdrant_url.clone().unwrap_or(settings.vector_store.url.clone());
    let collection = args
        .collection
        .clone()
        .unwrap_or(settings.vector_store.collection.clone());

    if !args.input.exists() {
        anyhow::bail!(
            "Knowledge base not found: {}. Create it and add content first.",
            args.input.display()
        );
    }

    let files = collect_files(&args.input);
    println!("Found {} supported files in {}", files.len(), args.input.display());
    if files.is_empty() {
        println!("No supported files found; collection {} left unchanged.", collection);
        return Ok(());
    }

    let openai = OpenAiClient::new(settings.openai.base_url.clone(), settings.openai.api_key.clone());
    println!("Initializing embeddings ({:?})...", settings.embedding.provider);
    let embeddings = EmbeddingGenerator::from_settings(&settings.embedding, &openai)?;

    println!("Connecting to Qdrant at {}...", qdrant_url);
    let vector_store = VectorStore::new(&qdrant_url, &collection)?;

    let mut indexer = Indexer {
        embeddings,
        vector_store,
        chunk_size: args.chunk_size,
        chunk_overlap: args.chunk_overlap,
        batch_size: settings.embedding.batch_size.max(1),
        collection_ready: false,
        rebuild: !args.append,
    };

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut success_count = 0usize;
    let mut total_chunks = 0usize;
    let mut failed_files: Vec<(PathBuf, String)> = Vec::new();

    for (path, format) in &files {
        pb.set_message(format!("{}", path.file_name().unwrap_or_default().to_string_lossy()));

        match indexer.process_file(path, *format).await {
            Ok(chunk_count) => {
                success_count += 1;
                total_chunks += chunk_count;
            }
            Err(e) => {
                tracing::warn!("Failed to process {}: {}", path.display(), e);
                failed_files.push((path.clone(), format!("{}", e)));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    let stored = if indexer.collection_ready {
        indexer.vector_store.count().await.ok()
    } else {
        None
    };

    let outcome = IndexOutcome::of(indexer.rebuild, indexer.collection_ready);
    println!("\n{}", outcome.headline(&collection));
    println!("  Files processed: {}/{}", success_count, files.len());
    println!("  Files failed:    {}", failed_files.len());
    println!("  Chunks written:  {}", total_chunks);
    if let Some(count) = stored {
        println!("  Points stored:   {}", count);
    }
    println!("  Collection:      {}", collection);
    println!("  Embeddings:      {}", indexer.embeddings.describe());

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed_files {
            println!("  {}: {}", path.display(), err);
        }
    }

    if outcome == IndexOutcome::Untouched {
        anyhow::bail!("No chunks were embedded; collection '{}' was not rebuilt", collection);
    }
    Ok(())
}

/// What a run did to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexOutcome {
    Rebuilt,
    Appended,
    /// Nothing was embedded, so the collection was never dropped or written.
    Untouched,
}

impl IndexOutcome {
    fn of(rebuild: bool, collection_ready: bool) -> Self {
        match (collection_ready, rebuild) {
            (false, _) => Self::Untouched,
            (true, true) => Self::Rebuilt,
            (true, false) => Self::Appended,
        }
    }

    fn headline(&self, collection: &str) -> String {
        match self {
            Self::Rebuilt => format!("Indexing complete! Collection '{}' rebuilt.", collection),
            Self::Appended => format!("Indexing complete! Added to collection '{}'.", collection),
            Self::Untouched => format!(
                "Nothing was indexed. Collection '{}' was left unchanged.",
                collection
            ),
        }
    }
}

struct PendingChunk {
    id: u64,
    text: String,
    source: String,
    reference: Option<String>,
    chunk_index: usize,
}

impl Indexer {
    async fn process_file(&mut self, path: &Path, format: SupportedFormat) -> Result<usize> {
        let documents = extract_documents(path, format)?;
        let file_key = path.display().to_string();

        let mut pending: Vec<PendingChunk> = Vec::new();
        for document in &documents {
            for chunk in chunk_text(&document.text, self.chunk_size, self.chunk_overlap) {
                pending.push(PendingChunk {
                    id: point_id(&file_key, pending.len()),
                    text: chunk.text,
                    source: document.source.clone(),
                    reference: document.reference.clone(),
                    chunk_index: chunk.chunk_index,
                });
            }
        }

        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embeddings.generate(texts).await?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "Embedding backend returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }

            if !self.collection_ready {
                let dimension = vectors.first().map(|v| v.len() as u64).unwrap_or(0);
                self.prepare_collection(dimension).await?;
            }

            let chunks: Vec<IndexedChunk> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, embedding)| IndexedChunk {
                    id: chunk.id,
                    text: chunk.text.clone(),
                    source: chunk.source.clone(),
                    reference: chunk.reference.clone(),
                    chunk_index: chunk.chunk_index,
                    embedding,
                })
                .collect();
            self.vector_store.upsert(chunks).await?;
        }

        Ok(pending.len())
    }

    /// The collection is created lazily because its dimension comes from
    /// the first embedding batch.
    async fn prepare_collection(&mut self, dimension: u64) -> Result<()> {
        if dimension == 0 {
            anyhow::bail!("Embedding backend returned an empty vector");
        }
        if self.rebuild {
            self.vector_store.recreate_collection(dimension).await?;
        } else {
            self.vector_store.ensure_collection(dimension).await?;
        }
        self.collection_ready = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_when_nothing_embedded() {
        let outcome = IndexOutcome::of(true, false);
        assert_eq!(outcome, IndexOutcome::Untouched);
        assert!(outcome.headline("alim_knowledge").contains("left unchanged"));
        assert_eq!(IndexOutcome::of(false, false), IndexOutcome::Untouched);
    }

    #[test]
    fn test_outcome_after_writes() {
        assert_eq!(IndexOutcome::of(true, true), IndexOutcome::Rebuilt);
        assert_eq!(IndexOutcome::of(false, true), IndexOutcome::Appended);
        assert!(IndexOutcome::of(true, true)
            .headline("alim_knowledge")
            .contains("rebuilt"));
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(parse_provider("local"), Ok(EmbeddingProvider::Local));
        assert!(parse_provider("cohere").is_err());
    }
}
