use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use doc_qa_core::{
    discover_documents, ChunkingConfig, DocumentExtractor, IndexError, NotesConfig,
    NotesGenerator, NotesMode, ProviderKind, QaError, QaSession, QueryResponse, RetryPolicy,
    SessionConfig,
};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "doc-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Provider for completions and embeddings: chatgpt, mistral or gemini.
    #[arg(long, env = "DOC_QA_PROVIDER", default_value = "chatgpt")]
    provider: String,

    /// Root directory for persisted index generations.
    #[arg(long, env = "DOC_QA_INDEX_DIR", default_value = ".doc-qa")]
    index_dir: PathBuf,

    /// Corpus name; each corpus gets its own index per provider.
    #[arg(long, env = "DOC_QA_CORPUS", default_value = "default")]
    corpus: String,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct SessionArgs {
    /// Number of chunks retrieved per question.
    #[arg(long, default_value = "10")]
    top_k: usize,

    /// Drop retrieved chunks scoring below this cosine similarity.
    #[arg(long)]
    min_score: Option<f32>,

    /// Embed locally with the trigram embedder instead of the provider.
    #[arg(long, num_args = 0..=1, default_missing_value = "128")]
    local_embeddings: Option<usize>,

    #[arg(long, default_value = "500")]
    chunk_size: usize,

    #[arg(long, default_value = "100")]
    chunk_overlap: usize,

    /// Keep conversation memory when a new document is loaded.
    #[arg(long, default_value_t = false)]
    keep_memory_on_load: bool,
}

impl SessionArgs {
    fn config(&self) -> SessionConfig {
        SessionConfig {
            top_k: self.top_k,
            min_score: self.min_score,
            reset_memory_on_load: !self.keep_memory_on_load,
            local_embeddings: self.local_embeddings,
            chunking: ChunkingConfig {
                chunk_size: self.chunk_size,
                overlap: self.chunk_overlap,
            },
            ..SessionConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Extract, chunk and index one document, replacing the current one.
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Answer one question against the indexed document.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Interactive questions with conversational memory. `/reset` clears
    /// memory, `/pages` lists stored pages, `/quit` exits.
    Chat,
    /// Stream study notes for files or a folder.
    Notes {
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Folder searched recursively for supported documents.
        #[arg(long)]
        folder: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "report")]
        mode: ModeArg,
    },
    /// List page numbers stored for the indexed document.
    Pages,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Report,
    Summary,
}

impl From<ModeArg> for NotesMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Report => NotesMode::Report,
            ModeArg::Summary => NotesMode::Summary,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        provider = %cli.provider,
        started_at = %Utc::now().to_rfc3339(),
        "doc-qa boot"
    );

    match cli.command {
        Command::Ingest { ref file } => {
            let mut session = open_session(&cli)?;
            let report = session.load_document(file).await?;
            if let Some(reason) = &report.degraded {
                warn!(path = %file.display(), %reason, "indexed placeholder text");
            }
            println!(
                "{} chunks from {} ({} pages) indexed at {}",
                report.chunks,
                report.document.document_title,
                report.pages.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Ask { ref question } => {
            let response = match resume_session(&cli).await {
                Ok(mut session) => session.query(question).await,
                Err(error) => QueryResponse::Error {
                    error: error.to_string(),
                },
            };
            println!("{}", serde_json::to_string(&response)?);
        }
        Command::Chat => {
            let mut session = resume_session(&cli).await?;
            let mut lines = BufReader::new(tokio::io::stdin()).lines();

            prompt_marker()?;
            while let Some(line) = lines.next_line().await? {
                match line.trim() {
                    "" => {}
                    "/quit" | "/exit" => break,
                    "/reset" => {
                        session.reset();
                        println!("memory cleared");
                    }
                    "/pages" => println!("stored pages: {:?}", session.page_numbers()),
                    question => match session.query(question).await {
                        QueryResponse::Answer { answer } => println!("{answer}"),
                        QueryResponse::Error { error } => println!("error: {error}"),
                    },
                }
                prompt_marker()?;
            }
        }
        Command::Notes {
            ref files,
            ref folder,
            mode,
        } => {
            let mut paths = files.clone();
            if let Some(folder) = folder {
                paths.extend(discover_documents(folder));
            }
            if paths.is_empty() {
                anyhow::bail!("no documents given; pass --file or --folder");
            }

            let kind = cli.provider.parse::<ProviderKind>()?;
            let handle = kind
                .connect(kind.settings_from_env())
                .map_err(QaError::ProviderSetup)?;
            let generator = NotesGenerator::new(
                handle.completion,
                Arc::new(DocumentExtractor::from_env()),
                NotesConfig::default(),
                RetryPolicy::default(),
            );

            let mut fragments = generator.stream(paths, mode.into());
            let mut stdout = std::io::stdout();
            while let Some(fragment) = fragments.next().await {
                stdout.write_all(fragment.as_bytes())?;
                stdout.flush()?;
            }
            println!();
        }
        Command::Pages => {
            let session = resume_session(&cli).await?;
            println!("stored pages: {:?}", session.page_numbers());
        }
    }

    Ok(())
}

fn open_session(cli: &Cli) -> Result<QaSession, QaError> {
    QaSession::open(
        &cli.index_dir,
        &cli.corpus,
        &cli.provider,
        cli.session.config(),
    )
}

/// Opens the session and loads the persisted generation. A corpus that was
/// never ingested stays idle, so questions report that no document exists.
async fn resume_session(cli: &Cli) -> Result<QaSession, QaError> {
    let mut session = open_session(cli)?;
    match session.resume().await {
        Ok(_) | Err(QaError::Index(IndexError::NotFound(_))) => Ok(session),
        Err(error) => Err(error),
    }
}

fn prompt_marker() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(b"> ")?;
    stdout.flush()
}
