use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tech_digest::{
    archive::DigestArchive,
    classifier::Classifier,
    collector::{FeedCollector, HttpFeedFetcher},
    dedup::Deduplicator,
    index::{IndexMaintainer, VectorIndex},
    llm::GeminiBackend,
    pipeline::DigestPipeline,
    qa::QaEngine,
    registry::FeedRegistry,
    summarizer::Summarizer,
    types::{ChunkConfig, CollectorConfig, DedupConfig, QaConfig, SummarizerConfig},
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tech-digest", about = "Daily AI & Cybersecurity digest with trend Q&A")]
struct Cli {
    /// Data directory holding the digest archive and vector index.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Route articles through the generation backend instead of keyword rules.
    #[arg(long)]
    llm_classifier: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the digest pipeline and archive the result.
    Digest {
        /// Target date (defaults to today, UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Re-embed the whole archive into the vector index.
    Reindex,
    /// Ask a trend question against the archive.
    Ask { question: String },
    /// Print an archived digest.
    Show {
        /// Date to show (defaults to the latest).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let pipeline = build_pipeline(&cli).context("failed to initialize pipeline")?;

    match cli.command {
        Command::Digest { date } => {
            let report = match date {
                Some(date) => pipeline.run_for_date(date).await?,
                None => pipeline.run_today().await?,
            };
            info!(
                "Digest for {} written: {} sections from {} articles",
                report.date, report.sections_written, report.articles_after_dedup
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reindex => {
            let stats = pipeline
                .maintainer()
                .reindex_archive(&pipeline.archive())
                .await?;
            println!(
                "Reindex complete: {} inserted, {} updated, {} unchanged, {} removed",
                stats.inserted, stats.updated, stats.skipped, stats.removed
            );
        }
        Command::Ask { question } => {
            let answer = pipeline.ask(&question).await;
            println!("{}\n", answer.answer_text);
            if !answer.cited_chunk_ids.is_empty() {
                println!("Sources: {}", answer.cited_chunk_ids.join(", "));
            }
        }
        Command::Show { date } => {
            let document = match date {
                Some(date) => pipeline.archive().get(date)?,
                None => pipeline.latest_digest()?,
            };
            match document {
                Some(doc) => print!("{}", tech_digest::archive::render_document(&doc)),
                None => println!("No digest archived yet."),
            }
        }
    }

    Ok(())
}

fn build_pipeline(cli: &Cli) -> anyhow::Result<DigestPipeline> {
    let backend = Arc::new(GeminiBackend::from_env()?);

    let collector_config = CollectorConfig::default();
    let fetcher = Arc::new(HttpFeedFetcher::new(&collector_config));
    let collector = FeedCollector::new(fetcher, collector_config);

    let classifier = if cli.llm_classifier {
        Classifier::with_backend(backend.clone())
    } else {
        Classifier::rules()
    };
    let summarizer = Summarizer::new(backend.clone(), SummarizerConfig::default());

    let archive = Arc::new(DigestArchive::open(cli.data_dir.join("digests"))?);
    let index = Arc::new(VectorIndex::open(cli.data_dir.join("index.json"))?);
    let maintainer = Arc::new(IndexMaintainer::new(
        index.clone(),
        backend.clone(),
        ChunkConfig::default(),
    ));
    let qa = QaEngine::new(index, backend.clone(), backend, QaConfig::default());

    Ok(DigestPipeline::new(
        FeedRegistry::default_sources(),
        collector,
        Deduplicator::new(DedupConfig::default()),
        classifier,
        summarizer,
        archive,
        maintainer,
        qa,
    ))
}
