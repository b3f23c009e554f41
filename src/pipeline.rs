use crate::archive::DigestArchive;
use crate::classifier::Classifier;
use crate::collector::FeedCollector;
use crate::dedup::Deduplicator;
use crate::index::IndexMaintainer;
use crate::qa::QaEngine;
use crate::registry::FeedRegistry;
use crate::summarizer::Summarizer;
use crate::types::{DigestDocument, QueryAnswer, Result, RunReport};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Wires the digest stages together: registry -> collector -> deduplicator
/// -> classifier -> summarizer -> archiver, then triggers an index sync.
/// One logical run per trigger; racing runs for the same date resolve to
/// last-write-wins at the archiver.
pub struct DigestPipeline {
    registry: FeedRegistry,
    collector: FeedCollector,
    deduplicator: Deduplicator,
    classifier: Classifier,
    summarizer: Summarizer,
    archive: Arc<DigestArchive>,
    maintainer: Arc<IndexMaintainer>,
    qa: QaEngine,
}

impl DigestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: FeedRegistry,
        collector: FeedCollector,
        deduplicator: Deduplicator,
        classifier: Classifier,
        summarizer: Summarizer,
        archive: Arc<DigestArchive>,
        maintainer: Arc<IndexMaintainer>,
        qa: QaEngine,
    ) -> Self {
        Self {
            registry,
            collector,
            deduplicator,
            classifier,
            summarizer,
            archive,
            maintainer,
            qa,
        }
    }

    pub async fn run_today(&self) -> Result<RunReport> {
        self.run_for_date(Utc::now().date_naive()).await
    }

    /// Generates and archives the digest for one calendar day. Failures
    /// below the document boundary are absorbed and reported; a failed
    /// archive write fails the run.
    pub async fn run_for_date(&self, date: NaiveDate) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        info!("Digest run {} for {} ({} feeds)", run_id, date, self.registry.len());

        let collected = self.collector.collect(&self.registry).await;
        let articles_collected = collected.articles.len();

        let mut articles = self.deduplicator.dedup(collected.articles);
        // Stable reading order; collection merges through a map and would
        // otherwise reorder buckets between identical runs.
        articles.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let articles_after_dedup = articles.len();

        let buckets = self.classifier.partition(&articles).await;
        let outcome = self.summarizer.summarize(&buckets).await;

        let document = DigestDocument {
            date,
            sections: outcome.sections,
            overview_text: outcome.overview_text,
            created_at: Utc::now(),
        };

        // Fatal from here down: a run must not report success if the
        // document never became durable.
        self.archive.put(&document)?;

        match self.maintainer.sync_document(&document).await {
            Ok(stats) => info!(
                "Run {}: index sync +{} ~{} ={}",
                run_id, stats.inserted, stats.updated, stats.skipped
            ),
            Err(e) => warn!(
                "Run {}: index sync failed, archive is still durable: {}",
                run_id, e
            ),
        }

        let report = RunReport {
            run_id,
            date,
            feeds_fetched: self.registry.len() - collected.failed_feeds.len(),
            failed_feeds: collected.failed_feeds,
            articles_collected,
            articles_after_dedup,
            sections_written: document.sections.len(),
            failed_buckets: outcome.failed_buckets,
        };
        info!(
            "Run {} finished: {} articles -> {} sections ({} failed feeds, {} failed buckets)",
            run_id,
            report.articles_after_dedup,
            report.sections_written,
            report.failed_feeds.len(),
            report.failed_buckets.len()
        );
        Ok(report)
    }

    /// Most recent archived digest, if any.
    pub fn latest_digest(&self) -> Result<Option<DigestDocument>> {
        self.archive.latest()
    }

    /// Answers a trend question from the archive. Never surfaces a raw
    /// backend error.
    pub async fn ask(&self, question: &str) -> QueryAnswer {
        self.qa.ask(question).await
    }

    pub fn archive(&self) -> Arc<DigestArchive> {
        self.archive.clone()
    }

    pub fn maintainer(&self) -> Arc<IndexMaintainer> {
        self.maintainer.clone()
    }
}
