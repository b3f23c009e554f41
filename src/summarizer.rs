use crate::classifier::Bucket;
use crate::llm::GenerationBackend;
use crate::types::{DigestSection, SummarizerConfig};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of summarizing one day's buckets.
#[derive(Debug)]
pub struct SummaryOutcome {
    pub sections: Vec<DigestSection>,
    pub overview_text: String,
    pub failed_buckets: Vec<String>,
}

/// Produces per-bucket natural-language summaries and a daily overview via
/// the generation backend. Buckets are isolated failure domains: a failed
/// generation call degrades that bucket to a title listing and the rest of
/// the digest still completes.
pub struct Summarizer {
    backend: Arc<dyn GenerationBackend>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: SummarizerConfig) -> Self {
        Self { backend, config }
    }

    pub async fn summarize(&self, buckets: &[Bucket]) -> SummaryOutcome {
        info!(
            "Summarizing {} buckets (concurrency {})",
            buckets.len(),
            self.config.max_concurrent_calls
        );

        let mut indexed: Vec<(usize, DigestSection, Option<String>)> =
            stream::iter(buckets.iter().enumerate())
                .map(|(idx, bucket)| async move {
                    let (section, failure) = self.summarize_bucket(bucket).await;
                    (idx, section, failure)
                })
                .buffer_unordered(self.config.max_concurrent_calls)
                .collect()
                .await;

        // Restore taxonomy order regardless of completion order.
        indexed.sort_by_key(|(idx, _, _)| *idx);

        let mut sections = Vec::with_capacity(indexed.len());
        let mut failed_buckets = Vec::new();
        for (_, section, failure) in indexed {
            if let Some(bucket) = failure {
                failed_buckets.push(bucket);
            }
            sections.push(section);
        }

        let overview_text = self.synthesize_overview(&sections).await;

        SummaryOutcome {
            sections,
            overview_text,
            failed_buckets,
        }
    }

    async fn summarize_bucket(&self, bucket: &Bucket) -> (DigestSection, Option<String>) {
        let prompt = bucket_prompt(bucket);
        let source_ids: Vec<String> = bucket.articles.iter().map(|a| a.id.clone()).collect();

        match self.backend.generate(&prompt).await {
            Ok(text) => (
                DigestSection {
                    topic_tag: bucket.topic_tag,
                    category: bucket.category,
                    summary_text: text.trim().to_string(),
                    source_ids,
                    fallback: false,
                },
                None,
            ),
            Err(e) => {
                warn!("Summarization failed for bucket {}: {}", bucket.label(), e);
                (
                    DigestSection {
                        topic_tag: bucket.topic_tag,
                        category: bucket.category,
                        summary_text: fallback_summary(bucket),
                        source_ids,
                        fallback: true,
                    },
                    Some(bucket.label()),
                )
            }
        }
    }

    async fn synthesize_overview(&self, sections: &[DigestSection]) -> String {
        if sections.is_empty() {
            return "No articles were collected today.".to_string();
        }

        let mut prompt = String::from(
            "You are writing the opening synthesis of a daily technology digest \
             covering AI/LLM/Agentic and Cybersecurity news. Below are today's \
             category summaries. Write one concise paragraph naming the most \
             important cross-cutting trends of the day. Use only the material \
             supplied.\n\n",
        );
        for section in sections {
            prompt.push_str(&format!(
                "[{}/{}]\n{}\n\n",
                section.topic_tag, section.category, section.summary_text
            ));
        }

        match self.backend.generate(&prompt).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Overview synthesis failed, degrading to section listing: {}", e);
                let labels: Vec<String> = sections
                    .iter()
                    .map(|s| format!("{}/{} ({} stories)", s.topic_tag, s.category, s.source_ids.len()))
                    .collect();
                format!("Sections covered today: {}.", labels.join(", "))
            }
        }
    }
}

fn bucket_prompt(bucket: &Bucket) -> String {
    let mut prompt = format!(
        "You are writing the \"{}\" section of a daily {} news digest for a \
         technical executive audience. Summarize the stories below into one \
         concise paragraph followed by a short bullet per story. Cover every \
         story listed; do not invent information beyond the supplied text.\n\n",
        bucket.category,
        match bucket.topic_tag {
            crate::types::TopicTag::Ai => "AI / LLM / Agentic",
            crate::types::TopicTag::Cyber => "Cybersecurity",
        }
    );

    for article in &bucket.articles {
        prompt.push_str(&format!("- [{}] {}\n", article.id, article.title));
        if let Some(summary) = &article.raw_summary {
            prompt.push_str(&format!("  {}\n", summary));
        }
    }
    prompt
}

/// Degraded summary used when the backend errors for a bucket: a plain
/// listing of the raw titles so the section still carries its stories.
fn fallback_summary(bucket: &Bucket) -> String {
    let mut text = format!(
        "Summary generation was unavailable for this section. Today's {} stories:\n",
        bucket.category
    );
    for article in &bucket.articles {
        text.push_str(&format!("- {}\n", article.title));
    }
    text.trim_end().to_string()
}
