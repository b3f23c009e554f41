use crate::index::VectorIndex;
use crate::llm::{EmbeddingBackend, GenerationBackend};
use crate::types::{QaConfig, QueryAnswer};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Returned without any backend call when retrieval finds nothing to ground
/// an answer in.
pub const INSUFFICIENT_DATA_ANSWER: &str =
    "The digest archive does not yet contain enough material related to this question.";

/// Returned when a backend keeps failing after retries. Raw backend errors
/// never reach the asker.
pub const UNAVAILABLE_ANSWER: &str =
    "The answer service is temporarily unavailable. Please try again shortly.";

/// Answers free-form trend questions from the archived digests: embed the
/// question, retrieve the closest chunks, and synthesize an answer grounded
/// only in them. Stateless per query; safe to run concurrently with digest
/// generation against a possibly slightly stale index.
pub struct QaEngine {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingBackend>,
    generator: Arc<dyn GenerationBackend>,
    config: QaConfig,
}

impl QaEngine {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingBackend>,
        generator: Arc<dyn GenerationBackend>,
        config: QaConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            config,
        }
    }

    pub async fn ask(&self, question: &str) -> QueryAnswer {
        info!("QA query: {}", question);

        let query_vector = match self.embedder.embed(question).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Question embedding failed: {}", e);
                return answer(question, UNAVAILABLE_ANSWER, Vec::new());
            }
        };

        let chunks = self.index.search(&query_vector, self.config.top_k).await;
        if chunks.is_empty() {
            info!("No chunks retrieved, returning insufficient-data answer");
            return answer(question, INSUFFICIENT_DATA_ANSWER, Vec::new());
        }

        let mut prompt = String::from(
            "You are an analyst answering a question about AI and Cybersecurity \
             news trends. The context below consists of excerpts from archived \
             daily digests, each labeled with its date and category. Answer \
             using only the supplied context, cite the dates you draw on, and \
             say plainly when the context is insufficient to answer.\n\n",
        );
        prompt.push_str(&format!("Question:\n{}\n\nContext:\n", question));
        for (i, chunk) in chunks.iter().enumerate() {
            prompt.push_str(&format!(
                "[{}] ({}, {}/{}) {}\n\n",
                i + 1,
                chunk.document_date,
                chunk.topic_tag,
                chunk.category,
                chunk.text
            ));
        }

        match self.generator.generate(&prompt).await {
            Ok(text) => {
                let cited = chunks.iter().map(|c| c.chunk_id.clone()).collect();
                answer(question, text.trim(), cited)
            }
            Err(e) => {
                warn!("Answer synthesis failed: {}", e);
                answer(question, UNAVAILABLE_ANSWER, Vec::new())
            }
        }
    }
}

fn answer(question: &str, text: &str, cited_chunk_ids: Vec<String>) -> QueryAnswer {
    QueryAnswer {
        question: question.to_string(),
        answer_text: text.to_string(),
        cited_chunk_ids,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockEmbeddingBackend, MockGenerationBackend};
    use crate::types::{content_hash, Category, IndexChunk, TopicTag};
    use tempfile::TempDir;

    async fn seeded_index(tmp: &TempDir, entries: &[(&str, &str, &str)]) -> Arc<VectorIndex> {
        let index = Arc::new(VectorIndex::open(tmp.path().join("index.json")).unwrap());
        let embedder = MockEmbeddingBackend::new();
        for (id, date, text) in entries {
            index
                .upsert(IndexChunk {
                    chunk_id: id.to_string(),
                    embedding: embedder.embed(text).await.unwrap(),
                    text: text.to_string(),
                    document_date: date.parse().unwrap(),
                    topic_tag: TopicTag::Cyber,
                    category: Category::Ransomware,
                    content_hash: content_hash(text),
                })
                .await;
        }
        index
    }

    #[tokio::test]
    async fn empty_index_short_circuits_without_generation_call() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(VectorIndex::open(tmp.path().join("index.json")).unwrap());
        let generator = Arc::new(MockGenerationBackend::new("qa"));
        let engine = QaEngine::new(
            index,
            Arc::new(MockEmbeddingBackend::new()),
            generator.clone(),
            QaConfig::default(),
        );

        let result = engine.ask("anything at all").await;
        assert_eq!(result.answer_text, INSUFFICIENT_DATA_ANSWER);
        assert!(result.cited_chunk_ids.is_empty());
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn citations_reference_indexed_chunks() {
        let tmp = TempDir::new().unwrap();
        let index = seeded_index(
            &tmp,
            &[
                ("2024-01-01:Cyber:Ransomware:0", "2024-01-01", "ransomware wave hit logistics"),
                ("2024-01-02:Cyber:Ransomware:0", "2024-01-02", "ransomware extortion grows"),
            ],
        )
        .await;
        let engine = QaEngine::new(
            index.clone(),
            Arc::new(MockEmbeddingBackend::new()),
            Arc::new(MockGenerationBackend::new("qa")),
            QaConfig::default(),
        );

        let result = engine.ask("ransomware trend").await;
        assert!(!result.cited_chunk_ids.is_empty());
        for id in &result.cited_chunk_ids {
            assert!(index.contains(id).await);
        }
    }

    #[tokio::test]
    async fn retrieval_spans_multiple_archive_dates() {
        let tmp = TempDir::new().unwrap();
        let index = seeded_index(
            &tmp,
            &[
                ("2024-01-01:Cyber:Ransomware:0", "2024-01-01", "ransomware attacks on hospitals"),
                ("2024-01-02:Cyber:Ransomware:0", "2024-01-02", "ransomware group expands targets"),
            ],
        )
        .await;
        let generator = Arc::new(MockGenerationBackend::new("qa"));
        let engine = QaEngine::new(
            index,
            Arc::new(MockEmbeddingBackend::new()),
            generator.clone(),
            QaConfig::default(),
        );

        let result = engine.ask("ransomware trend").await;
        let dates: std::collections::HashSet<&str> = result
            .cited_chunk_ids
            .iter()
            .map(|id| id.split(':').next().unwrap())
            .collect();
        assert!(dates.contains("2024-01-01"));
        assert!(dates.contains("2024-01-02"));

        // The grounding prompt labels chunks with their dates.
        let prompt = generator.recorded_prompts().pop().unwrap();
        assert!(prompt.contains("2024-01-01"));
        assert!(prompt.contains("2024-01-02"));
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_unavailable_answer() {
        let tmp = TempDir::new().unwrap();
        let index = seeded_index(
            &tmp,
            &[("2024-01-01:Cyber:Ransomware:0", "2024-01-01", "ransomware news")],
        )
        .await;
        let engine = QaEngine::new(
            index,
            Arc::new(MockEmbeddingBackend::new()),
            Arc::new(MockGenerationBackend::failing("qa")),
            QaConfig::default(),
        );

        let result = engine.ask("ransomware trend").await;
        assert_eq!(result.answer_text, UNAVAILABLE_ANSWER);
        assert!(result.cited_chunk_ids.is_empty());
    }
}
