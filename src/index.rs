use crate::archive::DigestArchive;
use crate::llm::EmbeddingBackend;
use crate::types::{
    content_hash, Category, ChunkConfig, DigestDocument, DigestError, IndexChunk, Result,
    TopicTag,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A chunk awaiting embedding: everything except the vector.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub chunk_id: String,
    pub text: String,
    pub document_date: NaiveDate,
    pub topic_tag: TopicTag,
    pub category: Category,
    pub content_hash: String,
}

/// Slices a digest document's sections into retrieval units. A section at or
/// under the size limit becomes one chunk; longer sections split at the
/// limit with overlap so context continues across the cut. Chunk ids are a
/// deterministic function of (date, section, offset), so reindexing an
/// unchanged document reproduces the same ids and hashes.
pub fn chunk_document(doc: &DigestDocument, config: &ChunkConfig) -> Vec<ChunkSpec> {
    let mut specs = Vec::new();

    for section in &doc.sections {
        let chars: Vec<char> = section.summary_text.chars().collect();
        if chars.is_empty() {
            continue;
        }

        let step = config.max_chunk_chars.saturating_sub(config.overlap_chars).max(1);
        let mut offset = 0usize;
        loop {
            let end = (offset + config.max_chunk_chars).min(chars.len());
            let text: String = chars[offset..end].iter().collect();
            specs.push(ChunkSpec {
                chunk_id: format!(
                    "{}:{}:{}:{}",
                    doc.date, section.topic_tag, section.category, offset
                ),
                content_hash: content_hash(&text),
                text,
                document_date: doc.date,
                topic_tag: section.topic_tag,
                category: section.category,
            });

            if end == chars.len() {
                break;
            }
            offset += step;
        }
    }

    specs
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    chunks: Vec<IndexChunk>,
}

/// Persistent vector index over digest chunks. Chunks live in memory behind
/// an async lock (upserts are atomic per chunk; a concurrent search never
/// observes a half-written entry) and are flushed to a JSON document with a
/// temp-then-rename write.
pub struct VectorIndex {
    path: PathBuf,
    chunks: RwLock<HashMap<String, IndexChunk>>,
}

impl VectorIndex {
    /// Opens the index at `path`, loading existing chunks when present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut chunks = HashMap::new();

        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let file: IndexFile = serde_json::from_str(&text)?;
            for chunk in file.chunks {
                chunks.insert(chunk.chunk_id.clone(), chunk);
            }
            info!("Loaded vector index: {} chunks from {}", chunks.len(), path.display());
        }

        Ok(Self {
            path,
            chunks: RwLock::new(chunks),
        })
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }

    pub async fn stored_hash(&self, chunk_id: &str) -> Option<String> {
        self.chunks
            .read()
            .await
            .get(chunk_id)
            .map(|c| c.content_hash.clone())
    }

    pub async fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.read().await.contains_key(chunk_id)
    }

    pub async fn upsert(&self, chunk: IndexChunk) {
        self.chunks
            .write()
            .await
            .insert(chunk.chunk_id.clone(), chunk);
    }

    /// Removes chunks for `date` whose ids are not in `live_ids`; keeps the
    /// index consistent with a document that shrank on regeneration.
    pub async fn remove_stale(&self, date: NaiveDate, live_ids: &[String]) -> usize {
        let mut chunks = self.chunks.write().await;
        let before = chunks.len();
        chunks.retain(|id, chunk| {
            chunk.document_date != date || live_ids.iter().any(|live| live == id)
        });
        before - chunks.len()
    }

    /// Top-k chunks by descending cosine similarity to the query vector.
    pub async fn search(&self, query: &[f32], k: usize) -> Vec<IndexChunk> {
        let chunks = self.chunks.read().await;
        let mut scored: Vec<(f32, &IndexChunk)> = chunks
            .values()
            .map(|chunk| (cosine_similarity(query, &chunk.embedding), chunk))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }

    /// Flushes the in-memory index to disk atomically.
    pub async fn persist(&self) -> Result<()> {
        let chunks = self.chunks.read().await;
        let file = IndexFile {
            chunks: chunks.values().cloned().collect(),
        };
        let rendered = serde_json::to_string(&file)?;
        drop(chunks);

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Persisted vector index to {}", self.path.display());
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Net effect of one index synchronization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub removed: usize,
}

impl SyncStats {
    fn absorb(&mut self, other: SyncStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.removed += other.removed;
    }
}

/// Keeps the vector index in step with the archive. Chunk identity plus
/// content hash make synchronization idempotent: an unchanged document is a
/// no-op after the first pass, a changed section re-embeds only its chunks.
pub struct IndexMaintainer {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingBackend>,
    config: ChunkConfig,
}

impl IndexMaintainer {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingBackend>,
        config: ChunkConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    pub fn index(&self) -> Arc<VectorIndex> {
        self.index.clone()
    }

    /// Synchronizes one document into the index and persists the result.
    pub async fn sync_document(&self, doc: &DigestDocument) -> Result<SyncStats> {
        let specs = chunk_document(doc, &self.config);
        let live_ids: Vec<String> = specs.iter().map(|s| s.chunk_id.clone()).collect();

        let mut stats = SyncStats::default();
        let mut pending: Vec<ChunkSpec> = Vec::new();

        for spec in specs {
            match self.index.stored_hash(&spec.chunk_id).await {
                Some(stored) if stored == spec.content_hash => stats.skipped += 1,
                Some(_) => {
                    stats.updated += 1;
                    pending.push(spec);
                }
                None => {
                    stats.inserted += 1;
                    pending.push(spec);
                }
            }
        }

        if !pending.is_empty() {
            let texts: Vec<String> = pending.iter().map(|s| s.text.clone()).collect();
            let embeddings = self.embed_resilient(&texts).await;

            let mut applied_inserted = 0usize;
            let mut applied_updated = 0usize;
            for (spec, embedding) in pending.into_iter().zip(embeddings) {
                let Some(embedding) = embedding else {
                    warn!("Skipping chunk {} after embedding failure", spec.chunk_id);
                    continue;
                };
                if self.index.contains(&spec.chunk_id).await {
                    applied_updated += 1;
                } else {
                    applied_inserted += 1;
                }
                self.index
                    .upsert(IndexChunk {
                        chunk_id: spec.chunk_id,
                        embedding,
                        text: spec.text,
                        document_date: spec.document_date,
                        topic_tag: spec.topic_tag,
                        category: spec.category,
                        content_hash: spec.content_hash,
                    })
                    .await;
            }
            stats.inserted = applied_inserted;
            stats.updated = applied_updated;
        }

        stats.removed = self.index.remove_stale(doc.date, &live_ids).await;
        self.index.persist().await?;

        info!(
            "Index sync for {}: +{} ~{} ={} -{}",
            doc.date, stats.inserted, stats.updated, stats.skipped, stats.removed
        );
        Ok(stats)
    }

    /// Walks the whole archive. Cheap after the first run: unchanged
    /// documents produce zero embedding calls.
    pub async fn reindex_archive(&self, archive: &DigestArchive) -> Result<SyncStats> {
        let mut total = SyncStats::default();
        for doc in archive.list(None, None)? {
            total.absorb(self.sync_document(&doc?).await?);
        }
        Ok(total)
    }

    /// Batch embedding with per-chunk degradation: if the batch call fails
    /// after its retries, fall back to embedding one at a time and skip the
    /// chunks that still fail.
    async fn embed_resilient(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        match self.embedder.embed_batch(texts).await {
            Ok(embeddings) if embeddings.len() == texts.len() => {
                embeddings.into_iter().map(Some).collect()
            }
            Ok(_) | Err(_) => {
                warn!("Batch embedding failed, retrying chunks individually");
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    match self.embedder.embed(text).await {
                        Ok(embedding) => out.push(Some(embedding)),
                        Err(e) => {
                            warn!("Embedding failed, chunk skipped: {}", e);
                            out.push(None);
                        }
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEmbeddingBackend;
    use crate::types::DigestSection;
    use chrono::Utc;
    use tempfile::TempDir;

    fn doc_with_section(date: &str, text: &str) -> DigestDocument {
        DigestDocument {
            date: date.parse().unwrap(),
            sections: vec![DigestSection {
                topic_tag: TopicTag::Cyber,
                category: Category::Ransomware,
                summary_text: text.to_string(),
                source_ids: vec!["aaa".to_string()],
                fallback: false,
            }],
            overview_text: "overview".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn short_section_becomes_one_chunk() {
        let doc = doc_with_section("2024-01-01", "Ransomware wave continues.");
        let specs = chunk_document(&doc, &ChunkConfig::default());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].chunk_id, "2024-01-01:Cyber:Ransomware:0");
    }

    #[test]
    fn long_section_splits_with_overlap() {
        let text = "x".repeat(2500);
        let doc = doc_with_section("2024-01-01", &text);
        let config = ChunkConfig {
            max_chunk_chars: 1000,
            overlap_chars: 200,
        };
        let specs = chunk_document(&doc, &config);

        assert!(specs.len() > 2);
        // Consecutive chunks share the configured overlap.
        assert_eq!(specs[0].text.len(), 1000);
        assert!(specs[1].chunk_id.ends_with(":800"));
    }

    #[test]
    fn chunk_ids_and_hashes_are_deterministic() {
        let doc = doc_with_section("2024-01-01", "Same content every run.");
        let a = chunk_document(&doc, &ChunkConfig::default());
        let b = chunk_document(&doc, &ChunkConfig::default());
        assert_eq!(a[0].chunk_id, b[0].chunk_id);
        assert_eq!(a[0].content_hash, b[0].content_hash);
    }

    #[tokio::test]
    async fn reindexing_unchanged_document_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(VectorIndex::open(tmp.path().join("index.json")).unwrap());
        let embedder = Arc::new(MockEmbeddingBackend::new());
        let maintainer = IndexMaintainer::new(index.clone(), embedder.clone(), ChunkConfig::default());

        let doc = doc_with_section("2024-01-01", "Ransomware wave continues.");

        let first = maintainer.sync_document(&doc).await.unwrap();
        assert_eq!(first.inserted, 1);

        let embed_calls_after_first = embedder.call_count();
        let second = maintainer.sync_document(&doc).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 1);
        // No re-embedding of unchanged content.
        assert_eq!(embedder.call_count(), embed_calls_after_first);
    }

    #[tokio::test]
    async fn changed_content_upserts_in_place() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(VectorIndex::open(tmp.path().join("index.json")).unwrap());
        let maintainer = IndexMaintainer::new(
            index.clone(),
            Arc::new(MockEmbeddingBackend::new()),
            ChunkConfig::default(),
        );

        let doc = doc_with_section("2024-01-01", "First version.");
        maintainer.sync_document(&doc).await.unwrap();

        let changed = doc_with_section("2024-01-01", "Second version.");
        let stats = maintainer.sync_document(&changed).await.unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");

        {
            let index = Arc::new(VectorIndex::open(path.clone()).unwrap());
            let maintainer = IndexMaintainer::new(
                index,
                Arc::new(MockEmbeddingBackend::new()),
                ChunkConfig::default(),
            );
            let doc = doc_with_section("2024-01-01", "Persisted content.");
            maintainer.sync_document(&doc).await.unwrap();
        }

        let reopened = VectorIndex::open(path).unwrap();
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let tmp = TempDir::new().unwrap();
        let index = VectorIndex::open(tmp.path().join("index.json")).unwrap();
        let embedder = MockEmbeddingBackend::new();

        for (id, text) in [("a", "ransomware attack hospital"), ("b", "gpu datacenter buildout")] {
            let embedding = embedder.embed(text).await.unwrap();
            index
                .upsert(IndexChunk {
                    chunk_id: id.to_string(),
                    embedding,
                    text: text.to_string(),
                    document_date: "2024-01-01".parse().unwrap(),
                    topic_tag: TopicTag::Cyber,
                    category: Category::Ransomware,
                    content_hash: content_hash(text),
                })
                .await;
        }

        let query = embedder.embed("ransomware attack hospital").await.unwrap();
        let results = index.search(&query, 2).await;
        assert_eq!(results[0].chunk_id, "a");
    }
}
