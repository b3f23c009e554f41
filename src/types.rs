use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Top-level topic assigned to every article, category and chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicTag {
    Ai,
    Cyber,
}

impl TopicTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicTag::Ai => "Ai",
            TopicTag::Cyber => "Cyber",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Ai" => Some(TopicTag::Ai),
            "Cyber" => Some(TopicTag::Cyber),
            _ => None,
        }
    }
}

impl std::fmt::Display for TopicTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed-ish category taxonomy, scoped per topic. Stable across runs so
/// archived digests stay comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    // AI / LLM / Agentic
    Infra,
    Apps,
    Policy,
    Research,
    // Cybersecurity
    Apt,
    Ransomware,
    ZeroDay,
    Privacy,
    Threats,
}

impl Category {
    pub fn topic(&self) -> TopicTag {
        match self {
            Category::Infra | Category::Apps | Category::Policy | Category::Research => TopicTag::Ai,
            Category::Apt
            | Category::Ransomware
            | Category::ZeroDay
            | Category::Privacy
            | Category::Threats => TopicTag::Cyber,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Infra => "Infra",
            Category::Apps => "Apps",
            Category::Policy => "Policy",
            Category::Research => "Research",
            Category::Apt => "APT",
            Category::Ransomware => "Ransomware",
            Category::ZeroDay => "Zero-day",
            Category::Privacy => "Privacy",
            Category::Threats => "Threats",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Infra" => Some(Category::Infra),
            "Apps" => Some(Category::Apps),
            "Policy" => Some(Category::Policy),
            "Research" => Some(Category::Research),
            "APT" => Some(Category::Apt),
            "Ransomware" => Some(Category::Ransomware),
            "Zero-day" => Some(Category::ZeroDay),
            "Privacy" => Some(Category::Privacy),
            "Threats" => Some(Category::Threats),
            _ => None,
        }
    }

    /// All categories belonging to a topic, in the order their sections
    /// appear in a digest.
    pub fn for_topic(topic: TopicTag) -> &'static [Category] {
        match topic {
            TopicTag::Ai => &[
                Category::Infra,
                Category::Apps,
                Category::Policy,
                Category::Research,
            ],
            TopicTag::Cyber => &[
                Category::Apt,
                Category::Ransomware,
                Category::ZeroDay,
                Category::Privacy,
                Category::Threats,
            ],
        }
    }

    /// Bucket used when no classification rule matches.
    pub fn default_for(topic: TopicTag) -> Category {
        match topic {
            TopicTag::Ai => Category::Research,
            TopicTag::Cyber => Category::Threats,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized news item pulled from a feed. Immutable once fetched;
/// identity is the canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub url: String,
    pub canonical_url: String,
    pub source_feeds: Vec<String>,
    pub topic_tag: TopicTag,
    pub published_at: DateTime<Utc>,
    pub raw_summary: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Article {
    /// Stable id derived from canonical URL + title. Two fetches of the same
    /// story always hash to the same id.
    pub fn compute_id(canonical_url: &str, title: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_url.as_bytes());
        hasher.update(b"\n");
        hasher.update(title.as_bytes());
        hex_prefix(&hasher.finalize(), 16)
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// Content hash used for chunk-level change detection.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_prefix(&hasher.finalize(), 32)
}

/// One categorized block of a daily digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSection {
    pub topic_tag: TopicTag,
    pub category: Category,
    pub summary_text: String,
    pub source_ids: Vec<String>,
    /// True when the generation backend failed and the summary is a raw
    /// title listing instead of synthesized prose.
    pub fallback: bool,
}

/// The archival document for one calendar day. One per date; regenerating a
/// date replaces the previous document wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestDocument {
    pub date: NaiveDate,
    pub sections: Vec<DigestSection>,
    pub overview_text: String,
    pub created_at: DateTime<Utc>,
}

impl DigestDocument {
    /// All article ids covered by any section, deduplicated, sorted.
    pub fn covered_article_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sections
            .iter()
            .flat_map(|s| s.source_ids.iter().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// A retrieval unit sliced from an archived digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexChunk {
    pub chunk_id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub document_date: NaiveDate,
    pub topic_tag: TopicTag,
    pub category: Category,
    pub content_hash: String,
}

/// Answer to a free-form trend question, with citations back into the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub question: String,
    pub answer_text: String,
    pub cited_chunk_ids: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Outcome of one digest-generation run, for logging and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub feeds_fetched: usize,
    pub failed_feeds: Vec<String>,
    pub articles_collected: usize,
    pub articles_after_dedup: usize,
    pub sections_written: usize,
    pub failed_buckets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_concurrent_fetches: usize,
    pub items_per_feed: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            user_agent: "tech-digest/0.1".to_string(),
            timeout_seconds: 30,
            max_concurrent_fetches: 8,
            items_per_feed: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Token-Jaccard similarity above which two titles count as the same
    /// story. A heuristic, not a guarantee.
    pub title_similarity_threshold: f64,
    /// Near-identical titles only merge when published within this window.
    pub time_window_hours: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_similarity_threshold: 0.85,
            time_window_hours: 24,
        }
    }
}

/// How articles are routed into categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierMode {
    /// Deterministic keyword routing.
    Rules,
    /// Ask the generation backend; falls back to rules on error.
    Backend,
}

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub max_concurrent_calls: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub max_chunk_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1200,
            overlap_chars: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QaConfig {
    pub top_k: usize,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("feed parse error: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("classification error: {0}")]
    Classification(String),

    #[error("summarization failed for bucket {bucket}: {message}")]
    Summarization { bucket: String, message: String },

    #[error("archive write failed: {0}")]
    ArchiveWrite(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DigestError>;
