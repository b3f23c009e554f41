pub mod archive;
pub mod classifier;
pub mod collector;
pub mod dedup;
pub mod index;
pub mod llm;
pub mod pipeline;
pub mod qa;
pub mod registry;
pub mod summarizer;
pub mod types;

pub use archive::DigestArchive;
pub use classifier::{Bucket, Classifier};
pub use collector::{FeedCollector, FeedFetch, HttpFeedFetcher, StaticFeedFetcher};
pub use dedup::Deduplicator;
pub use index::{IndexMaintainer, SyncStats, VectorIndex};
pub use llm::{
    EmbeddingBackend, GeminiBackend, GenerationBackend, MockEmbeddingBackend,
    MockGenerationBackend, RetryPolicy,
};
pub use pipeline::DigestPipeline;
pub use qa::{QaEngine, INSUFFICIENT_DATA_ANSWER, UNAVAILABLE_ANSWER};
pub use registry::{FeedRegistry, FeedSource};
pub use summarizer::Summarizer;
pub use types::*;
