use crate::types::{DigestError, Result, RetryConfig};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// External language-generation capability: `generate(prompt) -> text`.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn backend_name(&self) -> String;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// External vector-embedding capability: `embed(text) -> vector`.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn backend_name(&self) -> String;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embedding to amortize backend round-trips. The default just
    /// loops; real backends should override with a single call.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Bounded-attempt retry with exponential backoff, shared by all backend
/// callers. Non-2xx and timeouts are recoverable up to the attempt limit,
/// then the last error propagates for the caller to degrade on.
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.initial_delay_ms),
            initial_interval: Duration::from_millis(self.config.initial_delay_ms),
            max_interval: Duration::from_millis(self.config.max_delay_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = None;
        for attempt in 1..=self.config.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{}: attempt {}/{} failed: {}", label, attempt, self.config.max_attempts, e);
                    last_error = Some(e);
                    if attempt < self.config.max_attempts {
                        if let Some(delay) = backoff.next_backoff() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DigestError::Backend(format!("{}: exhausted retries", label))))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GENERATION_MODEL: &str = "gemini-2.5-pro";
const EMBEDDING_MODEL: &str = "text-embedding-004";

/// Google Generative Language API client covering both the generation and
/// embedding capabilities.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    generation_model: String,
    embedding_model: String,
    retry: RetryPolicy,
}

impl GeminiBackend {
    pub fn new(api_key: String, retry_config: RetryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            generation_model: GENERATION_MODEL.to_string(),
            embedding_model: EMBEDDING_MODEL.to_string(),
            retry: RetryPolicy::new(retry_config),
        }
    }

    /// Reads the API key from `GOOGLE_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| DigestError::Backend("GOOGLE_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, RetryConfig::default()))
    }

    pub fn with_models(mut self, generation_model: &str, embedding_model: &str) -> Self {
        self.generation_model = generation_model.to_string();
        self.embedding_model = embedding_model.to_string();
        self
    }

    async fn post_json(&self, url: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DigestError::Backend(format!(
                "HTTP {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    fn backend_name(&self) -> String {
        format!("gemini ({})", self.generation_model)
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            GEMINI_API_BASE, self.generation_model
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.4 }
        });

        debug!("Generation call ({} prompt chars)", prompt.len());
        let value = self
            .retry
            .run("generate", || self.post_json(&url, body.clone()))
            .await?;

        let text = value["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(DigestError::Backend(
                "generation response contained no text".to_string(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl EmbeddingBackend for GeminiBackend {
    fn backend_name(&self) -> String {
        format!("gemini ({})", self.embedding_model)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{}/models/{}:embedContent",
            GEMINI_API_BASE, self.embedding_model
        );
        let body = json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] }
        });

        let value = self
            .retry
            .run("embed", || self.post_json(&url, body.clone()))
            .await?;

        parse_embedding(&value["embedding"])
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/models/{}:batchEmbedContents",
            GEMINI_API_BASE, self.embedding_model
        );
        let requests: Vec<Value> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.embedding_model),
                    "content": { "parts": [{ "text": text }] }
                })
            })
            .collect();
        let body = json!({ "requests": requests });

        info!("Batch embedding {} texts", texts.len());
        let value = self
            .retry
            .run("embed_batch", || self.post_json(&url, body.clone()))
            .await?;

        let embeddings = value["embeddings"]
            .as_array()
            .ok_or_else(|| DigestError::Backend("missing embeddings array".to_string()))?;
        if embeddings.len() != texts.len() {
            return Err(DigestError::Backend(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        embeddings.iter().map(parse_embedding).collect()
    }
}

fn parse_embedding(value: &Value) -> Result<Vec<f32>> {
    value["values"]
        .as_array()
        .map(|vals| {
            vals.iter()
                .filter_map(|v| v.as_f64())
                .map(|v| v as f32)
                .collect()
        })
        .filter(|v: &Vec<f32>| !v.is_empty())
        .ok_or_else(|| DigestError::Backend("embedding response contained no values".to_string()))
}

/// Mock generation backend for development and tests. Records prompts and
/// either echoes a canned summary or fails every call.
pub struct MockGenerationBackend {
    name: String,
    fail_always: bool,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockGenerationBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_always: false,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: impl Into<String>) -> Self {
        let mut backend = Self::new(name);
        backend.fail_always = true;
        backend
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for MockGenerationBackend {
    fn backend_name(&self) -> String {
        format!("mock-generation ({})", self.name)
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        if self.fail_always {
            return Err(DigestError::Backend("mock backend configured to fail".to_string()));
        }

        let first_line = prompt.lines().next().unwrap_or("").trim();
        Ok(format!(
            "Mock synthesis covering the supplied material. Context lead: {}",
            first_line.chars().take(120).collect::<String>()
        ))
    }
}

/// Deterministic mock embedding: a small vector derived from token hashes,
/// so identical text always embeds identically.
pub struct MockEmbeddingBackend {
    dims: usize,
    calls: AtomicUsize,
}

impl MockEmbeddingBackend {
    pub fn new() -> Self {
        Self {
            dims: 16,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockEmbeddingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    fn backend_name(&self) -> String {
        "mock-embedding".to_string()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut vector = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in token.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            vector[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}
