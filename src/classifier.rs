use crate::llm::GenerationBackend;
use crate::types::{Article, Category, ClassifierMode, TopicTag};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One (topic, category) group of articles awaiting summarization.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub topic_tag: TopicTag,
    pub category: Category,
    pub articles: Vec<Article>,
}

impl Bucket {
    pub fn label(&self) -> String {
        format!("{}/{}", self.topic_tag, self.category)
    }
}

/// Routes articles into the category taxonomy. Rule-based keyword routing is
/// the fast, deterministic path; the backend-delegated variant asks the
/// generation backend and falls back to rules whenever that fails, so
/// routing is always total.
pub struct Classifier {
    mode: ClassifierMode,
    backend: Option<Arc<dyn GenerationBackend>>,
}

impl Classifier {
    pub fn rules() -> Self {
        Self {
            mode: ClassifierMode::Rules,
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            mode: ClassifierMode::Backend,
            backend: Some(backend),
        }
    }

    pub async fn classify(&self, article: &Article) -> Category {
        match self.mode {
            ClassifierMode::Rules => rule_category(article),
            ClassifierMode::Backend => match self.classify_via_backend(article).await {
                Some(category) => category,
                None => {
                    debug!(
                        "Backend classification unusable for {}, using rules",
                        article.id
                    );
                    rule_category(article)
                }
            },
        }
    }

    /// Partitions articles into buckets, ordered by the stable taxonomy
    /// order. Every article lands in exactly one bucket; empty buckets are
    /// omitted.
    pub async fn partition(&self, articles: &[Article]) -> Vec<Bucket> {
        let mut grouped: HashMap<(TopicTag, Category), Vec<Article>> = HashMap::new();
        for article in articles {
            let category = self.classify(article).await;
            grouped
                .entry((article.topic_tag, category))
                .or_default()
                .push(article.clone());
        }

        let mut buckets = Vec::new();
        for topic in [TopicTag::Ai, TopicTag::Cyber] {
            for &category in Category::for_topic(topic) {
                if let Some(articles) = grouped.remove(&(topic, category)) {
                    buckets.push(Bucket {
                        topic_tag: topic,
                        category,
                        articles,
                    });
                }
            }
        }

        info!("Partitioned {} articles into {} buckets", articles.len(), buckets.len());
        buckets
    }

    async fn classify_via_backend(&self, article: &Article) -> Option<Category> {
        let backend = self.backend.as_ref()?;
        let options: Vec<&str> = Category::for_topic(article.topic_tag)
            .iter()
            .map(|c| c.as_str())
            .collect();

        let prompt = format!(
            "Classify this news headline into exactly one of the following categories: {}.\n\
             Respond with the category name only, nothing else.\n\nHeadline: {}",
            options.join(", "),
            article.title
        );

        match backend.generate(&prompt).await {
            Ok(response) => {
                let answer = response.trim();
                let category = Category::parse(answer).or_else(|| {
                    // Tolerate a chatty backend: accept the first category
                    // name appearing anywhere in the response.
                    Category::for_topic(article.topic_tag)
                        .iter()
                        .find(|c| answer.contains(c.as_str()))
                        .copied()
                })?;
                (category.topic() == article.topic_tag).then_some(category)
            }
            Err(e) => {
                warn!("Backend classification failed for {}: {}", article.id, e);
                None
            }
        }
    }
}

/// Deterministic keyword routing. Checks the more specific categories first
/// and falls through to the topic's default bucket.
pub fn rule_category(article: &Article) -> Category {
    let text = format!(
        "{} {}",
        article.title,
        article.raw_summary.as_deref().unwrap_or("")
    )
    .to_lowercase();

    let table: &[(Category, &[&str])] = match article.topic_tag {
        TopicTag::Ai => &[
            (
                Category::Policy,
                &[
                    "regulation", "policy", "lawsuit", "copyright", "governance", "ethics",
                    "ai act", "executive order", "ban",
                ],
            ),
            (
                Category::Infra,
                &[
                    "gpu", "chip", "data center", "datacenter", "inference", "compute",
                    "nvidia", "cluster", "infrastructure", "hardware", "hosting",
                ],
            ),
            (
                Category::Apps,
                &[
                    "launch", "product", "app", "assistant", "copilot", "agent", "startup",
                    "raises", "funding", "enterprise", "customers", "feature",
                ],
            ),
        ],
        TopicTag::Cyber => &[
            (
                Category::Ransomware,
                &["ransomware", "ransom", "lockbit", "extortion"],
            ),
            (
                Category::ZeroDay,
                &[
                    "zero-day", "zero day", "0-day", "cve-", "vulnerability", "exploit",
                    "patch",
                ],
            ),
            (
                Category::Apt,
                &[
                    "apt", "nation-state", "state-sponsored", "espionage", "threat actor",
                    "campaign",
                ],
            ),
            (
                Category::Privacy,
                &["privacy", "data breach", "breach", "leak", "gdpr", "surveillance"],
            ),
        ],
    };

    for (category, keywords) in table {
        if keywords.iter().any(|kw| text.contains(kw)) {
            return *category;
        }
    }
    Category::default_for(article.topic_tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockGenerationBackend;
    use chrono::Utc;

    fn article(topic: TopicTag, title: &str, summary: &str) -> Article {
        let now = Utc::now();
        Article {
            id: Article::compute_id(title, title),
            title: title.to_string(),
            url: "https://example.com/a".to_string(),
            canonical_url: format!("https://example.com/{}", title.len()),
            source_feeds: vec!["feed".to_string()],
            topic_tag: topic,
            published_at: now,
            raw_summary: Some(summary.to_string()),
            fetched_at: now,
        }
    }

    #[test]
    fn rules_route_cyber_keywords_to_specific_buckets() {
        let a = article(TopicTag::Cyber, "LockBit ransomware hits logistics firm", "");
        assert_eq!(rule_category(&a), Category::Ransomware);

        let b = article(TopicTag::Cyber, "New zero-day exploited in the wild", "");
        assert_eq!(rule_category(&b), Category::ZeroDay);

        let c = article(TopicTag::Cyber, "Weekly security roundup", "");
        assert_eq!(rule_category(&c), Category::Threats);
    }

    #[test]
    fn rules_route_ai_keywords_and_default() {
        let a = article(TopicTag::Ai, "Nvidia ships new GPU for inference", "");
        assert_eq!(rule_category(&a), Category::Infra);

        let b = article(TopicTag::Ai, "EU finalizes AI Act regulation", "");
        assert_eq!(rule_category(&b), Category::Policy);

        let c = article(TopicTag::Ai, "Interesting benchmark results", "");
        assert_eq!(rule_category(&c), Category::Research);
    }

    #[tokio::test]
    async fn each_article_lands_in_exactly_one_bucket() {
        let classifier = Classifier::rules();
        let articles = vec![
            article(TopicTag::Cyber, "Ransomware gang extorts hospital", ""),
            article(TopicTag::Ai, "Startup raises $50M for agent platform", ""),
            article(TopicTag::Ai, "Model research update", ""),
        ];
        let buckets = classifier.partition(&articles).await;

        let total: usize = buckets.iter().map(|b| b.articles.len()).sum();
        assert_eq!(total, articles.len());
        for bucket in &buckets {
            assert_eq!(bucket.category.topic(), bucket.topic_tag);
            assert!(!bucket.articles.is_empty());
        }
    }

    #[tokio::test]
    async fn backend_failure_falls_back_to_rules() {
        let backend = Arc::new(MockGenerationBackend::failing("classifier"));
        let classifier = Classifier::with_backend(backend);
        let a = article(TopicTag::Cyber, "LockBit ransomware resurfaces", "");
        assert_eq!(classifier.classify(&a).await, Category::Ransomware);
    }
}
