use crate::types::TopicTag;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One registered feed endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSource {
    pub url: String,
    pub topic_tag: TopicTag,
}

impl FeedSource {
    pub fn new(url: impl Into<String>, topic_tag: TopicTag) -> Self {
        Self {
            url: url.into(),
            topic_tag,
        }
    }
}

/// Static, configurable list of feed endpoints tagged by topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedRegistry {
    sources: Vec<FeedSource>,
}

impl FeedRegistry {
    pub fn new(sources: Vec<FeedSource>) -> Self {
        Self { sources }
    }

    /// The feed set the service ships with.
    pub fn default_sources() -> Self {
        let mut sources = Vec::new();
        for url in [
            "https://www.technologyreview.com/feed/",
            "https://magazine.sebastianraschka.com/feed",
            "https://ai-techpark.com/category/ai/feed/",
            "https://www.artificialintelligence-news.com/feed/rss/",
            "https://www.wired.com/feed/tag/ai/latest/rss",
        ] {
            sources.push(FeedSource::new(url, TopicTag::Ai));
        }
        for url in [
            "https://feeds.feedburner.com/TheHackersNews",
            "https://www.cisa.gov/cybersecurity-advisories/all.xml",
            "https://krebsonsecurity.com/feed/",
            "https://www.securityweek.com/feed/",
        ] {
            sources.push(FeedSource::new(url, TopicTag::Cyber));
        }
        Self { sources }
    }

    pub fn add(&mut self, source: FeedSource) {
        info!("Registering feed: {} ({})", source.url, source.topic_tag);
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[FeedSource] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn by_topic(&self, topic: TopicTag) -> impl Iterator<Item = &FeedSource> {
        self.sources.iter().filter(move |s| s.topic_tag == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_both_topics() {
        let registry = FeedRegistry::default_sources();
        assert!(registry.by_topic(TopicTag::Ai).count() >= 3);
        assert!(registry.by_topic(TopicTag::Cyber).count() >= 3);
    }

    #[test]
    fn add_extends_the_registry() {
        let mut registry = FeedRegistry::default();
        assert!(registry.is_empty());
        registry.add(FeedSource::new("https://example.com/feed", TopicTag::Ai));
        assert_eq!(registry.len(), 1);
    }
}
