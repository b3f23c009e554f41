use crate::registry::{FeedRegistry, FeedSource};
use crate::types::{Article, CollectorConfig, DigestError, Result, TopicTag};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// External feed-transport capability: `fetch(url) -> raw feed bytes`.
#[async_trait]
pub trait FeedFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// reqwest-backed fetcher used in production.
pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(config: &CollectorConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

#[async_trait]
impl FeedFetch for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await.map_err(|e| DigestError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::Fetch {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            });
        }

        let bytes = response.bytes().await.map_err(|e| DigestError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Query parameters that never change story identity.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref", "mc_cid", "mc_eid", "igshid"];

/// Canonical form of an article URL: no fragment, no tracking parameters,
/// no trailing slash. Two URLs pointing at the same story canonicalize to
/// the same string.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw)?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| {
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_ref())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    if !kept.is_empty() {
        // Re-serialize through the encoder; query_pairs() decodes values, so
        // formatting them back raw would let an encoded '&' or '=' inside a
        // value turn into extra parameters.
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
    }

    let mut canonical = url.to_string();
    while canonical.ends_with('/') {
        canonical.pop();
    }
    Ok(canonical)
}

/// Result of one collection sweep over the registry.
#[derive(Debug, Default)]
pub struct CollectResult {
    pub articles: Vec<Article>,
    pub failed_feeds: Vec<String>,
}

/// Fetches and parses every registered feed into normalized [`Article`]
/// records. Fails soft per feed: one bad feed never fails the sweep.
pub struct FeedCollector {
    fetcher: Arc<dyn FeedFetch>,
    config: CollectorConfig,
}

impl FeedCollector {
    pub fn new(fetcher: Arc<dyn FeedFetch>, config: CollectorConfig) -> Self {
        Self { fetcher, config }
    }

    pub async fn collect(&self, registry: &FeedRegistry) -> CollectResult {
        info!("Collecting {} feeds", registry.len());

        let results: Vec<(String, Result<Vec<Article>>)> = stream::iter(registry.sources())
            .map(|source| async move {
                let outcome = self.collect_feed(source).await;
                (source.url.clone(), outcome)
            })
            .buffer_unordered(self.config.max_concurrent_fetches)
            .collect()
            .await;

        let mut by_canonical: HashMap<String, Article> = HashMap::new();
        let mut failed_feeds = Vec::new();

        for (url, outcome) in results {
            match outcome {
                Ok(articles) => {
                    if articles.is_empty() {
                        warn!("Feed {} parsed to zero entries, skipping", url);
                        continue;
                    }
                    debug!("Feed {} yielded {} articles", url, articles.len());
                    for article in articles {
                        // Same-feed / same-sweep duplicates collapse here;
                        // cross-feed story merging is the deduplicator's job.
                        // The smaller id survives so the kept record does not
                        // depend on feed completion order.
                        match by_canonical.entry(article.canonical_url.clone()) {
                            Entry::Vacant(slot) => {
                                slot.insert(article);
                            }
                            Entry::Occupied(mut slot) => {
                                let kept = slot.get_mut();
                                let mut other = article;
                                if other.id < kept.id {
                                    std::mem::swap(kept, &mut other);
                                }
                                for feed in other.source_feeds {
                                    if !kept.source_feeds.contains(&feed) {
                                        kept.source_feeds.push(feed);
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Feed {} failed, skipping: {}", url, e);
                    failed_feeds.push(url);
                }
            }
        }

        let articles: Vec<Article> = by_canonical.into_values().collect();
        info!(
            "Collection finished: {} articles, {} failed feeds",
            articles.len(),
            failed_feeds.len()
        );

        CollectResult {
            articles,
            failed_feeds,
        }
    }

    async fn collect_feed(&self, source: &FeedSource) -> Result<Vec<Article>> {
        let bytes = self.fetcher.fetch(&source.url).await?;
        parse_feed_articles(&bytes, source, self.config.items_per_feed)
    }
}

/// Best-effort extraction of articles from raw feed bytes. Entries without a
/// link are skipped; a missing publish date falls back to fetch time.
pub fn parse_feed_articles(
    bytes: &[u8],
    source: &FeedSource,
    max_items: usize,
) -> Result<Vec<Article>> {
    let feed = feed_rs::parser::parse(bytes)
        .map_err(|e| DigestError::Parse(format!("{}: {}", source.url, e)))?;

    let fetched_at = Utc::now();
    let mut articles = Vec::new();

    for entry in feed.entries.into_iter().take(max_items) {
        let Some(link) = entry.links.first().map(|l| l.href.clone()) else {
            debug!("Skipping entry without link in {}", source.url);
            continue;
        };

        let canonical_url = match canonicalize_url(&link) {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!("Skipping entry with unparsable link {}: {}", link, e);
                continue;
            }
        };

        let title = entry
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled".to_string());

        let raw_summary = entry
            .summary
            .map(|s| s.content)
            .or_else(|| entry.content.and_then(|c| c.body));

        let published_at = entry
            .published
            .or(entry.updated)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(fetched_at);

        articles.push(Article {
            id: Article::compute_id(&canonical_url, &title),
            title,
            url: link,
            canonical_url,
            source_feeds: vec![source.url.clone()],
            topic_tag: source.topic_tag,
            published_at,
            raw_summary,
            fetched_at,
        });
    }

    Ok(articles)
}

/// Fetcher stub returning preloaded bytes per URL; unknown URLs fail. Used
/// by tests and offline runs.
pub struct StaticFeedFetcher {
    responses: HashMap<String, Vec<u8>>,
}

impl StaticFeedFetcher {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
        }
    }

    pub fn with_feed(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.to_string(), body.into());
        self
    }
}

impl Default for StaticFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedFetch for StaticFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| DigestError::Fetch {
                url: url.to_string(),
                message: "no response configured".to_string(),
            })
    }
}

/// Minimal RSS document for tests.
#[cfg(test)]
pub fn rss_fixture(items: &[(&str, &str, &str)]) -> String {
    let mut body = String::from(
        "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>fixture</title>",
    );
    for (title, link, summary) in items {
        body.push_str(&format!(
            "<item><title>{}</title><link>{}</link><description>{}</description>\
             <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate></item>",
            title, link, summary
        ));
    }
    body.push_str("</channel></rss>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_strips_tracking_params_and_fragment() {
        let a = canonicalize_url("https://example.com/story?utm_source=rss&utm_medium=feed#top")
            .unwrap();
        let b = canonicalize_url("https://example.com/story/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "https://example.com/story");
    }

    #[test]
    fn canonicalization_preserves_encoded_query_values() {
        // An encoded '&'/'=' inside a value must not split into extra
        // parameters and collide with a genuinely different URL.
        let a = canonicalize_url("https://example.com/s?q=a%26b%3D").unwrap();
        let b = canonicalize_url("https://example.com/s?q=a&b=").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, "https://example.com/s?q=a%26b%3D");
    }

    #[test]
    fn canonicalization_keeps_meaningful_query() {
        let url = canonicalize_url("https://example.com/story?id=42&utm_campaign=x").unwrap();
        assert_eq!(url, "https://example.com/story?id=42");
    }

    #[test]
    fn parse_extracts_articles_with_fallback_dates() {
        let rss = rss_fixture(&[("Headline", "https://example.com/a", "Summary text")]);
        let source = FeedSource::new("https://feed.example.com/rss", TopicTag::Ai);
        let articles = parse_feed_articles(rss.as_bytes(), &source, 10).unwrap();

        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].title, "Headline");
        assert_eq!(articles[0].topic_tag, TopicTag::Ai);
        assert_eq!(articles[0].raw_summary.as_deref(), Some("Summary text"));
    }

    #[test]
    fn parse_respects_items_per_feed_cap() {
        let rss = rss_fixture(&[
            ("One", "https://example.com/1", ""),
            ("Two", "https://example.com/2", ""),
            ("Three", "https://example.com/3", ""),
        ]);
        let source = FeedSource::new("https://feed.example.com/rss", TopicTag::Cyber);
        let articles = parse_feed_articles(rss.as_bytes(), &source, 2).unwrap();
        assert_eq!(articles.len(), 2);
    }

    #[tokio::test]
    async fn one_failing_feed_does_not_fail_the_sweep() {
        let rss = rss_fixture(&[("Story", "https://example.com/s", "text")]);
        let fetcher = StaticFeedFetcher::new().with_feed("https://ok.example.com/rss", rss);

        let mut registry = FeedRegistry::default();
        registry.add(FeedSource::new("https://ok.example.com/rss", TopicTag::Ai));
        registry.add(FeedSource::new("https://down.example.com/rss", TopicTag::Cyber));

        let collector = FeedCollector::new(Arc::new(fetcher), CollectorConfig::default());
        let result = collector.collect(&registry).await;

        assert_eq!(result.articles.len(), 1);
        assert_eq!(result.failed_feeds, vec!["https://down.example.com/rss"]);
    }

    #[tokio::test]
    async fn same_sweep_duplicates_collapse_by_canonical_url() {
        let rss_a = rss_fixture(&[("Story", "https://example.com/s?utm_source=a", "text")]);
        let rss_b = rss_fixture(&[("Story", "https://example.com/s?utm_source=b", "text")]);
        let fetcher = StaticFeedFetcher::new()
            .with_feed("https://a.example.com/rss", rss_a)
            .with_feed("https://b.example.com/rss", rss_b);

        let mut registry = FeedRegistry::default();
        registry.add(FeedSource::new("https://a.example.com/rss", TopicTag::Ai));
        registry.add(FeedSource::new("https://b.example.com/rss", TopicTag::Ai));

        let collector = FeedCollector::new(Arc::new(fetcher), CollectorConfig::default());
        let result = collector.collect(&registry).await;

        assert_eq!(result.articles.len(), 1);
    }

    #[tokio::test]
    async fn same_sweep_collapse_keeps_a_deterministic_record() {
        let rss_a = rss_fixture(&[("Story headline A", "https://example.com/s?utm_source=a", "")]);
        let rss_b = rss_fixture(&[("Story headline B", "https://example.com/s?utm_source=b", "")]);
        let fetcher = StaticFeedFetcher::new()
            .with_feed("https://a.example.com/rss", rss_a)
            .with_feed("https://b.example.com/rss", rss_b);

        let id_a = Article::compute_id("https://example.com/s", "Story headline A");
        let id_b = Article::compute_id("https://example.com/s", "Story headline B");
        let expected = id_a.min(id_b);

        let mut registry = FeedRegistry::default();
        registry.add(FeedSource::new("https://b.example.com/rss", TopicTag::Ai));
        registry.add(FeedSource::new("https://a.example.com/rss", TopicTag::Ai));

        let collector = FeedCollector::new(Arc::new(fetcher), CollectorConfig::default());
        let result = collector.collect(&registry).await;

        assert_eq!(result.articles.len(), 1);
        assert_eq!(result.articles[0].id, expected);
        assert_eq!(result.articles[0].source_feeds.len(), 2);
    }
}
