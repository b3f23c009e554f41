use crate::types::{Article, DedupConfig};
use chrono::Duration;
use std::collections::HashSet;
use tracing::{debug, info};

/// Collapses articles referring to the same underlying story across feeds.
///
/// Two articles are the same story when their canonical URLs match, or when
/// their normalized titles are near-identical and they were published within
/// the configured time window. Near-duplicate stories with divergent titles
/// may slip through; that false-negative behavior is accepted.
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn dedup(&self, mut articles: Vec<Article>) -> Vec<Article> {
        // The surviving record of a merge is the first one scanned. Upstream
        // collection finishes in fetch-completion order, so fix the scan
        // order here or the kept id would vary between identical runs.
        articles.sort_by(|a, b| a.id.cmp(&b.id));

        let input_len = articles.len();
        let mut merged: Vec<Article> = Vec::with_capacity(input_len);

        for article in articles {
            let existing = merged.iter_mut().find(|kept| self.same_story(kept, &article));
            match existing {
                Some(kept) => {
                    debug!(
                        "Merging duplicate story: {} ({} <- {})",
                        article.title, kept.id, article.id
                    );
                    merge_into(kept, article, &self.config);
                }
                None => merged.push(article),
            }
        }

        if merged.len() < input_len {
            info!("Deduplicated {} articles down to {}", input_len, merged.len());
        }
        merged
    }

    fn same_story(&self, a: &Article, b: &Article) -> bool {
        if a.canonical_url == b.canonical_url {
            return true;
        }

        let gap = (a.published_at - b.published_at).abs();
        if gap > Duration::hours(self.config.time_window_hours) {
            return false;
        }

        title_similarity(&a.title, &b.title) >= self.config.title_similarity_threshold
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

/// Merge tie-breaks: keep the most complete summary, the earliest publish
/// time, and the union of source feeds.
fn merge_into(kept: &mut Article, other: Article, _config: &DedupConfig) {
    let kept_len = kept.raw_summary.as_deref().map(str::len).unwrap_or(0);
    let other_len = other.raw_summary.as_deref().map(str::len).unwrap_or(0);
    if other_len > kept_len {
        kept.raw_summary = other.raw_summary;
    }

    if other.published_at < kept.published_at {
        kept.published_at = other.published_at;
    }

    for feed in other.source_feeds {
        if !kept.source_feeds.contains(&feed) {
            kept.source_feeds.push(feed);
        }
    }
}

/// Case- and punctuation-insensitive token Jaccard similarity of two titles.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let tokens_a = normalize_tokens(a);
    let tokens_b = normalize_tokens(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

fn normalize_tokens(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect()
}
