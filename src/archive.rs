use crate::types::{
    Category, DigestDocument, DigestError, DigestSection, Result, TopicTag,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Durable, append-only archive of daily digest documents, one file per
/// calendar day. Writes are atomic from a reader's perspective (temp file
/// then rename) and last-write-wins: regenerating a date replaces that
/// day's document wholesale.
pub struct DigestArchive {
    dir: PathBuf,
}

impl DigestArchive {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| DigestError::ArchiveWrite(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.md", date))
    }

    /// Stores the document under its date key. A reader never observes a
    /// partially written file.
    pub fn put(&self, doc: &DigestDocument) -> Result<PathBuf> {
        let path = self.path_for(doc.date);
        let tmp = self.dir.join(format!("{}.md.tmp", doc.date));
        let rendered = render_document(doc);

        fs::write(&tmp, rendered)
            .map_err(|e| DigestError::ArchiveWrite(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| DigestError::ArchiveWrite(format!("rename {}: {}", path.display(), e)))?;

        info!("Archived digest for {} at {}", doc.date, path.display());
        Ok(path)
    }

    pub fn get(&self, date: NaiveDate) -> Result<Option<DigestDocument>> {
        let path = self.path_for(date);
        if !path.exists() {
            debug!("No archived digest for {}", date);
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        parse_document(&text).map(Some)
    }

    /// All archived dates, ascending.
    pub fn list_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".md")) else {
                continue;
            };
            match stem.parse::<NaiveDate>() {
                Ok(date) => dates.push(date),
                Err(_) => warn!("Ignoring non-digest file in archive: {:?}", name),
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Lazy, restartable listing of documents within a date range, ordered
    /// ascending. Each document is read from disk only when the iterator
    /// reaches it.
    pub fn list(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<DigestIter> {
        let dates = self
            .list_dates()?
            .into_iter()
            .filter(|d| from.map_or(true, |f| *d >= f) && to.map_or(true, |t| *d <= t))
            .collect();
        Ok(DigestIter {
            dir: self.dir.clone(),
            dates,
            next: 0,
        })
    }

    pub fn latest(&self) -> Result<Option<DigestDocument>> {
        match self.list_dates()?.last() {
            Some(&date) => self.get(date),
            None => Ok(None),
        }
    }
}

/// Iterator over archived documents; restart by calling
/// [`DigestArchive::list`] again.
pub struct DigestIter {
    dir: PathBuf,
    dates: Vec<NaiveDate>,
    next: usize,
}

impl Iterator for DigestIter {
    type Item = Result<DigestDocument>;

    fn next(&mut self) -> Option<Self::Item> {
        let date = *self.dates.get(self.next)?;
        self.next += 1;
        let path = self.dir.join(format!("{}.md", date));
        Some(
            fs::read_to_string(&path)
                .map_err(DigestError::from)
                .and_then(|text| parse_document(&text)),
        )
    }
}

/// Renders a digest as front-matter metadata plus one markdown section per
/// digest section. The section header and the sources comment are the
/// machine-readable parts; everything else is prose.
pub fn render_document(doc: &DigestDocument) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("date: {}\n", doc.date));
    out.push_str(&format!("created_at: {}\n", doc.created_at.to_rfc3339()));
    out.push_str("---\n\n");

    out.push_str("# Overview\n\n");
    out.push_str(doc.overview_text.trim());
    out.push_str("\n\n");

    for section in &doc.sections {
        out.push_str(&format!("## [{}/{}]\n", section.topic_tag, section.category));
        out.push_str(&format!("<!-- sources: {} -->\n", section.source_ids.join(", ")));
        if section.fallback {
            out.push_str("<!-- fallback -->\n");
        }
        out.push('\n');
        out.push_str(section.summary_text.trim());
        out.push_str("\n\n");
    }

    out
}

pub fn parse_document(text: &str) -> Result<DigestDocument> {
    let mut lines = text.lines().peekable();

    if lines.next() != Some("---") {
        return Err(DigestError::Parse("missing front matter".to_string()));
    }

    let mut date: Option<NaiveDate> = None;
    let mut created_at: Option<DateTime<Utc>> = None;
    for line in lines.by_ref() {
        if line == "---" {
            break;
        }
        if let Some(value) = line.strip_prefix("date: ") {
            date = Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| DigestError::InvalidDate(value.to_string()))?,
            );
        } else if let Some(value) = line.strip_prefix("created_at: ") {
            created_at = DateTime::parse_from_rfc3339(value.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    let date = date.ok_or_else(|| DigestError::Parse("front matter missing date".to_string()))?;
    let created_at = created_at.unwrap_or_else(Utc::now);

    let mut overview_text = String::new();
    let mut sections: Vec<DigestSection> = Vec::new();
    let mut current: Option<DigestSection> = None;
    let mut in_overview = false;

    for line in lines {
        if line.trim() == "# Overview" {
            in_overview = true;
            continue;
        }

        // Only a header naming a known topic/category starts a section;
        // generated prose that merely looks like one stays prose.
        if let Some((topic_tag, category)) = parse_section_header(line) {
            if let Some(section) = current.take() {
                sections.push(finish_section(section));
            }
            in_overview = false;

            current = Some(DigestSection {
                topic_tag,
                category,
                summary_text: String::new(),
                source_ids: Vec::new(),
                fallback: false,
            });
            continue;
        }

        if let Some(section) = current.as_mut() {
            if let Some(ids) = line
                .strip_prefix("<!-- sources: ")
                .and_then(|l| l.strip_suffix(" -->"))
            {
                section.source_ids = ids
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            } else if line.trim() == "<!-- fallback -->" {
                section.fallback = true;
            } else {
                section.summary_text.push_str(line);
                section.summary_text.push('\n');
            }
        } else if in_overview {
            overview_text.push_str(line);
            overview_text.push('\n');
        }
    }
    if let Some(section) = current.take() {
        sections.push(finish_section(section));
    }

    Ok(DigestDocument {
        date,
        sections,
        overview_text: overview_text.trim().to_string(),
        created_at,
    })
}

fn parse_section_header(line: &str) -> Option<(TopicTag, Category)> {
    let header = line.strip_prefix("## [")?.strip_suffix(']')?;
    let (topic_raw, category_raw) = header.split_once('/')?;
    Some((TopicTag::parse(topic_raw)?, Category::parse(category_raw)?))
}

fn finish_section(mut section: DigestSection) -> DigestSection {
    section.summary_text = section.summary_text.trim().to_string();
    section
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_doc(date: &str) -> DigestDocument {
        DigestDocument {
            date: date.parse().unwrap(),
            sections: vec![
                DigestSection {
                    topic_tag: TopicTag::Ai,
                    category: Category::Infra,
                    summary_text: "GPU supply loosened.\n\n- detail line".to_string(),
                    source_ids: vec!["abc123".to_string(), "def456".to_string()],
                    fallback: false,
                },
                DigestSection {
                    topic_tag: TopicTag::Cyber,
                    category: Category::Ransomware,
                    summary_text: "Ransomware activity rose sharply.".to_string(),
                    source_ids: vec!["fff999".to_string()],
                    fallback: true,
                },
            ],
            overview_text: "Quiet day overall.".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn document_round_trips_through_the_archive_format() {
        let doc = sample_doc("2024-01-01");
        let parsed = parse_document(&render_document(&doc)).unwrap();

        assert_eq!(parsed.date, doc.date);
        assert_eq!(parsed.overview_text, doc.overview_text);
        assert_eq!(parsed.sections.len(), 2);
        assert_eq!(parsed.sections[0].source_ids, doc.sections[0].source_ids);
        assert_eq!(parsed.sections[0].summary_text, doc.sections[0].summary_text);
        assert!(parsed.sections[1].fallback);
    }

    #[test]
    fn header_lookalike_prose_stays_inside_its_section() {
        let mut doc = sample_doc("2024-01-01");
        doc.sections[0].summary_text =
            "Vendors published guidance.\n## [Internal/Memo] leaked today\nMore detail followed."
                .to_string();

        let parsed = parse_document(&render_document(&doc)).unwrap();
        assert_eq!(parsed.sections.len(), 2);
        assert!(parsed.sections[0]
            .summary_text
            .contains("## [Internal/Memo] leaked today"));
    }

    #[test]
    fn put_then_get_returns_the_document() {
        let tmp = TempDir::new().unwrap();
        let archive = DigestArchive::open(tmp.path()).unwrap();

        let doc = sample_doc("2024-01-01");
        archive.put(&doc).unwrap();

        let loaded = archive.get(doc.date).unwrap().unwrap();
        assert_eq!(loaded.covered_article_ids(), doc.covered_article_ids());
        assert!(archive.get("2024-02-02".parse().unwrap()).unwrap().is_none());
    }

    #[test]
    fn rewriting_a_date_overwrites_in_full() {
        let tmp = TempDir::new().unwrap();
        let archive = DigestArchive::open(tmp.path()).unwrap();

        let mut doc = sample_doc("2024-01-01");
        archive.put(&doc).unwrap();

        doc.sections.truncate(1);
        archive.put(&doc).unwrap();

        let loaded = archive.get(doc.date).unwrap().unwrap();
        assert_eq!(loaded.sections.len(), 1);
        assert_eq!(archive.list_dates().unwrap().len(), 1);
    }

    #[test]
    fn list_is_ordered_and_range_filtered() {
        let tmp = TempDir::new().unwrap();
        let archive = DigestArchive::open(tmp.path()).unwrap();

        for date in ["2024-01-03", "2024-01-01", "2024-01-02"] {
            archive.put(&sample_doc(date)).unwrap();
        }

        let all: Vec<_> = archive.list(None, None).unwrap().collect::<Result<_>>().unwrap();
        let dates: Vec<String> = all.iter().map(|d| d.date.to_string()).collect();
        assert_eq!(dates, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);

        let ranged: Vec<_> = archive
            .list(Some("2024-01-02".parse().unwrap()), None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ranged.len(), 2);

        assert_eq!(
            archive.latest().unwrap().unwrap().date.to_string(),
            "2024-01-03"
        );
    }

    #[test]
    fn no_temp_files_remain_after_write() {
        let tmp = TempDir::new().unwrap();
        let archive = DigestArchive::open(tmp.path()).unwrap();
        archive.put(&sample_doc("2024-01-01")).unwrap();

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
