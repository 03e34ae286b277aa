//! Core data models used throughout Quarry.
//!
//! A [`Document`] owns its normalized markdown `content` and a flat arena of
//! [`Section`]s stored in depth-first pre-order. Each section refers to its
//! parent by id, so the tree view is rebuilt by grouping on `parent_id`
//! instead of holding back-pointers.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::markdown;

/// Current time truncated to millisecond precision, which is what the
/// stores persist.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// New lexicographically time-ordered identifier.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// Number of whitespace-separated words in `text`.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// A normalized markdown document and its section tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Canonical source URL; unique across documents.
    pub source: String,
    /// Opaque change marker supplied by the uploader.
    pub etag: String,
    pub owner_id: String,
    /// Normalized markdown bytes.
    pub content: Vec<u8>,
    pub collections: Vec<String>,
    /// All sections in depth-first pre-order.
    pub sections: Vec<Section>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A contiguous byte range of a document matching a heading subtree or an
/// overflow split of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub document_id: String,
    /// `None` for top-level sections.
    pub parent_id: Option<String>,
    /// Heading depth; overflow splits sit one level below their heading.
    pub level: u32,
    /// Ids from the top-level ancestor down to this section, inclusive.
    pub branch: Vec<String>,
    pub start: usize,
    pub end: usize,
}

impl Document {
    /// Returns `content[start..end]`.
    pub fn chunk(&self, start: usize, end: usize) -> Result<&[u8], Error> {
        if start > end || end > self.content.len() {
            return Err(Error::OutOfRange {
                start,
                end,
                len: self.content.len(),
            });
        }
        Ok(&self.content[start..end])
    }

    /// Sections without a parent, in document order.
    pub fn top_level_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.parent_id.is_none())
    }

    /// Direct children of `section_id`, in document order.
    pub fn children_of<'a>(&'a self, section_id: &'a str) -> impl Iterator<Item = &'a Section> {
        self.sections
            .iter()
            .filter(move |s| s.parent_id.as_deref() == Some(section_id))
    }

    pub fn section(&self, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    /// Trimmed section text with `data:` URIs stripped.
    pub fn section_content(&self, section: &Section) -> Result<String, Error> {
        let raw = self.chunk(section.start, section.end)?;
        Ok(markdown::clean_section_text(&String::from_utf8_lossy(raw)))
    }

    /// URL identifying a section inside an index: `source#section_id`.
    pub fn section_url(&self, section: &Section) -> String {
        section_url(&self.source, &section.id)
    }
}

/// `source#section_id`, the per-section key shared by the indexes.
pub fn section_url(source: &str, section_id: &str) -> String {
    format!("{}#{}", source, section_id)
}

/// Total number of sections in the document tree.
pub fn count_sections(doc: &Document) -> usize {
    doc.sections.len()
}

/// Depth-first pre-order traversal stopping at the first error.
pub fn walk_sections<F>(doc: &Document, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&Section) -> anyhow::Result<()>,
{
    fn visit<F>(doc: &Document, section: &Section, f: &mut F) -> anyhow::Result<()>
    where
        F: FnMut(&Section) -> anyhow::Result<()>,
    {
        f(section)?;
        for child in doc.children_of(&section.id) {
            visit(doc, child, f)?;
        }
        Ok(())
    }

    for top in doc.top_level_sections() {
        visit(doc, top, &mut f)?;
    }
    Ok(())
}

/// A named, shareable grouping of documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub label: String,
    pub description: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareLevel {
    Read,
    Write,
}

impl ShareLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareLevel::Read => "read",
            ShareLevel::Write => "write",
        }
    }
}

impl std::str::FromStr for ShareLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "read" => Ok(ShareLevel::Read),
            "write" => Ok(ShareLevel::Write),
            other => anyhow::bail!("unknown share level: '{}'", other),
        }
    }
}

/// `(collection, user, level)`; at most one per `(collection, user)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionShare {
    pub collection_id: String,
    pub user_id: String,
    pub level: ShareLevel,
}

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub provider: String,
    pub subject: String,
    pub email: Option<String>,
    pub display_name: String,
    pub roles: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Bearer secret exchanged for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: String,
    pub owner_id: String,
    pub label: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Options accepted by every [`Index::search`](crate::index::Index::search).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Maximum results; `0` means unlimited.
    pub max_results: usize,
    /// Restrict to these collections when non-empty.
    pub collections: Vec<String>,
}

/// One ranked source with its matching sections, best first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub source: String,
    pub sections: Vec<String>,
}

/// Groups `(source, section_id)` hits by source, keeping first-seen order
/// of sources and hit order of sections.
pub fn group_hits<I>(hits: I) -> Vec<SearchResult>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut results: Vec<SearchResult> = Vec::new();
    let mut by_source: HashMap<String, usize> = HashMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for (source, section_id) in hits {
        if !seen.insert((source.clone(), section_id.clone())) {
            continue;
        }
        match by_source.get(&source) {
            Some(&i) => results[i].sections.push(section_id),
            None => {
                by_source.insert(source.clone(), results.len());
                results.push(SearchResult {
                    source,
                    sections: vec![section_id],
                });
            }
        }
    }
    results
}
