//! Markdown section chunker.
//!
//! Turns a normalized markdown buffer into a [`Document`] whose sections
//! follow the heading hierarchy and whose leaves stay under a word budget.
//! Byte offsets always point into the original buffer, so a section's text
//! is a plain slice of [`Document::content`].
//!
//! # Algorithm
//!
//! A single walk over `pulldown-cmark`'s offset iterator:
//!
//! 1. A heading of level `L` opens a section under the nearest enclosing
//!    heading section whose level is below `L` (or the document root).
//! 2. Text-bearing events extend the current section, and every ancestor,
//!    up to the event's end offset. Code blocks, HTML blocks, tables and
//!    rules are indivisible and extend by their full range.
//! 3. When the current section exceeds the word budget after an extension,
//!    it is split at the previous end offset. The first overflow of a
//!    heading section moves its body into two child sections one level
//!    deeper; later overflows add siblings at that same level.
//! 4. Content before the first heading lands in a level-1 section.
//! 5. Blank sections are pruned, and a section whose only child spans the
//!    exact same bytes is replaced by that child.
//!
//! YAML front matter is not part of any section. Its `source` key, when
//! present, becomes [`Document::source`].

use std::ops::Range;

use anyhow::Context;
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use serde::Deserialize;

use crate::error::Error;
use crate::models::{count_words, new_id, now, Document, Section};

/// Default word budget for leaf sections.
pub const DEFAULT_MAX_WORDS: usize = 250;

/// Replacement for `data:` URIs in rendered section content.
pub const STRIPPED_URI: &str = "#stripped";

const ROOT: usize = 0;

fn parser_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_YAML_STYLE_METADATA_BLOCKS
}

/// Splits markdown into a bounded-size section tree.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_words: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORDS)
    }
}

impl Chunker {
    /// A budget of `0` is treated as `1`.
    pub fn new(max_words: usize) -> Self {
        Self {
            max_words: max_words.max(1),
        }
    }

    pub fn max_words(&self) -> usize {
        self.max_words
    }

    /// Parses `data` into a document with a fresh id and section ids.
    ///
    /// The returned document has no owner, etag or collections; callers fill
    /// those in. `source` is taken from the front matter when present.
    pub fn parse(&self, data: &[u8]) -> anyhow::Result<Document> {
        let text = std::str::from_utf8(data).context("markdown content is not valid UTF-8")?;

        let mut builder = TreeBuilder::new(text, self.max_words);
        let mut metadata: Option<String> = None;
        let mut in_metadata = false;
        let mut skip: Option<Range<usize>> = None;
        let mut block_start = 0usize;
        let mut outer_end = 0usize;

        for (event, range) in Parser::new_ext(text, parser_options()).into_offset_iter() {
            if let Some(s) = &skip {
                if s.start <= range.start && range.end <= s.end {
                    continue;
                }
                skip = None;
            }

            if let Event::Start(_) = &event {
                if range.start >= outer_end {
                    block_start = range.start;
                    outer_end = range.end;
                }
            }

            match event {
                Event::Start(Tag::MetadataBlock(_)) => in_metadata = true,
                Event::End(TagEnd::MetadataBlock(_)) => in_metadata = false,
                Event::Text(t) if in_metadata => {
                    metadata.get_or_insert_with(String::new).push_str(&t);
                }
                Event::Start(Tag::Heading { level, .. }) => {
                    builder.open_heading(level as u32, range.clone());
                    skip = Some(range);
                }
                Event::Start(Tag::CodeBlock(_))
                | Event::Start(Tag::HtmlBlock)
                | Event::Start(Tag::Table(_)) => {
                    builder.extend(range.clone(), block_start);
                    skip = Some(range);
                }
                Event::Text(_)
                | Event::Code(_)
                | Event::InlineMath(_)
                | Event::DisplayMath(_)
                | Event::Html(_)
                | Event::InlineHtml(_)
                | Event::FootnoteReference(_)
                | Event::TaskListMarker(_)
                | Event::Rule => builder.extend(range, block_start),
                Event::End(TagEnd::Emphasis)
                | Event::End(TagEnd::Strong)
                | Event::End(TagEnd::Strikethrough)
                | Event::End(TagEnd::Link)
                | Event::End(TagEnd::Image) => builder.extend(range, block_start),
                _ => {}
            }
        }

        let source = match metadata {
            Some(yaml) => front_matter_source(&yaml)?,
            None => None,
        };

        let id = new_id();
        let sections = builder.finish(&id);
        let created = now();
        Ok(Document {
            id,
            source: source.unwrap_or_default(),
            etag: String::new(),
            owner_id: String::new(),
            content: data.to_vec(),
            collections: Vec::new(),
            sections,
            created_at: created,
            updated_at: created,
        })
    }
}

// ============ Front matter ============

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    source: Option<String>,
}

fn front_matter_source(yaml: &str) -> Result<Option<String>, Error> {
    if yaml.trim().is_empty() {
        return Ok(None);
    }
    let fm: FrontMatter =
        yaml_serde::from_str(yaml).map_err(|e| Error::InvalidSource(e.to_string()))?;
    match fm.source {
        None => Ok(None),
        Some(raw) => {
            let source = raw.trim();
            if is_valid_source(source) {
                Ok(Some(source.to_string()))
            } else {
                Err(Error::InvalidSource(raw))
            }
        }
    }
}

/// `scheme:rest` with an RFC 3986 scheme and no whitespace.
pub fn is_valid_source(source: &str) -> bool {
    let Some((scheme, rest)) = source.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    let scheme_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    scheme_ok && !rest.is_empty() && !source.chars().any(char::is_whitespace)
}

// ============ Section content ============

/// Replaces `data:` URIs in image and link destinations with
/// [`STRIPPED_URI`].
pub fn strip_data_uris(text: &str) -> String {
    let mut edits: Vec<Range<usize>> = Vec::new();
    for (event, range) in Parser::new_ext(text, parser_options()).into_offset_iter() {
        let dest = match &event {
            Event::Start(Tag::Image { dest_url, .. }) | Event::Start(Tag::Link { dest_url, .. }) => {
                dest_url
            }
            _ => continue,
        };
        let is_data = dest
            .get(..5)
            .is_some_and(|p| p.eq_ignore_ascii_case("data:"));
        if !is_data {
            continue;
        }
        if let Some(pos) = text[range.clone()].find(dest.as_ref()) {
            let at = range.start + pos;
            edits.push(at..at + dest.len());
        }
    }

    if edits.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for edit in edits {
        if edit.start < last {
            continue;
        }
        out.push_str(&text[last..edit.start]);
        out.push_str(STRIPPED_URI);
        last = edit.end;
    }
    out.push_str(&text[last..]);
    out
}

/// Section text as handed to indexes: `data:` URIs stripped, trimmed.
pub fn clean_section_text(text: &str) -> String {
    strip_data_uris(text).trim().to_string()
}

// ============ Tree building ============

#[derive(Debug, Clone)]
struct Node {
    parent: Option<usize>,
    level: u32,
    start: usize,
    end: usize,
    /// First byte after the heading line; equals `start` for splits.
    body_start: usize,
    /// Created by an overflow split rather than a heading.
    split: bool,
    live: bool,
}

struct TreeBuilder<'a> {
    text: &'a str,
    max_words: usize,
    nodes: Vec<Node>,
    current: usize,
}

impl<'a> TreeBuilder<'a> {
    fn new(text: &'a str, max_words: usize) -> Self {
        Self {
            text,
            max_words,
            nodes: vec![Node {
                parent: None,
                level: 0,
                start: 0,
                end: 0,
                body_start: 0,
                split: false,
                live: true,
            }],
            current: ROOT,
        }
    }

    fn push(&mut self, parent: usize, level: u32, range: Range<usize>, body_start: usize, split: bool) -> usize {
        self.nodes.push(Node {
            parent: Some(parent),
            level,
            start: range.start,
            end: range.end,
            body_start,
            split,
            live: true,
        });
        self.nodes.len() - 1
    }

    /// Raises `end` on `idx` and all of its ancestors.
    fn stretch(&mut self, idx: usize, end: usize) {
        let mut at = Some(idx);
        while let Some(i) = at {
            let node = &mut self.nodes[i];
            if node.end < end {
                node.end = end;
            }
            at = node.parent;
        }
    }

    fn open_heading(&mut self, level: u32, range: Range<usize>) {
        let mut parent = self.current;
        while parent != ROOT {
            let node = &self.nodes[parent];
            if !node.split && node.level < level {
                break;
            }
            parent = node.parent.unwrap_or(ROOT);
        }
        let idx = self.push(parent, level, range.clone(), range.end, false);
        self.stretch(parent, range.end);
        self.current = idx;
    }

    fn extend(&mut self, range: Range<usize>, block_start: usize) {
        if self.current == ROOT {
            let start = block_start.min(range.start);
            self.current = self.push(ROOT, 1, start..start, start, true);
        }

        let cur = self.current;
        let prev_end = self.nodes[cur].end;
        if range.end <= prev_end {
            return;
        }
        self.stretch(cur, range.end);

        let node = self.nodes[cur].clone();
        if count_words(&self.text[node.start..range.end]) <= self.max_words {
            return;
        }

        if node.split {
            if prev_end <= node.start {
                return;
            }
            self.nodes[cur].end = prev_end;
            let parent = node.parent.unwrap_or(ROOT);
            self.current = self.push(parent, node.level, prev_end..range.end, prev_end, true);
        } else {
            if prev_end <= node.body_start {
                return;
            }
            let level = node.level + 1;
            self.push(cur, level, node.body_start..prev_end, node.body_start, true);
            self.current = self.push(cur, level, prev_end..range.end, prev_end, true);
        }
    }

    fn children(&self) -> Vec<Vec<usize>> {
        let mut children = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate().skip(1) {
            if node.live {
                if let Some(p) = node.parent {
                    children[p].push(i);
                }
            }
        }
        children
    }

    fn prune(&mut self) {
        let n = self.nodes.len();
        let mut live_kids = vec![0usize; n];
        for node in self.nodes.iter().skip(1) {
            if let (true, Some(p)) = (node.live, node.parent) {
                live_kids[p] += 1;
            }
        }

        // Children are always created after their parents.
        for i in (1..n).rev() {
            let node = &self.nodes[i];
            if node.live && live_kids[i] == 0 && self.text[node.start..node.end].trim().is_empty() {
                self.nodes[i].live = false;
                if let Some(p) = self.nodes[i].parent {
                    live_kids[p] -= 1;
                }
            }
        }

        let mut kids: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (k, node) in self.nodes.iter().enumerate().skip(1) {
            if let Some(p) = node.parent {
                kids[p].push(k);
            }
        }
        for i in (1..n).rev() {
            if !self.nodes[i].live {
                continue;
            }
            let live: Vec<usize> = kids[i]
                .iter()
                .copied()
                .filter(|&k| self.nodes[k].live && self.nodes[k].parent == Some(i))
                .collect();
            if let [only] = live.as_slice() {
                let only = *only;
                let (start, end) = (self.nodes[i].start, self.nodes[i].end);
                if self.nodes[only].start == start && self.nodes[only].end == end {
                    let parent = self.nodes[i].parent;
                    self.nodes[only].parent = parent;
                    self.nodes[i].live = false;
                    if let Some(p) = parent {
                        kids[p].push(only);
                    }
                }
            }
        }
    }

    fn finish(mut self, document_id: &str) -> Vec<Section> {
        self.prune();
        let children = self.children();
        let mut out = Vec::new();
        // (node, parent section id, parent branch)
        let mut stack: Vec<(usize, Option<String>, Vec<String>)> = children[ROOT]
            .iter()
            .rev()
            .map(|&c| (c, None, Vec::new()))
            .collect();

        while let Some((idx, parent_id, mut branch)) = stack.pop() {
            let node = &self.nodes[idx];
            let id = new_id();
            branch.push(id.clone());
            for &child in children[idx].iter().rev() {
                stack.push((child, Some(id.clone()), branch.clone()));
            }
            out.push(Section {
                id,
                document_id: document_id.to_string(),
                parent_id,
                level: node.level,
                branch,
                start: node.start,
                end: node.end,
            });
        }
        out
    }
}
