//! File-to-markdown converters.
//!
//! A [`FileConverter`] turns an uploaded file into CommonMark bytes for the
//! chunker. Converters are picked by extension: [`PipelineConverter`] tries
//! its members in order and uses the first one that supports the file, and
//! fails with [`Error::NotSupported`] (listing every accepted extension)
//! when none does.
//!
//! | `file_converter.uri` | Pipeline |
//! |----------------------|----------|
//! | `markdown://` | markdown |
//! | `extract://` | markdown, built-in extraction |
//! | `pandoc://?bin=..&office=..` | markdown, office, pandoc, built-in extraction |
//!
//! Any of them accepts `rate_limit=<duration>`, wrapping the pipeline in a
//! [`RateLimitedConverter`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use quarry_core::error::Error;

use crate::config::{ConverterKind, ConverterSpec};
use crate::extract::{extract_markdown, EXTRACT_EXTENSIONS};
use crate::ratelimit::RateLimiter;

pub const MARKDOWN_EXTENSIONS: &[&str] = &[".md", ".markdown", ".txt"];
pub const PANDOC_EXTENSIONS: &[&str] = &[
    ".docx", ".rtf", ".odt", ".rst", ".epub", ".html", ".htm", ".tex",
];
pub const OFFICE_EXTENSIONS: &[&str] = &[".doc"];

/// Converts one file to markdown.
#[async_trait]
pub trait FileConverter: Send + Sync {
    /// Lowercase extensions with a leading dot.
    fn supported_extensions(&self) -> Vec<String>;

    async fn convert(&self, path: &Path) -> Result<Vec<u8>>;

    fn supports(&self, extension: &str) -> bool {
        self.supported_extensions()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }
}

/// `.ext` of `path`, lowercased; empty when there is none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}

fn owned(extensions: &[&str]) -> Vec<String> {
    extensions.iter().map(|e| e.to_string()).collect()
}

// ============ Passthrough ============

pub struct MarkdownConverter;

#[async_trait]
impl FileConverter for MarkdownConverter {
    fn supported_extensions(&self) -> Vec<String> {
        owned(MARKDOWN_EXTENSIONS)
    }

    async fn convert(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

// ============ Built-in extraction ============

pub struct ExtractConverter;

#[async_trait]
impl FileConverter for ExtractConverter {
    fn supported_extensions(&self) -> Vec<String> {
        owned(EXTRACT_EXTENSIONS)
    }

    async fn convert(&self, path: &Path) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let extension = extension_of(path);
        // PDF parsing is CPU-bound.
        let markdown =
            tokio::task::spawn_blocking(move || extract_markdown(&bytes, &extension)).await??;
        Ok(markdown.into_bytes())
    }
}

// ============ Pandoc ============

pub struct PandocConverter {
    bin: String,
}

impl PandocConverter {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl FileConverter for PandocConverter {
    fn supported_extensions(&self) -> Vec<String> {
        owned(PANDOC_EXTENSIONS)
    }

    async fn convert(&self, path: &Path) -> Result<Vec<u8>> {
        debug!(bin = %self.bin, path = %path.display(), "converting with pandoc");
        let output = Command::new(&self.bin)
            .arg(path)
            .args(["--to", "commonmark-raw_html", "--wrap=none"])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {}", self.bin))?;
        if !output.status.success() {
            bail!(
                "{} failed on {} ({}): {}",
                self.bin,
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

// ============ Legacy office formats ============

/// Converts `.doc` to `.docx` with a headless office suite, then runs pandoc
/// on the result.
pub struct OfficeConverter {
    bin: String,
    pandoc: PandocConverter,
}

impl OfficeConverter {
    pub fn new(bin: impl Into<String>, pandoc: PandocConverter) -> Self {
        Self {
            bin: bin.into(),
            pandoc,
        }
    }
}

#[async_trait]
impl FileConverter for OfficeConverter {
    fn supported_extensions(&self) -> Vec<String> {
        owned(OFFICE_EXTENSIONS)
    }

    async fn convert(&self, path: &Path) -> Result<Vec<u8>> {
        let outdir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        debug!(bin = %self.bin, path = %path.display(), "converting with office suite");
        let output = Command::new(&self.bin)
            .args(["--headless", "--convert-to", "docx", "--outdir"])
            .arg(&outdir)
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {}", self.bin))?;
        if !output.status.success() {
            bail!(
                "{} failed on {} ({}): {}",
                self.bin,
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let docx = path.with_extension("docx");
        let converted = self.pandoc.convert(&docx).await;
        if let Err(e) = tokio::fs::remove_file(&docx).await {
            debug!(path = %docx.display(), error = %e, "could not remove intermediate docx");
        }
        converted
    }
}

// ============ Composition ============

/// Uses the first member supporting the file's extension.
pub struct PipelineConverter {
    converters: Vec<Arc<dyn FileConverter>>,
}

impl PipelineConverter {
    pub fn new(converters: Vec<Arc<dyn FileConverter>>) -> Self {
        Self { converters }
    }
}

#[async_trait]
impl FileConverter for PipelineConverter {
    fn supported_extensions(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        for ext in self.converters.iter().flat_map(|c| c.supported_extensions()) {
            if !all.contains(&ext) {
                all.push(ext);
            }
        }
        all
    }

    async fn convert(&self, path: &Path) -> Result<Vec<u8>> {
        let extension = extension_of(path);
        match self.converters.iter().find(|c| c.supports(&extension)) {
            Some(converter) => converter.convert(path).await,
            None => Err(Error::NotSupported {
                extension,
                supported: self.supported_extensions(),
            }
            .into()),
        }
    }
}

/// Spaces conversions at least one interval apart.
pub struct RateLimitedConverter {
    inner: Arc<dyn FileConverter>,
    limiter: RateLimiter,
}

impl RateLimitedConverter {
    pub fn new(inner: Arc<dyn FileConverter>, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl FileConverter for RateLimitedConverter {
    fn supported_extensions(&self) -> Vec<String> {
        self.inner.supported_extensions()
    }

    async fn convert(&self, path: &Path) -> Result<Vec<u8>> {
        self.limiter.wait().await;
        self.inner.convert(path).await
    }
}

/// Builds the converter described by `file_converter.uri`.
pub fn build_converter(spec: &ConverterSpec) -> Arc<dyn FileConverter> {
    let mut members: Vec<Arc<dyn FileConverter>> = vec![Arc::new(MarkdownConverter)];
    match &spec.kind {
        ConverterKind::Markdown => {}
        ConverterKind::Extract => members.push(Arc::new(ExtractConverter)),
        ConverterKind::Pandoc { bin, office } => {
            members.push(Arc::new(OfficeConverter::new(
                office.clone(),
                PandocConverter::new(bin.clone()),
            )));
            members.push(Arc::new(PandocConverter::new(bin.clone())));
            members.push(Arc::new(ExtractConverter));
        }
    }
    let pipeline: Arc<dyn FileConverter> = Arc::new(PipelineConverter::new(members));
    match spec.rate_limit {
        Some(interval) => Arc::new(RateLimitedConverter::new(pipeline, RateLimiter::new(interval))),
        None => pipeline,
    }
}
