//! Configuration parsing and validation.
//!
//! Quarry is configured via a TOML file (default: `config/quarry.toml`).
//! Every option has a default, so an empty file is a valid configuration.
//! After the file is read, `QUARRY_<SECTION>_<KEY>` environment variables
//! override individual options, and the result is validated.
//!
//! # Example Configuration
//!
//! ```toml
//! [storage.database]
//! dsn = "./data/quarry.sqlite"
//!
//! [storage.index]
//! dsn = "./data/index"
//!
//! [llm.provider]
//! name = "openai"
//! base_url = "https://api.openai.com/v1"
//! key = "sk-..."
//! chat_completion_model = "gpt-4o-mini"
//! embeddings_model = "text-embedding-3-small"
//! rate_limit = "200ms"
//!
//! [llm.index]
//! max_words = 250
//!
//! [llm.search]
//! hyde = true
//! judge = true
//!
//! [task_runner]
//! uri = "memory://?parallelism=4&cleanupDelay=10m&cleanupInterval=1m"
//!
//! [file_converter]
//! uri = "pandoc://?bin=pandoc&office=soffice&rate_limit=1s"
//! ```
//!
//! # URI options
//!
//! | Option | Grammar |
//! |--------|---------|
//! | `task_runner.uri` | `memory://?parallelism=N&cleanupDelay=D&cleanupInterval=I` |
//! | `file_converter.uri` | `markdown://`, `extract://` or `pandoc://?bin=..&office=..`, each accepting `rate_limit=D` |
//!
//! Durations accept `ms`, `s`, `m` and `h` suffixes; a bare number is seconds.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quarry_core::markdown::DEFAULT_MAX_WORDS;
use quarry_core::runner::RunnerConfig;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "QUARRY_";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub task_runner: TaskRunnerConfig,
    pub file_converter: FileConverterConfig,
    pub cache: CacheConfig,
}

/// Settings for an HTTP front end; Quarry itself only uses `base_url` to
/// build links.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub address: String,
    pub base_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3002".to_string(),
            base_url: "http://localhost:3002".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub database: DatabaseConfig,
    pub index: IndexStorageConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite file holding documents and embeddings.
    pub dsn: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: PathBuf::from("./data/quarry.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IndexStorageConfig {
    /// Directory holding the lexical index.
    pub dsn: PathBuf,
}

impl Default for IndexStorageConfig {
    fn default() -> Self {
        Self {
            dsn: PathBuf::from("./data/index"),
        }
    }
}

impl IndexStorageConfig {
    pub fn lexical_path(&self) -> PathBuf {
        self.dsn.join("lexical.sqlite")
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderConfig,
    pub index: LlmIndexConfig,
    pub search: LlmSearchConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// `openai` or `offline`.
    pub name: String,
    pub base_url: String,
    pub key: String,
    pub chat_completion_model: String,
    pub embeddings_model: String,
    /// Minimum interval between provider calls; empty disables throttling.
    pub rate_limit: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "offline".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            key: String::new(),
            chat_completion_model: "gpt-4o-mini".to_string(),
            embeddings_model: "text-embedding-3-small".to_string(),
            rate_limit: String::new(),
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl ProviderConfig {
    pub fn rate_limit(&self) -> Result<Option<Duration>> {
        optional_duration(&self.rate_limit)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LlmIndexConfig {
    /// Word budget per section.
    pub max_words: usize,
}

impl Default for LlmIndexConfig {
    fn default() -> Self {
        Self {
            max_words: DEFAULT_MAX_WORDS,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LlmSearchConfig {
    /// Expand vector queries with a hypothetical answer.
    pub hyde: bool,
    /// Filter fused results with an LLM relevance judge.
    pub judge: bool,
    pub lexical_weight: f64,
    pub vector_weight: f64,
    pub max_results: usize,
}

impl Default for LlmSearchConfig {
    fn default() -> Self {
        Self {
            hyde: false,
            judge: false,
            lexical_weight: 1.0,
            vector_weight: 1.0,
            max_results: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TaskRunnerConfig {
    pub uri: String,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            uri: "memory://?parallelism=4&cleanupDelay=10m&cleanupInterval=1m".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FileConverterConfig {
    pub uri: String,
}

impl Default for FileConverterConfig {
    fn default() -> Self {
        Self {
            uri: "extract://".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
            ttl: "5m".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Result<Duration> {
        parse_duration(&self.ttl).context("cache.ttl")
    }
}

// ============ URIs ============

/// Which converters a `file_converter.uri` builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterKind {
    Markdown,
    Extract,
    Pandoc { bin: String, office: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterSpec {
    pub kind: ConverterKind,
    pub rate_limit: Option<Duration>,
}

/// Splits `scheme://?k=v&k=v` into its scheme and query pairs.
fn split_uri(uri: &str) -> Result<(&str, HashMap<&str, &str>)> {
    let (scheme, rest) = uri
        .split_once("://")
        .with_context(|| format!("'{}' is not a URI (missing '://')", uri))?;
    let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .with_context(|| format!("malformed query parameter '{}' in '{}'", pair, uri))?;
        params.insert(k, v);
    }
    Ok((scheme, params))
}

/// Parses `memory://?parallelism=N&cleanupDelay=D&cleanupInterval=I`.
pub fn parse_task_runner_uri(uri: &str) -> Result<RunnerConfig> {
    let (scheme, params) = split_uri(uri)?;
    if scheme != "memory" {
        bail!("unsupported task runner scheme '{}', expected memory://", scheme);
    }
    let mut config = RunnerConfig::default();
    for (key, value) in params {
        match key {
            "parallelism" => {
                config.parallelism = value
                    .parse()
                    .with_context(|| format!("invalid parallelism '{}'", value))?;
                if config.parallelism == 0 {
                    bail!("task runner parallelism must be > 0");
                }
            }
            "cleanupDelay" => config.cleanup_delay = parse_duration(value)?,
            "cleanupInterval" => config.cleanup_interval = parse_duration(value)?,
            other => bail!("unknown task runner option '{}'", other),
        }
    }
    if config.cleanup_interval.is_zero() {
        bail!("task runner cleanupInterval must be > 0");
    }
    Ok(config)
}

/// Parses `markdown://`, `extract://` or `pandoc://?bin=..&office=..`.
pub fn parse_converter_uri(uri: &str) -> Result<ConverterSpec> {
    let (scheme, params) = split_uri(uri)?;
    let mut rate_limit = None;
    let mut bin = "pandoc".to_string();
    let mut office = "soffice".to_string();
    for (key, value) in params {
        match (scheme, key) {
            (_, "rate_limit") => rate_limit = Some(parse_duration(value)?),
            ("pandoc", "bin") => bin = value.to_string(),
            ("pandoc", "office") => office = value.to_string(),
            (_, other) => bail!("unknown option '{}' for {}:// converter", other, scheme),
        }
    }
    let kind = match scheme {
        "markdown" => ConverterKind::Markdown,
        "extract" => ConverterKind::Extract,
        "pandoc" => ConverterKind::Pandoc { bin, office },
        other => bail!(
            "unsupported file converter scheme '{}', expected markdown://, extract:// or pandoc://",
            other
        ),
    };
    Ok(ConverterSpec { kind, rate_limit })
}

/// Parses `250ms`, `10s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        bail!("invalid duration '{}'", s);
    }
    let n: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration '{}'", s))?;
    let d = match unit {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        other => bail!("unknown duration unit '{}' in '{}'", other, s),
    };
    Ok(d)
}

fn optional_duration(s: &str) -> Result<Option<Duration>> {
    if s.trim().is_empty() {
        return Ok(None);
    }
    parse_duration(s).map(Some)
}

// ============ Loading ============

/// Reads, overrides from the process environment, and validates.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env(std::env::vars())?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `QUARRY_*` overrides; unrelated variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            self.set(key, &value)
                .with_context(|| format!("invalid value for {}", name))?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let provider = &mut self.llm.provider;
        match key {
            "HTTP_ADDRESS" => self.http.address = value.to_string(),
            "HTTP_BASE_URL" => self.http.base_url = value.to_string(),
            "STORAGE_DATABASE_DSN" => self.storage.database.dsn = PathBuf::from(value),
            "STORAGE_INDEX_DSN" => self.storage.index.dsn = PathBuf::from(value),
            "LLM_PROVIDER_NAME" => provider.name = value.to_string(),
            "LLM_PROVIDER_BASE_URL" => provider.base_url = value.to_string(),
            "LLM_PROVIDER_KEY" => provider.key = value.to_string(),
            "LLM_PROVIDER_CHAT_COMPLETION_MODEL" => {
                provider.chat_completion_model = value.to_string()
            }
            "LLM_PROVIDER_EMBEDDINGS_MODEL" => provider.embeddings_model = value.to_string(),
            "LLM_PROVIDER_RATE_LIMIT" => provider.rate_limit = value.to_string(),
            "LLM_PROVIDER_MAX_RETRIES" => provider.max_retries = value.parse()?,
            "LLM_PROVIDER_TIMEOUT_SECS" => provider.timeout_secs = value.parse()?,
            "LLM_INDEX_MAX_WORDS" => self.llm.index.max_words = value.parse()?,
            "LLM_SEARCH_HYDE" => self.llm.search.hyde = value.parse()?,
            "LLM_SEARCH_JUDGE" => self.llm.search.judge = value.parse()?,
            "LLM_SEARCH_LEXICAL_WEIGHT" => self.llm.search.lexical_weight = value.parse()?,
            "LLM_SEARCH_VECTOR_WEIGHT" => self.llm.search.vector_weight = value.parse()?,
            "LLM_SEARCH_MAX_RESULTS" => self.llm.search.max_results = value.parse()?,
            "TASK_RUNNER_URI" => self.task_runner.uri = value.to_string(),
            "FILE_CONVERTER_URI" => self.file_converter.uri = value.to_string(),
            "CACHE_ENABLED" => self.cache.enabled = value.parse()?,
            "CACHE_CAPACITY" => self.cache.capacity = value.parse()?,
            "CACHE_TTL" => self.cache.ttl = value.to_string(),
            // Other QUARRY_* variables (e.g. QUARRY_CONFIG) are not options.
            _ => {}
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        // Validate chunking
        if self.llm.index.max_words == 0 {
            bail!("llm.index.max_words must be > 0");
        }

        // Validate provider
        let provider = &self.llm.provider;
        match provider.name.as_str() {
            "offline" => {
                if self.llm.search.judge {
                    bail!("llm.search.judge requires a real provider; the offline provider cannot judge relevance");
                }
            }
            "openai" => {
                if provider.base_url.trim().is_empty() {
                    bail!("llm.provider.base_url must be set when provider is 'openai'");
                }
                if provider.chat_completion_model.trim().is_empty()
                    || provider.embeddings_model.trim().is_empty()
                {
                    bail!("llm.provider models must be set when provider is 'openai'");
                }
            }
            other => bail!(
                "Unknown LLM provider: '{}'. Must be openai or offline.",
                other
            ),
        }
        provider.rate_limit().context("llm.provider.rate_limit")?;
        if provider.timeout_secs == 0 {
            bail!("llm.provider.timeout_secs must be > 0");
        }

        // Validate search
        for (name, w) in [
            ("lexical_weight", self.llm.search.lexical_weight),
            ("vector_weight", self.llm.search.vector_weight),
        ] {
            if !(w.is_finite() && w > 0.0) {
                bail!("llm.search.{} must be a positive number", name);
            }
        }

        parse_task_runner_uri(&self.task_runner.uri).context("task_runner.uri")?;
        parse_converter_uri(&self.file_converter.uri).context("file_converter.uri")?;

        if self.cache.enabled {
            if self.cache.capacity == 0 {
                bail!("cache.capacity must be > 0 when the cache is enabled");
            }
            self.cache.ttl()?;
        }
        Ok(())
    }

    pub fn runner(&self) -> Result<RunnerConfig> {
        parse_task_runner_uri(&self.task_runner.uri)
    }

    pub fn converter(&self) -> Result<ConverterSpec> {
        parse_converter_uri(&self.file_converter.uri)
    }

    /// Directory where uploads wait for their `IndexFile` task.
    pub fn upload_dir(&self) -> PathBuf {
        self.storage.index.dsn.join("uploads")
    }
}
