//! Aggregation pipeline: concurrent page fetch, per-fragment extraction, title dedup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use xtrobe_adapters::{
    adapter_with_base, extract_page, AstronomyAdapter, LaunchScheduleAdapter, PageRange,
    PageRangeError, SourceAdapter, SpaceNewsAdapter, ASTRONOMY, LAUNCH_SCHEDULE, SPACE_NEWS,
};
use xtrobe_core::{PageRef, Record};
use xtrobe_fetch::{HttpClientConfig, HttpFetcher, PageFetcher};

pub const CRATE_NAME: &str = "xtrobe-sync";

/// The only failure that aborts an aggregation run: the page list could not be built.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("source {0} is disabled")]
    DisabledSource(String),
    #[error("cannot build page range: {0}")]
    PageRange(#[from] PageRangeError),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub first_page: Option<u32>,
    #[serde(default)]
    pub last_page: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    /// Configured page range; a missing `first_page` means 1. `None` keeps the adapter default.
    pub fn page_range(&self) -> Option<PageRange> {
        match (self.first_page, self.last_page) {
            (None, None) => None,
            (first, last) => {
                let first = first.unwrap_or(1);
                Some(PageRange::new(first, last.unwrap_or(first)))
            }
        }
    }
}

impl SourceRegistry {
    /// Built-in sources at their public addresses.
    pub fn builtin() -> Self {
        let source = |source_id: &str, base_url: &str, last_page: Option<u32>| SourceConfig {
            source_id: source_id.to_string(),
            enabled: true,
            base_url: base_url.to_string(),
            first_page: last_page.map(|_| 1),
            last_page,
        };
        Self {
            sources: vec![
                source(SPACE_NEWS, SpaceNewsAdapter::DEFAULT_BASE, None),
                source(ASTRONOMY, AstronomyAdapter::DEFAULT_BASE, None),
                source(
                    LAUNCH_SCHEDULE,
                    LaunchScheduleAdapter::DEFAULT_BASE,
                    Some(LaunchScheduleAdapter::DEFAULT_PAGES),
                ),
            ],
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn adapter(&self, source_id: &str) -> Result<Box<dyn SourceAdapter>, RunFailure> {
        let config = self
            .get(source_id)
            .ok_or_else(|| RunFailure::UnknownSource(source_id.to_string()))?;
        if !config.enabled {
            return Err(RunFailure::DisabledSource(source_id.to_string()));
        }
        adapter_with_base(source_id, &config.base_url, config.page_range())?
            .ok_or_else(|| RunFailure::UnknownSource(source_id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub max_concurrent_fetches: usize,
    pub sources_file: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            user_agent: std::env::var("XTROBE_USER_AGENT").ok(),
            http_timeout_secs: std::env::var("XTROBE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_concurrent_fetches: std::env::var("XTROBE_MAX_CONCURRENT_FETCHES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(AggregateConfig::default().max_concurrent_fetches),
            sources_file: std::env::var("XTROBE_SOURCES_FILE").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AggregateConfig {
    pub max_concurrent_fetches: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateReport {
    pub records: Vec<Record>,
    pub pages_total: usize,
    pub pages_failed: usize,
    pub fragments_total: usize,
    pub fragments_failed: usize,
    pub duplicates_dropped: usize,
}

/// Keep the first record seen for every title, preserving order.
pub fn dedup_by_title(records: Vec<Record>) -> (Vec<Record>, usize) {
    let mut seen = HashSet::new();
    let before = records.len();
    let unique: Vec<Record> = records
        .into_iter()
        .filter(|r| seen.insert(r.title.clone()))
        .collect();
    let dropped = before - unique.len();
    (unique, dropped)
}

pub struct Aggregator {
    fetcher: Arc<dyn PageFetcher>,
    config: AggregateConfig,
}

impl Aggregator {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: AggregateConfig) -> Self {
        Self { fetcher, config }
    }

    pub async fn aggregate(&self, adapter: &dyn SourceAdapter, pages: &[PageRef]) -> Vec<Record> {
        self.aggregate_with_report(adapter, pages).await.records
    }

    /// Fetch every page concurrently (bounded by `max_concurrent_fetches`), extract records in
    /// page-then-document order and dedup by title over the merged sequence.
    pub async fn aggregate_with_report(
        &self,
        adapter: &dyn SourceAdapter,
        pages: &[PageRef],
    ) -> AggregateReport {
        let limit = self.config.max_concurrent_fetches.max(1);
        // Owned refs keep the fan-out future `Send` for the web handlers.
        let fetched = stream::iter(pages.iter().cloned())
            .map(|page| {
                let fetcher = Arc::clone(&self.fetcher);
                async move {
                    let outcome = fetcher.fetch(&page).await;
                    (page, outcome)
                }
            })
            .buffered(limit)
            .collect::<Vec<_>>()
            .await;

        let mut report = AggregateReport {
            pages_total: pages.len(),
            ..Default::default()
        };
        let mut merged = Vec::new();

        for (page, outcome) in fetched {
            let raw = match outcome {
                Ok(raw) => raw,
                Err(err) => {
                    report.pages_failed += 1;
                    warn!(source_id = %page.source_id, page = page.index, url = %page.url, error = %err, "page fetch failed");
                    continue;
                }
            };

            let extraction = extract_page(adapter, &raw.body);
            report.fragments_total += extraction.fragment_count();
            for (position, outcome) in extraction.outcomes.into_iter().enumerate() {
                match outcome {
                    Ok(record) => merged.push(record),
                    Err(err) => {
                        report.fragments_failed += 1;
                        warn!(source_id = %page.source_id, page = page.index, fragment = position, error = %err, "skipping fragment");
                    }
                }
            }
        }

        let (records, dropped) = dedup_by_title(merged);
        report.duplicates_dropped = dropped;
        report.records = records;

        info!(
            source_id = adapter.source_id(),
            pages = report.pages_total,
            pages_failed = report.pages_failed,
            fragments = report.fragments_total,
            fragments_failed = report.fragments_failed,
            duplicates = report.duplicates_dropped,
            records = report.records.len(),
            "aggregation finished"
        );
        report
    }
}

pub struct SyncPipeline {
    registry: SourceRegistry,
    aggregator: Aggregator,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let registry = match &config.sources_file {
            Some(path) => SourceRegistry::load(path).await?,
            None => SourceRegistry::builtin(),
        };
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        Ok(Self::with_fetcher(
            registry,
            Arc::new(http),
            AggregateConfig {
                max_concurrent_fetches: config.max_concurrent_fetches,
            },
        ))
    }

    pub fn with_fetcher(
        registry: SourceRegistry,
        fetcher: Arc<dyn PageFetcher>,
        config: AggregateConfig,
    ) -> Self {
        Self {
            registry,
            aggregator: Aggregator::new(fetcher, config),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Aggregate one source over its configured page range.
    pub async fn run_source(&self, source_id: &str) -> Result<AggregateReport, RunFailure> {
        let adapter = self.registry.adapter(source_id)?;
        let range = adapter.default_pages();
        self.run_adapter(adapter.as_ref(), range).await
    }

    pub async fn run_source_pages(
        &self,
        source_id: &str,
        range: PageRange,
    ) -> Result<AggregateReport, RunFailure> {
        let adapter = self.registry.adapter(source_id)?;
        self.run_adapter(adapter.as_ref(), range).await
    }

    async fn run_adapter(
        &self,
        adapter: &dyn SourceAdapter,
        range: PageRange,
    ) -> Result<AggregateReport, RunFailure> {
        let pages = adapter.page_refs(range)?;
        debug!(source_id = adapter.source_id(), pages = pages.len(), "dispatching page fetches");
        Ok(self.aggregator.aggregate_with_report(adapter, &pages).await)
    }
}

pub async fn run_source_once_from_env(source_id: &str) -> Result<AggregateReport> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
    pipeline
        .run_source(source_id)
        .await
        .with_context(|| format!("aggregating {source_id}"))
}
