use crate::cache::PageCache;
use crate::config::ImportConfig;
use crate::fetch::{DumpSource, Fetcher};
use crate::models::DumpInfo;
use crate::parser::{open_dump, StreamEnd};
use crate::pipeline::{InsertionPipeline, ItemFailure, PipelineClosed, PipelineReport};
use crate::stats::{PipelineStats, StatsSnapshot, VelocityTracker};
use crate::store::Store;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const SPINNER_REFRESH: Duration = Duration::from_millis(500);

/// Outcome of one dump.
#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    pub name: String,
    pub info: Option<DumpInfo>,
    /// Set when the dump header could not be decoded; nothing was imported.
    pub open_error: Option<String>,
    /// Articles handed to the pipeline
    pub fed: u64,
    pub stream_end: Option<StreamEnd>,
    pub pipeline: Option<PipelineReport>,
    pub removed: bool,
}

impl DumpReport {
    fn open_failed(name: String, error: String) -> Self {
        Self {
            name,
            info: None,
            open_error: Some(error),
            fed: 0,
            stream_end: None,
            pipeline: None,
            removed: false,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline
            .as_ref()
            .map(|p| p.stats)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub dumps: Vec<DumpReport>,
    pub elapsed: Duration,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl ImportSummary {
    /// Pipeline counters summed over every dump.
    pub fn totals(&self) -> StatsSnapshot {
        self.dumps
            .iter()
            .map(DumpReport::stats)
            .fold(StatsSnapshot::default(), |acc, s| acc + s)
    }

    pub fn failed_opens(&self) -> usize {
        self.dumps.iter().filter(|d| d.open_error.is_some()).count()
    }
}

/// Imports dumps one after the other. The page cache lives as long as the
/// importer, so later dumps resolve against pages written by earlier ones.
pub struct Importer {
    store: Arc<dyn Store>,
    cache: Arc<PageCache>,
    config: ImportConfig,
}

impl Importer {
    pub fn new(store: Arc<dyn Store>, config: ImportConfig) -> Self {
        let cache = Arc::new(PageCache::new(Arc::clone(&store)));
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub async fn run(&self, fetcher: &mut dyn Fetcher) -> Result<ImportSummary> {
        let start = Instant::now();
        let mut dumps = Vec::new();

        while let Some(next) = fetcher.next_dump() {
            let source = next.context("Cannot fetch next dump")?;
            let mut report = self.import_dump(source).await?;

            if self.config.tight && report.open_error.is_none() {
                match fetcher.remove(&report.name) {
                    Ok(()) => report.removed = true,
                    Err(e) => {
                        let reason = format!("{e:#}");
                        warn!(dump = %report.name, error = %reason, "Cannot remove dump");
                    }
                }
            }
            dumps.push(report);
        }

        let summary = ImportSummary {
            dumps,
            elapsed: start.elapsed(),
            cache_entries: self.cache.len(),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
        };
        let totals = summary.totals();
        info!(
            dumps = summary.dumps.len(),
            processed = totals.processed,
            failed = totals.failed,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "Import finished"
        );
        Ok(summary)
    }

    async fn import_dump(&self, source: DumpSource) -> Result<DumpReport> {
        let DumpSource { name, path, reader } = source;
        info!(dump = %name, path = %path.display(), "Importing dump");

        // The header read is blocking I/O
        let opened = tokio::task::spawn_blocking(move || open_dump(reader))
            .await
            .context("Dump header task failed")?;
        let (info, mut stream) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!(dump = %name, error = %e, "Cannot open dump, skipping");
                return Ok(DumpReport::open_failed(name, e.to_string()));
            }
        };
        info!(dump = %name, site = %info.site_name, db = %info.db_name, "Dump opened");

        let mut pipeline = InsertionPipeline::start(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            self.config.pipeline.clone(),
        );
        let drain = pipeline
            .take_errors()
            .map(|errors| tokio::spawn(drain_errors(name.clone(), errors)));
        let progress = ProgressReporter::start(
            name.clone(),
            pipeline.stats(),
            pipeline.velocity(),
            Arc::clone(&self.cache),
            self.config.progress_interval,
            self.config.show_progress,
        );

        let mut fed = 0u64;
        while self.config.limit.map_or(true, |limit| fed < limit) {
            let Some(article) = stream.next().await else {
                break;
            };
            if let Err(PipelineClosed(article)) = pipeline.feed(article).await {
                warn!(dump = %name, page_id = article.id, "Pipeline closed, stopping feed");
                break;
            }
            fed += 1;
        }

        let stream_end = stream.finish().await;
        match &stream_end {
            StreamEnd::Complete { articles } => {
                info!(dump = %name, articles, "Reached end of dump")
            }
            StreamEnd::EndedEarly { articles, reason } => {
                warn!(dump = %name, articles, reason = %reason, "Dump ended early")
            }
            StreamEnd::Abandoned { articles } => {
                info!(dump = %name, articles, "Stopped reading dump")
            }
        }

        let report = pipeline.wait().await;
        if let Some(handle) = drain {
            if let Err(e) = handle.await {
                error!(dump = %name, error = %e, "Error drain task failed");
            }
        }
        progress.finish(&report);

        info!(
            dump = %name,
            processed = report.stats.processed,
            written = report.stats.written,
            skipped = report.stats.skipped,
            failed = report.stats.failed,
            references = report.stats.references_written,
            elapsed_secs = report.elapsed.as_secs_f64(),
            velocity = report.average_velocity(),
            "Dump imported"
        );
        for (percentile, velocity) in &report.velocity {
            debug!(dump = %name, percentile, velocity, "Velocity");
        }

        Ok(DumpReport {
            name,
            info: Some(info),
            open_error: None,
            fed,
            stream_end: Some(stream_end),
            pipeline: Some(report),
            removed: false,
        })
    }
}

async fn drain_errors(dump: String, mut errors: mpsc::UnboundedReceiver<ItemFailure>) {
    while let Some(failure) = errors.recv().await {
        error!(
            dump = %dump,
            page_id = failure.article_id,
            title = %failure.title,
            attempts = failure.attempts,
            error = %failure.error,
            "Article not imported"
        );
    }
}

fn progress_line(
    stats: &PipelineStats,
    velocity: &VelocityTracker,
    cache: &PageCache,
) -> String {
    let rate = match velocity.current() {
        Some((pct, v)) => format!("{v:.1}/s at {pct}% busy"),
        None => "-".to_string(),
    };
    format!(
        "{} processed, {} errors, {rate}, cache {} entries / {} hits",
        stats.processed(),
        stats.failed(),
        cache.len(),
        cache.hits()
    )
}

/// Periodic progress log, mirrored on a spinner when attached to a terminal.
struct ProgressReporter {
    handle: JoinHandle<()>,
    spinner: Option<ProgressBar>,
}

impl ProgressReporter {
    fn start(
        dump: String,
        stats: Arc<PipelineStats>,
        velocity: Arc<VelocityTracker>,
        cache: Arc<PageCache>,
        interval: Duration,
        show_spinner: bool,
    ) -> Self {
        let spinner = show_spinner.then(|| make_spinner(&dump));
        let task_spinner = spinner.clone();
        let handle = tokio::spawn(async move {
            let log_enabled = !interval.is_zero();
            let mut log_tick = tokio::time::interval(interval.max(SPINNER_REFRESH));
            log_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log_tick.tick().await;
            let mut ui_tick = tokio::time::interval(SPINNER_REFRESH);

            loop {
                tokio::select! {
                    _ = log_tick.tick(), if log_enabled => {
                        let v = velocity.current();
                        info!(
                            dump = %dump,
                            processed = stats.processed(),
                            errors = stats.failed(),
                            velocity = v.map(|(_, v)| v).unwrap_or(0.0),
                            percentile = v.map(|(p, _)| p).unwrap_or(0),
                            cache_size = cache.len(),
                            cache_hits = cache.hits(),
                            "Progress"
                        );
                    }
                    _ = ui_tick.tick() => {}
                }
                if let Some(pb) = &task_spinner {
                    pb.set_message(format!("{dump}: {}", progress_line(&stats, &velocity, &cache)));
                }
            }
        });
        Self { handle, spinner }
    }

    fn finish(self, report: &PipelineReport) {
        self.handle.abort();
        if let Some(pb) = self.spinner {
            pb.finish_with_message(format!(
                "{} processed, {} failed in {:.1}s",
                report.stats.processed,
                report.stats.failed,
                report.elapsed.as_secs_f64()
            ));
        }
    }
}

fn make_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(msg.to_string());
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Serves in-memory dumps and records removals.
    struct StaticFetcher {
        dumps: VecDeque<(String, String)>,
        removed: Vec<String>,
        fail_remove: bool,
    }

    impl StaticFetcher {
        fn new(dumps: &[(&str, &str)]) -> Self {
            Self {
                dumps: dumps
                    .iter()
                    .map(|(n, x)| (n.to_string(), x.to_string()))
                    .collect(),
                removed: Vec::new(),
                fail_remove: false,
            }
        }
    }

    impl Fetcher for StaticFetcher {
        fn next_dump(&mut self) -> Option<Result<DumpSource>> {
            let (name, xml) = self.dumps.pop_front()?;
            Some(Ok(DumpSource {
                path: format!("{name}.xml").into(),
                name,
                reader: Box::new(Cursor::new(xml.into_bytes())),
            }))
        }

        fn remove(&mut self, name: &str) -> Result<()> {
            if self.fail_remove {
                return Err(anyhow!("read-only"));
            }
            self.removed.push(name.to_string());
            Ok(())
        }
    }

    fn dump(pages: &[(i64, &str, &str)]) -> String {
        let mut xml = String::from(
            "<mediawiki><siteinfo><sitename>Wikipedia</sitename><dbname>enwiki</dbname></siteinfo>",
        );
        for (id, title, text) in pages {
            xml.push_str(&format!(
                "<page><title>{title}</title><id>{id}</id><revision><id>9{id}</id><text>{text}</text></revision></page>"
            ));
        }
        xml.push_str("</mediawiki>");
        xml
    }

    fn config() -> ImportConfig {
        ImportConfig {
            pipeline: PipelineConfig {
                workers: 2,
                insert_content: true,
                insert_references: true,
                retry_backoff: Duration::ZERO,
                ..PipelineConfig::default()
            },
            progress_interval: Duration::ZERO,
            ..ImportConfig::default()
        }
    }

    #[tokio::test]
    async fn imports_every_dump_in_order() {
        let store = MemoryStore::new();
        let importer = Importer::new(Arc::new(store.clone()), config());
        let first = dump(&[(1, "Rust", "systems"), (2, "Go", "[[Rust]]")]);
        let second = dump(&[(3, "Python", "[[Rust]] [[Go]]")]);
        let mut fetcher = StaticFetcher::new(&[("a", &first), ("b", &second)]);

        let summary = importer.run(&mut fetcher).await.unwrap();

        assert_eq!(summary.dumps.len(), 2);
        assert_eq!(summary.dumps[0].name, "a");
        assert_eq!(summary.dumps[0].fed, 2);
        assert_eq!(
            summary.dumps[0].info.as_ref().unwrap().db_name,
            "enwiki"
        );
        assert_eq!(
            summary.dumps[1].stream_end,
            Some(StreamEnd::Complete { articles: 1 })
        );
        assert_eq!(summary.totals().written, 3);
        assert_eq!(store.page_count(), 3);
        // Pages of the first dump are committed before the second starts
        assert_eq!(store.references(3).len(), 2);
        assert!(fetcher.removed.is_empty());
    }

    #[tokio::test]
    async fn open_failure_does_not_stop_the_run() {
        let store = MemoryStore::new();
        let mut config = config();
        config.tight = true;
        let importer = Importer::new(Arc::new(store.clone()), config);
        let good = dump(&[(1, "Rust", "")]);
        let mut fetcher = StaticFetcher::new(&[("broken", "<mediawiki><page>"), ("good", &good)]);

        let summary = importer.run(&mut fetcher).await.unwrap();

        assert_eq!(summary.failed_opens(), 1);
        assert!(summary.dumps[0].open_error.is_some());
        assert!(!summary.dumps[0].removed);
        assert!(summary.dumps[1].removed);
        assert_eq!(fetcher.removed, vec!["good"]);
        assert_eq!(store.page_count(), 1);
    }

    #[tokio::test]
    async fn limit_caps_articles_per_dump() {
        let store = MemoryStore::new();
        let mut config = config();
        config.limit = Some(2);
        let importer = Importer::new(Arc::new(store.clone()), config);
        let pages: Vec<(i64, String)> = (1..=20).map(|i| (i, format!("Page {i}"))).collect();
        let borrowed: Vec<(i64, &str, &str)> =
            pages.iter().map(|(i, t)| (*i, t.as_str(), "")).collect();
        let xml = dump(&borrowed);
        let mut fetcher = StaticFetcher::new(&[("big", &xml)]);

        let summary = importer.run(&mut fetcher).await.unwrap();

        assert_eq!(summary.dumps[0].fed, 2);
        assert_eq!(store.page_count(), 2);
        assert!(store.page(1).is_some());
        assert!(store.page(2).is_some());
    }

    #[tokio::test]
    async fn removal_failure_is_not_fatal() {
        let store = MemoryStore::new();
        let mut config = config();
        config.tight = true;
        let importer = Importer::new(Arc::new(store), config);
        let xml = dump(&[(1, "Rust", "")]);
        let mut fetcher = StaticFetcher::new(&[("a", &xml)]);
        fetcher.fail_remove = true;

        let summary = importer.run(&mut fetcher).await.unwrap();
        assert!(!summary.dumps[0].removed);
        assert_eq!(summary.totals().written, 1);
    }

    #[tokio::test]
    async fn truncated_dump_keeps_delivered_articles() {
        let store = MemoryStore::new();
        let importer = Importer::new(Arc::new(store.clone()), config());
        let mut xml = dump(&[(1, "Rust", "")]);
        xml.truncate(xml.len() - "</mediawiki>".len());
        xml.push_str("<page><title>Cut</title><id>2</id><revision><text>abc");
        let mut fetcher = StaticFetcher::new(&[("cut", &xml)]);

        let summary = importer.run(&mut fetcher).await.unwrap();

        assert!(matches!(
            summary.dumps[0].stream_end,
            Some(StreamEnd::EndedEarly { articles: 1, .. })
        ));
        assert_eq!(store.page_count(), 1);
    }

    #[tokio::test]
    async fn summary_serializes_to_json() {
        let store = MemoryStore::new();
        let importer = Importer::new(Arc::new(store), config());
        let xml = dump(&[(1, "Rust", "")]);
        let mut fetcher = StaticFetcher::new(&[("a", &xml)]);

        let summary = importer.run(&mut fetcher).await.unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["dumps"][0]["name"], "a");
        assert_eq!(json["dumps"][0]["stream_end"]["status"], "complete");
        assert_eq!(json["dumps"][0]["pipeline"]["stats"]["written"], 1);
    }
}
