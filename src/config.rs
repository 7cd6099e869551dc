use std::time::Duration;

/// Articles buffered between the XML decoder and the pipeline intake
pub const STREAM_QUEUE_CAPACITY: usize = 10;

/// Articles buffered between `feed` and the workers
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;

/// Retries after the first failed attempt before an item is given up
pub const DEFAULT_RETRY_LIMIT: u32 = 15;

/// Workers per available CPU
pub const WORKERS_PER_CPU: usize = 2;

/// First retry delay; doubles on every further attempt
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound for the retry delay
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Progress line interval
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Buffer size for dump file readers (1 MiB)
pub const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Meta namespaces, English and French. Articles titled `<prefix>:...` are not
/// imported.
pub const DEFAULT_IGNORED_PREFIXES: &[&str] = &[
    "wikipedia",
    "template",
    "project",
    "portal",
    "category",
    "draft",
    "module",
    "list",
    "wikipédia",
    "modèle",
    "projet",
    "portail",
    "catégorie",
    "ébauche",
    "liste",
];

pub fn default_ignored_prefixes() -> Vec<String> {
    DEFAULT_IGNORED_PREFIXES
        .iter()
        .map(|p| p.to_string())
        .collect()
}

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * WORKERS_PER_CPU
}

/// How link candidates matching an ignored namespace are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// The prefix is detected but the link is kept; normalization strips the
    /// namespace anyway, so `[[Category:Foo]]` counts as a reference to "foo".
    #[default]
    Legacy,
    /// Links into an ignored namespace are dropped before normalization.
    Exclude,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub retry_limit: u32,
    pub queue_depth: usize,
    pub insert_content: bool,
    pub insert_references: bool,
    pub ignored_prefixes: Vec<String>,
    pub filter_mode: FilterMode,
    pub retry_backoff: Duration,
    /// Deadline for one attempt of the write recipe
    pub transaction_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            insert_content: false,
            insert_references: false,
            ignored_prefixes: default_ignored_prefixes(),
            filter_mode: FilterMode::default(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            transaction_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub pipeline: PipelineConfig,
    /// Remove each dump from disk once it has been imported
    pub tight: bool,
    /// Stop feeding a dump after this many articles
    pub limit: Option<u64>,
    pub progress_interval: Duration,
    pub show_progress: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            tight: false,
            limit: None,
            progress_interval: PROGRESS_INTERVAL,
            show_progress: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry_limit, 15);
        assert_eq!(config.queue_depth, 1000);
        assert!(config.workers >= WORKERS_PER_CPU);
        assert_eq!(config.filter_mode, FilterMode::Legacy);
        assert!(!config.insert_content);
        assert!(!config.insert_references);
    }

    #[test]
    fn default_prefixes_are_lowercase() {
        for prefix in default_ignored_prefixes() {
            assert_eq!(prefix, prefix.to_lowercase());
            assert!(!prefix.ends_with(':'));
        }
    }
}
