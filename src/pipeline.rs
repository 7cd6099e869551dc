//! Bounded worker pool that writes articles to the store.
//!
//! `feed` pushes into a bounded intake queue (`queue_depth`); once it is full
//! the caller waits. `workers` tasks share the queue and run the write recipe
//! for one article at a time, each attempt in its own transaction:
//!
//! 1. titles in an ignored namespace are skipped
//! 2. `page` row: delete, insert
//! 3. `page_content` row: delete, insert (when enabled)
//! 4. `article_reference` rows: delete, bulk insert of the resolved references
//!    (when enabled)
//! 5. commit
//!
//! A failed attempt is rolled back and the whole recipe runs again, up to
//! `retry_limit` more times. Items that still fail are reported on the error
//! channel and never stop the pool.

use crate::cache::PageCache;
use crate::config::{PipelineConfig, MAX_RETRY_BACKOFF};
use crate::models::{Article, ResolvedReference};
use crate::references::{extract_references, merge_resolved, NamespaceFilter};
use crate::stats::{PipelineStats, StatsSnapshot, VelocityTracker};
use crate::store::{Statement, Store, StoreError, StoreTransaction};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("page lookup failed: {0}")]
    Lookup(#[source] StoreError),
    #[error("BEGIN failed: {0}")]
    Begin(#[source] StoreError),
    #[error("{statement} failed: {source}")]
    Statement {
        statement: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("COMMIT failed: {0}")]
    Commit(#[source] StoreError),
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),
}

/// An article that exhausted its retry budget.
#[derive(Debug, Error)]
#[error("inserting {title} ({article_id}) failed after {attempts} attempts: {error}")]
pub struct ItemFailure {
    pub article_id: i64,
    pub title: String,
    pub attempts: u32,
    #[source]
    pub error: WriteError,
}

/// Returned by `feed` once the pool no longer accepts work; hands the article back.
#[derive(Debug, Error)]
#[error("insertion pipeline is closed")]
pub struct PipelineClosed(pub Article);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written {
        content: bool,
        references: usize,
        unresolved: usize,
    },
    /// Meta page; nothing was written.
    Skipped,
}

/// Runs the per-article write recipe against the store.
pub struct ArticleWriter {
    store: Arc<dyn Store>,
    cache: Arc<PageCache>,
    insert_content: bool,
    insert_references: bool,
    /// Lowercase, colon included
    ignored_prefixes: Vec<String>,
    filter: NamespaceFilter,
}

impl ArticleWriter {
    pub fn new(store: Arc<dyn Store>, cache: Arc<PageCache>, config: &PipelineConfig) -> Self {
        Self {
            store,
            cache,
            insert_content: config.insert_content,
            insert_references: config.insert_references,
            ignored_prefixes: config
                .ignored_prefixes
                .iter()
                .map(|p| format!("{}:", p.trim().to_lowercase()))
                .collect(),
            filter: NamespaceFilter::new(&config.ignored_prefixes, config.filter_mode),
        }
    }

    pub fn is_ignored(&self, article: &Article) -> bool {
        let lower = article.lower_title();
        self.ignored_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()))
    }

    /// Extracts the references of `article` and resolves them through the page
    /// cache. Returns the merged references and how many titles did not resolve.
    pub async fn resolve_references(
        &self,
        article: &Article,
    ) -> Result<(Vec<ResolvedReference>, usize), StoreError> {
        let references = extract_references(&article.text, &self.filter);
        let mut resolved = Vec::with_capacity(references.len());
        let mut unresolved = 0;

        for reference in references {
            match self.cache.lookup(&reference.title).await? {
                Some(target_id) => resolved.push((reference, target_id)),
                None => {
                    unresolved += 1;
                    debug!(
                        page_id = article.id,
                        target = %reference.title,
                        "Reference target not found"
                    );
                }
            }
        }

        Ok((merge_resolved(resolved), unresolved))
    }

    /// One attempt of the recipe. Lookups happen before the transaction opens so
    /// no connection is held while the cache queries the store.
    pub async fn write(&self, article: &Article) -> Result<WriteOutcome, WriteError> {
        if self.is_ignored(article) {
            debug!(page_id = article.id, title = %article.title, "Ignoring meta page");
            return Ok(WriteOutcome::Skipped);
        }

        let lower_title = article.lower_title();
        let (references, unresolved) = if self.insert_references {
            self.resolve_references(article)
                .await
                .map_err(WriteError::Lookup)?
        } else {
            (Vec::new(), 0)
        };

        let mut tx = self.store.begin().await.map_err(WriteError::Begin)?;
        if let Err(e) = self
            .run_statements(tx.as_mut(), article, &lower_title, &references)
            .await
        {
            if let Err(rollback) = tx.rollback().await {
                warn!(page_id = article.id, error = %rollback, "Rollback failed");
            }
            return Err(e);
        }
        tx.commit().await.map_err(WriteError::Commit)?;

        self.cache.record(&lower_title, article.id);

        Ok(WriteOutcome::Written {
            content: self.insert_content,
            references: references.len(),
            unresolved,
        })
    }

    async fn run_statements(
        &self,
        tx: &mut dyn StoreTransaction,
        article: &Article,
        lower_title: &str,
        references: &[ResolvedReference],
    ) -> Result<(), WriteError> {
        let page_id = article.id;

        execute(tx, Statement::DeletePage { page_id }).await?;
        execute(
            tx,
            Statement::InsertPage {
                page_id,
                title: &article.title,
                lower_title,
            },
        )
        .await?;

        if self.insert_content {
            execute(tx, Statement::DeleteContent { page_id }).await?;
            execute(
                tx,
                Statement::InsertContent {
                    page_id,
                    content: &article.text,
                },
            )
            .await?;
        }

        if self.insert_references {
            execute(tx, Statement::DeleteReferences { page_id }).await?;
            if !references.is_empty() {
                execute(
                    tx,
                    Statement::InsertReferences {
                        page_id,
                        references,
                    },
                )
                .await?;
            }
        }

        Ok(())
    }
}

async fn execute(
    tx: &mut dyn StoreTransaction,
    statement: Statement<'_>,
) -> Result<(), WriteError> {
    let kind = statement.kind();
    tx.execute(statement)
        .await
        .map_err(|source| WriteError::Statement {
            statement: kind,
            source,
        })
}

/// Exponential delay before retry number `retry` (1-based), capped.
pub fn retry_delay(base: Duration, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    /// Velocity per busy-worker percentile
    pub velocity: Vec<(u8, f64)>,
    pub current_velocity: Option<(u8, f64)>,
}

impl PipelineReport {
    /// Completed items per second over the whole run.
    pub fn average_velocity(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.stats.processed as f64 / secs
        } else {
            0.0
        }
    }
}

struct WorkerContext {
    writer: ArticleWriter,
    retry_limit: u32,
    retry_backoff: Duration,
    transaction_timeout: Option<Duration>,
    stats: Arc<PipelineStats>,
    velocity: Arc<VelocityTracker>,
    busy: AtomicUsize,
    capacity: usize,
    errors: mpsc::UnboundedSender<ItemFailure>,
}

impl WorkerContext {
    async fn attempt(&self, article: &Article) -> Result<WriteOutcome, WriteError> {
        match self.transaction_timeout {
            Some(limit) => tokio::time::timeout(limit, self.writer.write(article))
                .await
                .unwrap_or(Err(WriteError::Timeout(limit))),
            None => self.writer.write(article).await,
        }
    }

    async fn process(&self, article: Article) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.attempt(&article).await {
                Ok(outcome) => {
                    self.record_success(outcome);
                    return;
                }
                Err(error) if attempts <= self.retry_limit => {
                    self.stats.inc_retries();
                    debug!(
                        page_id = article.id,
                        attempt = attempts,
                        error = %error,
                        "Write failed, retrying"
                    );
                    let delay = retry_delay(self.retry_backoff, attempts);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => {
                    self.stats.inc_failed();
                    warn!(
                        page_id = article.id,
                        attempts,
                        error = %error,
                        "Giving up on article"
                    );
                    let failure = ItemFailure {
                        article_id: article.id,
                        title: article.title,
                        attempts,
                        error,
                    };
                    // Nobody listening is fine; the failure is already counted.
                    let _ = self.errors.send(failure);
                    return;
                }
            }
        }
    }

    fn record_success(&self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written {
                content,
                references,
                unresolved,
            } => {
                self.stats.inc_written();
                if content {
                    self.stats.inc_contents();
                }
                self.stats.add_references(references as u64);
                self.stats.add_unresolved(unresolved as u64);
            }
            WriteOutcome::Skipped => self.stats.inc_skipped(),
        }
    }
}

async fn run_worker(
    worker: usize,
    ctx: Arc<WorkerContext>,
    intake: Arc<Mutex<mpsc::Receiver<Article>>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            debug!(worker, "Worker cancelled");
            break;
        }

        let next = {
            let mut rx = intake.lock().await;
            tokio::select! {
                biased;
                _ = cancel.changed() => None,
                article = rx.recv() => article,
            }
        };
        let Some(article) = next else {
            break;
        };

        ctx.busy.fetch_add(1, Ordering::Relaxed);
        ctx.process(article).await;
        let busy = ctx.busy.fetch_sub(1, Ordering::Relaxed);
        ctx.velocity.record(busy, ctx.capacity);
    }
}

pub struct InsertionPipeline {
    intake: mpsc::Sender<Article>,
    workers: Vec<JoinHandle<()>>,
    errors: Option<mpsc::UnboundedReceiver<ItemFailure>>,
    stats: Arc<PipelineStats>,
    velocity: Arc<VelocityTracker>,
    cancel: watch::Sender<bool>,
    started: Instant,
}

impl InsertionPipeline {
    /// Spawns the workers on the current tokio runtime.
    pub fn start(store: Arc<dyn Store>, cache: Arc<PageCache>, config: PipelineConfig) -> Self {
        let worker_count = config.workers.max(1);
        let queue_depth = config.queue_depth.max(1);

        let (intake_tx, intake_rx) = mpsc::channel(queue_depth);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stats = Arc::new(PipelineStats::new());
        let velocity = Arc::new(VelocityTracker::new());

        let ctx = Arc::new(WorkerContext {
            writer: ArticleWriter::new(store, cache, &config),
            retry_limit: config.retry_limit,
            retry_backoff: config.retry_backoff,
            transaction_timeout: config.transaction_timeout,
            stats: Arc::clone(&stats),
            velocity: Arc::clone(&velocity),
            busy: AtomicUsize::new(0),
            capacity: worker_count,
            errors: error_tx,
        });

        let intake_rx = Arc::new(Mutex::new(intake_rx));
        let workers = (0..worker_count)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&ctx),
                    Arc::clone(&intake_rx),
                    cancel_rx.clone(),
                ))
            })
            .collect();

        info!(
            workers = worker_count,
            queue_depth,
            retry_limit = config.retry_limit,
            content = config.insert_content,
            references = config.insert_references,
            "Insertion pipeline started"
        );

        Self {
            intake: intake_tx,
            workers,
            errors: Some(error_rx),
            stats,
            velocity,
            cancel: cancel_tx,
            started: Instant::now(),
        }
    }

    /// Queues an article, waiting while the intake queue is full.
    pub async fn feed(&self, article: Article) -> Result<(), PipelineClosed> {
        if *self.cancel.borrow() {
            return Err(PipelineClosed(article));
        }
        self.intake
            .send(article)
            .await
            .map_err(|e| PipelineClosed(e.0))
    }

    /// Receiver of permanently failed items. Can be taken once.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ItemFailure>> {
        self.errors.take()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn velocity(&self) -> Arc<VelocityTracker> {
        Arc::clone(&self.velocity)
    }

    pub fn current_velocity(&self) -> Option<(u8, f64)> {
        self.velocity.current()
    }

    /// Workers stop after their current item; queued items are abandoned and
    /// further `feed` calls fail.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Closes the intake, lets the workers drain everything already queued and
    /// waits for all of them to exit.
    pub async fn wait(self) -> PipelineReport {
        let InsertionPipeline {
            intake,
            workers,
            errors: _,
            stats,
            velocity,
            cancel,
            started,
        } = self;

        drop(intake);
        let mut running: FuturesUnordered<_> = workers.into_iter().collect();
        while let Some(joined) = running.next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pipeline worker panicked");
            }
        }
        drop(cancel);

        let report = PipelineReport {
            stats: stats.snapshot(),
            elapsed: started.elapsed(),
            velocity: velocity.histogram(),
            current_velocity: velocity.current(),
        };
        info!(
            processed = report.stats.processed,
            failed = report.stats.failed,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Insertion pipeline drained"
        );
        report
    }
}
