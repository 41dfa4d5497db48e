use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::oci::OciRegistry;
use crate::package::Package;
use crate::pusher::PushReceipt;
use crate::repo::{PackageRepo, TagCache};

/// Timeout for streaming archive downloads from upstream; registry
/// requests use the much shorter configured timeout.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

struct Counters {
    packages_done: u64,
    window_start: Instant,
}

/// State shared by every task of one controller run: the upstream HTTP
/// client, the registry session, the dispatch rate gate, throughput
/// counters, the tag-listing cache and the cancellation flag.
pub struct RunContext {
    pub client: Client,
    pub registry: OciRegistry,
    pub config: Config,
    pub tags: TagCache,
    rate_limit: Duration,
    last_interaction: tokio::sync::Mutex<Option<Instant>>,
    counters: std::sync::Mutex<Counters>,
    cancelled: AtomicBool,
}

impl RunContext {
    pub fn new(config: Config, registry: OciRegistry) -> Result<Self> {
        let client = Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| crate::error::MirrorError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            registry,
            rate_limit: Duration::from_millis(config.rate_limit_ms),
            config,
            tags: TagCache::default(),
            last_interaction: tokio::sync::Mutex::new(None),
            counters: std::sync::Mutex::new(Counters {
                packages_done: 0,
                window_start: Instant::now(),
            }),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Gate networked work to one dispatch per rate-limit interval. The
    /// gate is held while sleeping so concurrent workers queue behind it.
    pub async fn wait_turn(&self) {
        let mut last = self.last_interaction.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.rate_limit {
                let pause = self.rate_limit - elapsed;
                debug!("Rate limit sleep for {pause:?}");
                tokio::time::sleep(pause).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Bump the package counter, reporting throughput every 10 packages
    /// and restarting the measurement window every 50.
    pub fn record_package(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.packages_done += 1;
        if counters.packages_done % 10 == 0 {
            let minutes = counters.window_start.elapsed().as_secs_f64() / 60.0;
            if minutes > 0.0 {
                info!(
                    "Average packages per minute: {:.1}",
                    counters.packages_done as f64 / minutes
                );
            }
        }
        if counters.packages_done % 50 == 0 {
            counters.packages_done = 0;
            counters.window_start = Instant::now();
        }
    }

    pub fn reset_counters(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.packages_done = 0;
        counters.window_start = Instant::now();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What a completed task produced.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Pushed(PushReceipt),
    Pulled(PathBuf),
}

/// A unit of work drawn from the runner's queue.
pub enum Task {
    /// Download, verify, publish and clean up one package archive.
    PackageUpload {
        package: Package,
        dry_run: bool,
        extra_tags: Vec<String>,
    },
    /// Publish the channel index of one subdirectory.
    RepoUpload {
        repo: PackageRepo,
        root: PathBuf,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Materialize registry layers of one artifact locally.
    Download {
        uri: String,
        media_type: String,
        dest: PathBuf,
    },
}

impl Task {
    pub fn describe(&self) -> String {
        match self {
            Task::PackageUpload { package, .. } => {
                format!("upload of {}/{}", package.subdir, package.filename)
            }
            Task::RepoUpload { repo, .. } => format!("index publish for {}", repo.name()),
            Task::Download { uri, .. } => format!("download of {uri}"),
        }
    }

    /// Run the task. Failures that only concern the package at hand are
    /// logged and swallowed so the rest of the run proceeds; everything
    /// else propagates to the runner.
    pub async fn run(&mut self, ctx: &RunContext) -> Result<Vec<TaskOutcome>> {
        if ctx.is_cancelled() {
            debug!("Draining {}", self.describe());
            return Ok(Vec::new());
        }
        match self.execute(ctx).await {
            Ok(outcomes) => Ok(outcomes),
            Err(e) if e.is_skippable() => {
                warn!("Skipping {}: {e}", self.describe());
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&mut self, ctx: &RunContext) -> Result<Vec<TaskOutcome>> {
        match self {
            Task::PackageUpload {
                package,
                dry_run,
                extra_tags,
            } => {
                package.ensure_file(&ctx.client, &ctx.config).await?;
                ctx.wait_turn().await;
                let receipts = package
                    .upload(&ctx.registry, *dry_run, extra_tags, None)
                    .await?;
                ctx.record_package();
                package.delete()?;
                Ok(receipts.into_iter().map(TaskOutcome::Pushed).collect())
            }
            Task::RepoUpload {
                repo,
                root,
                timestamp,
            } => {
                ctx.wait_turn().await;
                let receipts = repo.upload(&ctx.registry, root, *timestamp).await?;
                Ok(receipts.into_iter().map(TaskOutcome::Pushed).collect())
            }
            Task::Download {
                uri,
                media_type,
                dest,
            } => {
                ctx.wait_turn().await;
                let (repository, tag) = ctx.registry.split_uri(uri)?;
                let paths = ctx
                    .registry
                    .pull_by_media_type(&repository, &tag, dest, media_type)
                    .await?;
                Ok(paths.into_iter().map(TaskOutcome::Pulled).collect())
            }
        }
    }
}
