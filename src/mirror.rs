use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use reqwest::Client;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{MirrorError, Result};
use crate::oci::OciRegistry;
use crate::package::{encode_tag, registry_name, Package};
use crate::pusher::PushReceipt;
use crate::repo::{PackageRepo, RepoData, REPODATA_MEDIA_TYPE};
use crate::runner::TaskRunner;
use crate::tasks::{RunContext, Task, TaskOutcome};

/// The platform subdirectories of a conda channel.
pub const DEFAULT_SUBDIRS: &[&str] = &[
    "linux-64",
    "osx-64",
    "osx-arm64",
    "win-64",
    "linux-aarch64",
    "linux-ppc64le",
    "noarch",
];

/// Listing of undistributable conda-forge packages.
pub const FORBIDDEN_PACKAGE_URL: &str =
    "https://raw.githubusercontent.com/conda-forge/repodata-tools/main/repodata_tools/metadata.json";

pub const DEFAULT_REGISTRY: &str = "ghcr.io/channel-mirrors";

/// Fetch the conda-forge list of package names that must not be
/// redistributed.
pub async fn get_forbidden_packages(client: &Client) -> Result<Vec<String>> {
    let response = client
        .get(FORBIDDEN_PACKAGE_URL)
        .send()
        .await
        .map_err(|e| MirrorError::Transient(e.to_string()))?;
    if !response.status().is_success() {
        return Err(MirrorError::from_status(
            response.status(),
            format!("cannot retrieve forbidden packages from {FORBIDDEN_PACKAGE_URL}"),
        ));
    }
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| MirrorError::Transient(e.to_string()))?;
    Ok(parse_forbidden(&body))
}

fn parse_forbidden(body: &serde_json::Value) -> Vec<String> {
    match body.get("undistributable") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// The external tool that rebuilds a channel's `repodata.json` from the
/// archives on disk. Only its invocation is modeled here.
#[derive(Debug, Clone)]
pub struct ChannelIndexer {
    program: String,
}

impl Default for ChannelIndexer {
    fn default() -> Self {
        Self {
            program: "conda".to_string(),
        }
    }
}

impl ChannelIndexer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub async fn run(&self, channel_root: &Path) -> Result<()> {
        info!("Indexing {}", channel_root.display());
        let status = tokio::process::Command::new(&self.program)
            .arg("index")
            .arg(channel_root)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(MirrorError::LocalIo)?;
        if !status.success() {
            return Err(MirrorError::LocalIo(std::io::Error::other(format!(
                "indexer exited with {status}"
            ))));
        }
        Ok(())
    }
}

/// Top-level coordinator binding a channel to a registry.
pub struct Mirror {
    channel: String,
    subdirs: Vec<String>,
    packages: Vec<String>,
    registry_spec: String,
    cache_dir: PathBuf,
    config: Config,
    runner: TaskRunner,
    indexer: ChannelIndexer,
}

impl Mirror {
    pub fn new(
        channel: Option<String>,
        subdirs: Option<Vec<String>>,
        packages: Option<Vec<String>>,
        registry: Option<String>,
        cache_dir: Option<PathBuf>,
        config: Config,
    ) -> Self {
        let mirror = Self {
            channel: channel.unwrap_or_else(|| "conda-forge".to_string()),
            subdirs: subdirs
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SUBDIRS.iter().map(|s| s.to_string()).collect()),
            packages: packages.unwrap_or_default(),
            registry_spec: registry.unwrap_or_else(|| DEFAULT_REGISTRY.to_string()),
            cache_dir: cache_dir.unwrap_or_else(|| {
                std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("cache")
            }),
            runner: TaskRunner::new(config.workers),
            indexer: ChannelIndexer::default(),
            config,
        };
        mirror.announce();
        mirror
    }

    pub fn with_indexer(mut self, indexer: ChannelIndexer) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subdirs(&self) -> &[String] {
        &self.subdirs
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn registry(&self) -> &str {
        &self.registry_spec
    }

    fn announce(&self) {
        info!("Using cache dir: {}", self.cache_dir.display());
        info!("Mirroring : {}", self.channel);
        info!("  Subdirs : {:?}", self.subdirs);
        info!("  Packages: {:?}", self.packages);
        info!("To: {}", self.registry_spec);
    }

    fn channel_root(&self) -> PathBuf {
        self.cache_dir.join(&self.channel)
    }

    fn run_context(&self) -> Result<RunContext> {
        let registry = OciRegistry::new(&self.registry_spec, &self.config)?;
        RunContext::new(self.config.clone(), registry)
    }

    async fn run_tasks(
        &self,
        ctx: &RunContext,
        tasks: Vec<Task>,
        serial: bool,
    ) -> Result<Vec<TaskOutcome>> {
        if serial {
            self.runner.run_serial(ctx, tasks).await
        } else {
            self.runner.run(ctx, tasks).await
        }
    }

    /// Packages that must be skipped for this channel.
    async fn skip_list(&self, ctx: &RunContext) -> Vec<String> {
        if self.channel != "conda-forge" {
            return Vec::new();
        }
        match get_forbidden_packages(&ctx.client).await {
            Ok(names) => {
                info!("Skipping {} undistributable package(s)", names.len());
                names
            }
            Err(e) => {
                warn!("Cannot retrieve forbidden packages: {e}");
                Vec::new()
            }
        }
    }

    /// Mirror missing archives from upstream into the registry, then
    /// publish each subdirectory's channel index. Returns every push
    /// receipt; in a dry run nothing is uploaded.
    pub async fn update(
        &self,
        dry_run: bool,
        serial: bool,
        include_yanked: bool,
    ) -> Result<Vec<PushReceipt>> {
        let ctx = self.run_context()?;
        let skips = self.skip_list(&ctx).await;
        let mut receipts = Vec::new();

        for subdir in &self.subdirs {
            let repo = PackageRepo::new(&self.channel, subdir, &self.cache_dir);
            repo.ensure_repodata(&ctx.client, &self.config.upstream_url)
                .await?;

            let candidates = match repo
                .find_packages(&ctx.registry, &ctx.tags, &self.packages, &skips, include_yanked)
                .await
            {
                Ok(candidates) => candidates,
                Err(e @ MirrorError::Auth(_)) if dry_run => {
                    warn!("Cannot list existing tags for {}: {e}", repo.name());
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            info!(
                "Found {} candidate package(s) for {}",
                candidates.len(),
                repo.name()
            );

            let tasks: Vec<Task> = candidates
                .into_iter()
                .map(|(filename, package_info)| Task::PackageUpload {
                    package: Package::new(&self.channel, subdir, &filename, repo.cache_dir())
                        .with_info(package_info),
                    dry_run,
                    extra_tags: Vec::new(),
                })
                .collect();
            let outcomes = self.run_tasks(&ctx, tasks, serial).await?;
            receipts.extend(pushed(outcomes));

            if dry_run {
                info!(
                    "Would push {} to {}, skipping for dry-run.",
                    repo.name(),
                    self.registry_spec
                );
                continue;
            }

            // The index publish is the commit point of this subdir: it
            // runs only once every package task above has completed.
            let index_task = Task::RepoUpload {
                repo,
                root: self.channel_root(),
                timestamp: None,
            };
            let outcomes = self.run_tasks(&ctx, vec![index_task], serial).await?;
            receipts.extend(pushed(outcomes));
        }

        Ok(receipts)
    }

    /// Pull each subdirectory's `latest` channel index and the latest
    /// archive of every package it lists into the local cache.
    pub async fn pull_latest(&self, dry_run: bool, serial: bool) -> Result<Vec<PathBuf>> {
        let ctx = self.run_context()?;
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut tasks = Vec::new();

        for subdir in &self.subdirs {
            let repo = PackageRepo::new(&self.channel, subdir, &self.cache_dir);
            let repository = ctx
                .registry
                .repository(&format!("{}/{}/repodata.json", self.channel, subdir));
            let pulled = ctx
                .registry
                .pull_by_media_type(&repository, "latest", &self.channel_root(), REPODATA_MEDIA_TYPE)
                .await;
            let repodata_path = match pulled {
                Ok(mut paths) if !paths.is_empty() => paths.remove(0),
                Ok(_) => {
                    warn!("No channel index published for {}", repo.name());
                    continue;
                }
                Err(e) => {
                    warn!("Cannot pull channel index for {}: {e}", repo.name());
                    continue;
                }
            };

            let data = RepoData::load(&repodata_path)?;
            for name in data.package_names() {
                let Some((filename, package_info)) = data.get_latest_entry(&name) else {
                    continue;
                };
                let media_type = RepoData::get_package_mediatype(filename)?;
                let tag = encode_tag(&format!(
                    "{}-{}",
                    package_info.version, package_info.build
                ));
                let uri = format!(
                    "{}/{}/{}/{}:{}",
                    self.registry_spec,
                    self.channel,
                    subdir,
                    registry_name(&name),
                    tag
                );
                if seen.insert((uri.clone(), media_type.to_string())) {
                    tasks.push(Task::Download {
                        uri,
                        media_type: media_type.to_string(),
                        dest: repo.cache_dir().to_path_buf(),
                    });
                }
            }
        }

        if dry_run {
            info!("Would pull {} artifact(s), skipping for dry-run.", tasks.len());
            return Ok(Vec::new());
        }

        let outcomes = self.run_tasks(&ctx, tasks, serial).await?;
        Ok(outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                TaskOutcome::Pulled(path) => Some(path),
                TaskOutcome::Pushed(_) => None,
            })
            .collect())
    }

    /// Push local archives that the upstream index does not know about.
    pub async fn push_new(&self, dry_run: bool, serial: bool) -> Result<Vec<PushReceipt>> {
        self.push_cache(dry_run, serial, false).await
    }

    /// Push every local archive, new or not.
    pub async fn push_all(&self, dry_run: bool, serial: bool) -> Result<Vec<PushReceipt>> {
        self.push_cache(dry_run, serial, true).await
    }

    async fn push_cache(&self, dry_run: bool, serial: bool, all: bool) -> Result<Vec<PushReceipt>> {
        let ctx = self.run_context()?;
        let timestamp = Utc::now();
        let mut receipts = Vec::new();

        for subdir in &self.subdirs {
            let repo = PackageRepo::new(&self.channel, subdir, &self.cache_dir);
            fs::create_dir_all(repo.cache_dir())?;

            // The regenerated index only determines which archives are
            // new; the upstream file stays authoritative and is restored
            // afterwards.
            let repodata = repo.repodata_path();
            let backup = repo.cache_dir().join("original_repodata.json");
            if repodata.exists() {
                fs::copy(&repodata, &backup)?;
            }
            self.indexer.run(&self.channel_root()).await?;

            let known = if backup.exists() {
                RepoData::load(&backup)?
            } else {
                RepoData::default()
            };
            let known_files: HashSet<String> = known.package_archives().into_iter().collect();

            let mut tasks = Vec::new();
            for entry in fs::read_dir(repo.cache_dir())? {
                let path = entry?.path();
                let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !filename.ends_with(".tar.bz2") && !filename.ends_with(".conda") {
                    continue;
                }
                if !all && known_files.contains(filename) {
                    continue;
                }
                info!("Uploading {filename} from local cache");
                tasks.push(Task::PackageUpload {
                    package: Package::new(&self.channel, subdir, filename, repo.cache_dir())
                        .with_existing_file(path.clone())
                        .with_timestamp(timestamp),
                    dry_run,
                    extra_tags: Vec::new(),
                });
            }

            let outcomes = self.run_tasks(&ctx, tasks, serial).await;

            if backup.exists() {
                fs::copy(&backup, &repodata)?;
            }

            receipts.extend(pushed(outcomes?));
        }

        Ok(receipts)
    }
}

fn pushed(outcomes: Vec<TaskOutcome>) -> Vec<PushReceipt> {
    outcomes
        .into_iter()
        .filter_map(|outcome| match outcome {
            TaskOutcome::Pushed(receipt) => Some(receipt),
            TaskOutcome::Pulled(_) => None,
        })
        .collect()
}
