use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rattler_conda_types::Version;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{MirrorError, Result};
use crate::oci::OciRegistry;
use crate::package::{
    decode_tag, registry_name, INFO_ARCHIVE_MEDIA_TYPE, INFO_INDEX_MEDIA_TYPE,
    PACKAGE_CONDA_MEDIA_TYPE, PACKAGE_TARBZ2_MEDIA_TYPE,
};
use crate::pusher::{PushReceipt, Pusher};

pub const REPODATA_MEDIA_TYPE: &str = "application/vnd.conda.repodata.v1+json";

/// One repodata entry, keyed in [`RepoData`] by its archive filename.
/// Unknown keys from upstream are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub build_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
}

/// The parsed upstream index of one `(channel, subdir)`: classic
/// `.tar.bz2` archives under `packages`, new-format `.conda` archives
/// under `packages.conda`. Filenames are unique across both families.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoData {
    #[serde(default)]
    pub packages: BTreeMap<String, PackageInfo>,
    #[serde(rename = "packages.conda", default)]
    pub conda_packages: BTreeMap<String, PackageInfo>,
}

impl RepoData {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Iterate both package families.
    pub fn packages(&self) -> impl Iterator<Item = (&String, &PackageInfo)> {
        self.packages.iter().chain(self.conda_packages.iter())
    }

    pub fn package_archives(&self) -> Vec<String> {
        self.packages().map(|(filename, _)| filename.clone()).collect()
    }

    pub fn package_names(&self) -> BTreeSet<String> {
        self.packages().map(|(_, info)| info.name.clone()).collect()
    }

    pub fn get_package_extension(filename: &str) -> Result<&'static str> {
        if filename.ends_with(".tar.bz2") {
            Ok("tar.bz2")
        } else if filename.ends_with(".conda") {
            Ok("conda")
        } else {
            Err(MirrorError::Format(format!(
                "cannot decipher package type of {filename}"
            )))
        }
    }

    pub fn get_package_mediatype(filename: &str) -> Result<&'static str> {
        match Self::get_package_extension(filename)? {
            "tar.bz2" => Ok(PACKAGE_TARBZ2_MEDIA_TYPE),
            _ => Ok(PACKAGE_CONDA_MEDIA_TYPE),
        }
    }

    /// The entry with the highest `(version, build_number)` for a name,
    /// or nothing if the name is absent.
    pub fn get_latest_entry(&self, name: &str) -> Option<(&String, &PackageInfo)> {
        let mut by_version: BTreeMap<&str, (&String, &PackageInfo)> = BTreeMap::new();
        for (filename, info) in self.packages().filter(|(_, info)| info.name == name) {
            by_version
                .entry(info.version.as_str())
                .and_modify(|entry| {
                    if info.build_number > entry.1.build_number {
                        *entry = (filename, info);
                    }
                })
                .or_insert((filename, info));
        }
        by_version
            .into_iter()
            .max_by(|a, b| compare_versions(a.0, b.0))
            .map(|(_, entry)| entry)
    }

    /// `{version}-{build}` of the latest entry for a name.
    pub fn get_latest_tag(&self, name: &str) -> Option<String> {
        self.get_latest_entry(name)
            .map(|(_, info)| format!("{}-{}", info.version, info.build))
    }
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (Version::from_str(a), Version::from_str(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Per-run cache of registry tag listings, written once per repository.
#[derive(Debug, Default)]
pub struct TagCache {
    inner: Mutex<HashMap<String, Vec<String>>>,
}

impl TagCache {
    pub async fn get(&self, key: &str) -> Option<Vec<String>> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: String, tags: Vec<String>) {
        self.inner.lock().await.insert(key, tags);
    }
}

/// A package repository: one `(channel, subdir)` pair rooted at
/// `{cache_root}/{channel}/{subdir}`.
#[derive(Debug, Clone)]
pub struct PackageRepo {
    pub channel: String,
    pub subdir: String,
    cache_dir: PathBuf,
}

impl PackageRepo {
    pub fn new(channel: &str, subdir: &str, cache_root: &Path) -> Self {
        Self {
            channel: channel.to_string(),
            subdir: subdir.to_string(),
            cache_dir: cache_root.join(channel).join(subdir),
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.channel, self.subdir)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn repodata_path(&self) -> PathBuf {
        self.cache_dir.join("repodata.json")
    }

    pub fn repodata_from_packages_path(&self) -> PathBuf {
        self.cache_dir.join("repodata_from_packages.json")
    }

    /// Download the upstream index files into the cache directory. The
    /// `repodata_from_packages.json` variant additionally lists yanked
    /// archives; channels without it are tolerated.
    pub async fn ensure_repodata(&self, client: &Client, upstream: &str) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let base = format!(
            "{}/{}/{}",
            upstream.trim_end_matches('/'),
            self.channel,
            self.subdir
        );

        let response = client
            .get(format!("{base}/repodata.json"))
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MirrorError::from_status(
                response.status(),
                format!("cannot fetch repodata for {}", self.name()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;
        fs::write(self.repodata_path(), body)?;

        match client.get(format!("{base}/repodata_from_packages.json")).send().await {
            Ok(response) if response.status().is_success() => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| MirrorError::Transient(e.to_string()))?;
                fs::write(self.repodata_from_packages_path(), body)?;
            }
            Ok(response) => {
                warn!(
                    "No repodata_from_packages.json for {} ({})",
                    self.name(),
                    response.status()
                );
            }
            Err(e) => {
                warn!("No repodata_from_packages.json for {} ({e})", self.name());
            }
        }
        Ok(())
    }

    /// Parse the cached index. With `include_yanked`, the
    /// from-packages variant is preferred when present.
    pub fn load_repodata(&self, include_yanked: bool) -> Result<RepoData> {
        let from_packages = self.repodata_from_packages_path();
        let path = if include_yanked && from_packages.exists() {
            from_packages
        } else {
            self.repodata_path()
        };
        RepoData::load(&path)
    }

    /// Registry tags already published for a package name, through the
    /// per-run cache. The underscore rewrite is applied before querying.
    pub async fn get_existing_tags(
        &self,
        registry: &OciRegistry,
        cache: &TagCache,
        package: &str,
    ) -> Result<Vec<String>> {
        let queried = registry_name(package);
        let repository = registry.repository(&format!(
            "{}/{}/{}",
            self.channel, self.subdir, queried
        ));
        if let Some(tags) = cache.get(&repository).await {
            return Ok(tags);
        }
        let tags = registry.list_tags(&repository).await?;
        cache.put(repository, tags.clone()).await;
        Ok(tags)
    }

    /// Archive filenames implied by a tag listing, for one extension.
    pub fn get_existing_packages(
        package: &str,
        tags: &[String],
        extension: &str,
    ) -> HashSet<String> {
        tags.iter()
            .map(|tag| format!("{package}-{}.{extension}", decode_tag(tag)))
            .collect()
    }

    /// Repodata entries that match the name filters, are not skipped, and
    /// are not yet present in the registry.
    pub async fn find_packages(
        &self,
        registry: &OciRegistry,
        cache: &TagCache,
        names: &[String],
        skips: &[String],
        include_yanked: bool,
    ) -> Result<Vec<(String, PackageInfo)>> {
        let data = self.load_repodata(include_yanked)?;
        let patterns: Vec<glob::Pattern> = names
            .iter()
            .filter_map(|name| match glob::Pattern::new(name) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring unparseable package pattern {name}: {e}");
                    None
                }
            })
            .collect();

        let mut found = Vec::new();
        for (filename, package_info) in data.packages() {
            if !patterns.is_empty() && !patterns.iter().any(|p| p.matches(&package_info.name)) {
                continue;
            }
            if skips.contains(&package_info.name) {
                continue;
            }

            let tags = self
                .get_existing_tags(registry, cache, &package_info.name)
                .await?;
            let mut existing =
                Self::get_existing_packages(&package_info.name, &tags, "tar.bz2");
            existing.extend(Self::get_existing_packages(&package_info.name, &tags, "conda"));
            if existing.contains(filename) {
                continue;
            }

            found.push((filename.clone(), package_info.clone()));
        }
        Ok(found)
    }

    /// Publish the cached channel index as an artifact under the shared
    /// timestamp tag and `latest`. The pusher is rooted at the channel
    /// directory so the layer title is `{subdir}/repodata.json`.
    pub async fn upload(
        &self,
        registry: &OciRegistry,
        root: &Path,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<PushReceipt>> {
        let repodata = self.repodata_path();
        if !repodata.exists() {
            return Err(MirrorError::Format(format!(
                "no cached repodata for {}",
                self.name()
            )));
        }

        let mut pusher = Pusher::new(root, timestamp);
        let title = format!("{}/repodata.json", self.subdir);
        pusher.add_layer(&repodata, REPODATA_MEDIA_TYPE, Some(title.as_str()), None)?;

        let uri = format!(
            "{}/{}/{}/repodata.json",
            registry.display(),
            self.channel,
            self.subdir
        );

        let mut receipts = Vec::new();
        for tag in [pusher.created_at().to_string(), "latest".to_string()] {
            info!("  pushing tag {tag}");
            receipts.push(pusher.push(registry, &format!("{uri}:{tag}")).await?);
        }
        Ok(receipts)
    }

    async fn pull_layers(
        &self,
        registry: &OciRegistry,
        package_ref: &str,
        media_type: &str,
    ) -> Result<Vec<PathBuf>> {
        let (name, tag) = package_ref
            .split_once(':')
            .unwrap_or((package_ref, "latest"));
        let repository =
            registry.repository(&format!("{}/{}/{}", self.channel, self.subdir, name));
        registry
            .pull_by_media_type(&repository, tag, &self.cache_dir, media_type)
            .await
    }

    /// Pull and parse the `info/index.json` of `name:tag`.
    pub async fn get_index_json(
        &self,
        registry: &OciRegistry,
        package_ref: &str,
    ) -> Result<serde_json::Value> {
        let paths = self
            .pull_layers(registry, package_ref, INFO_INDEX_MEDIA_TYPE)
            .await?;
        let path = paths.first().ok_or_else(|| {
            MirrorError::Format(format!("{package_ref} has no info index layer"))
        })?;
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Pull the `info.tar.gz` of `name:tag`, returning its path.
    pub async fn get_info(&self, registry: &OciRegistry, package_ref: &str) -> Result<PathBuf> {
        let paths = self
            .pull_layers(registry, package_ref, INFO_ARCHIVE_MEDIA_TYPE)
            .await?;
        paths.into_iter().next().ok_or_else(|| {
            MirrorError::Format(format!("{package_ref} has no info archive layer"))
        })
    }

    /// Pull the package archive of `name:tag`, trying the new format
    /// first, then the classic one.
    pub async fn get_package(&self, registry: &OciRegistry, package_ref: &str) -> Result<PathBuf> {
        let paths = self
            .pull_layers(registry, package_ref, PACKAGE_CONDA_MEDIA_TYPE)
            .await?;
        if let Some(path) = paths.into_iter().next() {
            return Ok(path);
        }
        let paths = self
            .pull_layers(registry, package_ref, PACKAGE_TARBZ2_MEDIA_TYPE)
            .await?;
        paths.into_iter().next().ok_or_else(|| {
            MirrorError::Format(format!("{package_ref} has no package archive layer"))
        })
    }
}
