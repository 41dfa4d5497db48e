use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::digest;
use crate::error::{MirrorError, Result};
use crate::oci::OciRegistry;
use crate::pusher::{compress_folder, PushReceipt, Pusher};
use crate::repo::PackageInfo;

pub const PACKAGE_TARBZ2_MEDIA_TYPE: &str = "application/vnd.conda.package.v1";
pub const PACKAGE_CONDA_MEDIA_TYPE: &str = "application/vnd.conda.package.v2";
pub const INFO_ARCHIVE_MEDIA_TYPE: &str = "application/vnd.conda.info.v1.tar+gzip";
pub const INFO_INDEX_MEDIA_TYPE: &str = "application/vnd.conda.info.index.v1+json";

/// MD5 annotation attached to classic archive layers.
pub const MD5_ANNOTATION: &str = "org.conda.md5";

const UPLOAD_ATTEMPTS: u32 = 5;

/// Encode a version-and-build string into the OCI tag character set.
/// The mapping is bijective; see [`decode_tag`].
pub fn encode_tag(version_and_build: &str) -> String {
    version_and_build
        .replace('+', "__p__")
        .replace('!', "__e__")
        .replace('=', "__eq__")
}

/// Recover the original version-and-build string from an encoded tag.
pub fn decode_tag(tag: &str) -> String {
    tag.replace("__p__", "+")
        .replace("__e__", "!")
        .replace("__eq__", "=")
}

/// Registries reject repository segments with a leading underscore, so
/// such package names are pushed under a `zzz` prefix.
pub fn registry_name(name: &str) -> String {
    if name.starts_with('_') {
        format!("zzz{name}")
    } else {
        name.to_string()
    }
}

/// Undo [`registry_name`].
pub fn original_name(name: &str) -> String {
    match name.strip_prefix("zzz") {
        Some(rest) if rest.starts_with('_') => rest.to_string(),
        _ => name.to_string(),
    }
}

/// One package archive in flight: download, verify, extract metadata,
/// publish as an OCI artifact, clean up.
#[derive(Debug, Clone)]
pub struct Package {
    pub channel: String,
    pub subdir: String,
    pub filename: String,
    pub cache_dir: PathBuf,
    pub info: Option<PackageInfo>,
    pub file: Option<PathBuf>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Package {
    pub fn new(channel: &str, subdir: &str, filename: &str, cache_dir: &Path) -> Self {
        Self {
            channel: channel.to_string(),
            subdir: subdir.to_string(),
            filename: filename.to_string(),
            cache_dir: cache_dir.to_path_buf(),
            info: None,
            file: None,
            timestamp: None,
        }
    }

    pub fn with_info(mut self, info: PackageInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_existing_file(mut self, path: PathBuf) -> Self {
        self.file = Some(path);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Archive filename without its extension.
    pub fn base_name(&self) -> Result<&str> {
        for ext in [".tar.bz2", ".conda"] {
            if let Some(base) = self.filename.strip_suffix(ext) {
                return Ok(base);
            }
        }
        Err(MirrorError::Format(format!(
            "cannot decipher package type of {}",
            self.filename
        )))
    }

    /// `(name, version, build)` from the archive filename.
    pub fn split_name(&self) -> Result<(&str, &str, &str)> {
        let base = self.base_name()?;
        let mut parts = base.rsplitn(3, '-');
        let build = parts.next();
        let version = parts.next();
        let name = parts.next();
        match (name, version, build) {
            (Some(name), Some(version), Some(build)) if !name.is_empty() => {
                Ok((name, version, build))
            }
            _ => Err(MirrorError::Format(format!(
                "cannot split {} into name, version and build",
                self.filename
            ))),
        }
    }

    pub fn name(&self) -> Result<&str> {
        Ok(self.split_name()?.0)
    }

    pub fn version_and_build(&self) -> Result<String> {
        let (_, version, build) = self.split_name()?;
        Ok(format!("{version}-{build}"))
    }

    /// The OCI tag this archive publishes under.
    pub fn tag(&self) -> Result<String> {
        Ok(encode_tag(&self.version_and_build()?))
    }

    pub fn media_type(&self) -> Result<&'static str> {
        if self.filename.ends_with(".tar.bz2") {
            Ok(PACKAGE_TARBZ2_MEDIA_TYPE)
        } else if self.filename.ends_with(".conda") {
            Ok(PACKAGE_CONDA_MEDIA_TYPE)
        } else {
            Err(MirrorError::Format(format!(
                "no media type for {}",
                self.filename
            )))
        }
    }

    /// Remove the local archive, if present.
    pub fn delete(&self) -> Result<()> {
        if let Some(file) = &self.file {
            if file.exists() {
                fs::remove_file(file)?;
            }
        }
        Ok(())
    }

    /// Make sure the archive is on disk, downloading and verifying it if
    /// needed. Transient failures and checksum mismatches retry with
    /// `2 + 3^attempt` second backoff.
    pub async fn ensure_file(&mut self, client: &Client, config: &Config) -> Result<()> {
        if let Some(file) = &self.file {
            if file.exists() {
                return Ok(());
            }
        }

        fs::create_dir_all(&self.cache_dir)?;
        let dest = self.cache_dir.join(&self.filename);
        let url = format!(
            "{}/{}/{}/{}",
            config.upstream_url.trim_end_matches('/'),
            self.channel,
            self.subdir,
            self.filename
        );

        let mut attempt = 0;
        loop {
            match self.download_once(client, &url, config, &dest).await {
                Ok(()) => {
                    self.file = Some(dest);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < config.retry_attempts => {
                    let pause = 2 + 3u64.pow(attempt);
                    info!("Retrying {} in {pause} seconds - error: {e}", self.filename);
                    tokio::time::sleep(Duration::from_secs(pause)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(
        &self,
        client: &Client,
        url: &str,
        config: &Config,
        dest: &Path,
    ) -> Result<()> {
        debug!("Downloading {url}");
        let mut response = client
            .get(url)
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;

        // Archives occasionally missing from the primary CDN may exist on
        // a secondary mirror.
        if response.status() == StatusCode::NOT_FOUND {
            if let Some(fallback) = &config.fallback_url {
                let fallback_url = format!(
                    "{}/{}/{}/{}",
                    fallback.trim_end_matches('/'),
                    self.channel,
                    self.subdir,
                    self.filename
                );
                warn!("{url} returned 404, trying {fallback_url}");
                response = client
                    .get(&fallback_url)
                    .send()
                    .await
                    .map_err(|e| MirrorError::Transient(e.to_string()))?;
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::from_status(
                status,
                format!("download of {} failed", self.filename),
            ));
        }

        let mut file = fs::File::create(dest)?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?
        {
            use std::io::Write;
            file.write_all(&chunk)?;
        }
        drop(file);

        self.verify_checksum(dest)
    }

    /// Check the downloaded bytes against the repodata entry. SHA-256 is
    /// authoritative when present, MD5 otherwise; a mismatch removes the
    /// file so the next attempt starts clean.
    fn verify_checksum(&self, path: &Path) -> Result<()> {
        let Some(info) = &self.info else {
            return Ok(());
        };

        let (expected, actual) = if let Some(sha256) = &info.sha256 {
            (sha256.clone(), digest::sha256sum(path)?)
        } else if let Some(md5) = &info.md5 {
            (md5.clone(), digest::md5sum(path)?)
        } else {
            warn!("No hashes found for {}, accepting unchecked", self.filename);
            return Ok(());
        };

        if expected != actual {
            let _ = fs::remove_file(path);
            return Err(MirrorError::Checksum {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Stage the archive's extracted metadata under
    /// `{staging}/{base_name}/`: `info/index.json` plus, when the
    /// tarball can be produced, `info.tar.gz`.
    pub fn prepare_metadata(&self, staging: &Path) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| MirrorError::Format(format!("{} not downloaded", self.filename)))?;
        let base = self.base_name()?;
        let dest_dir = staging.join(base);
        fs::create_dir_all(dest_dir.join("info"))?;

        let scratch = tempfile::tempdir()?;
        debug!("Extracting {} to {}", file.display(), scratch.path().display());
        rattler_package_streaming::fs::extract(file, scratch.path())
            .map_err(|e| MirrorError::Format(format!("cannot extract {}: {e}", self.filename)))?;

        let index_json = scratch.path().join("info").join("index.json");
        if !index_json.exists() {
            return Err(MirrorError::Format(format!(
                "{} carries no info/index.json",
                self.filename
            )));
        }
        fs::copy(&index_json, dest_dir.join("info").join("index.json"))?;

        let info_tarball = scratch.path().join("info.tar.gz");
        match compress_folder(&scratch.path().join("info"), &info_tarball) {
            Ok(()) => {
                fs::copy(&info_tarball, dest_dir.join("info.tar.gz"))?;
            }
            Err(e) => {
                // The corresponding layer is simply omitted.
                warn!("Could not build info.tar.gz for {}: {e}", self.filename);
            }
        }
        Ok(())
    }

    /// Publish the archive as an OCI artifact under its derived tag and
    /// any extra tags. Retries transient failures; returns one receipt
    /// per pushed tag.
    pub async fn upload(
        &self,
        registry: &OciRegistry,
        dry_run: bool,
        extra_tags: &[String],
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<PushReceipt>> {
        let mut attempt = 0;
        loop {
            match self.try_upload(registry, dry_run, extra_tags, timestamp).await {
                Ok(receipts) => return Ok(receipts),
                Err(e) if e.is_retryable() && attempt + 1 < UPLOAD_ATTEMPTS => {
                    let pause = 2 + 3u64.pow(attempt);
                    info!("Retrying upload of {} in {pause} seconds - error: {e}", self.filename);
                    tokio::time::sleep(Duration::from_secs(pause)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_upload(
        &self,
        registry: &OciRegistry,
        dry_run: bool,
        extra_tags: &[String],
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<PushReceipt>> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| MirrorError::Format(format!("{} not downloaded", self.filename)))?;

        let staging = tempfile::tempdir()?;
        let staged_archive = staging.path().join(&self.filename);
        fs::copy(file, &staged_archive)?;
        self.prepare_metadata(staging.path())?;

        let mut pusher = Pusher::new(staging.path(), timestamp.or(self.timestamp));

        let media_type = self.media_type()?;
        let annotations = if media_type == PACKAGE_TARBZ2_MEDIA_TYPE {
            Some(HashMap::from([(
                MD5_ANNOTATION.to_string(),
                digest::md5sum(&staged_archive)?,
            )]))
        } else {
            None
        };
        pusher.add_layer(&staged_archive, media_type, Some(self.filename.as_str()), annotations)?;

        let base = self.base_name()?;
        let info_tarball = staging.path().join(base).join("info.tar.gz");
        if info_tarball.exists() {
            pusher.add_layer(&info_tarball, INFO_ARCHIVE_MEDIA_TYPE, None, None)?;
        }

        let index_path = staging.path().join(base).join("info").join("index.json");
        pusher.add_layer(&index_path, INFO_INDEX_MEDIA_TYPE, None, None)?;

        let index: serde_json::Value = serde_json::from_str(&fs::read_to_string(&index_path)?)?;
        let subdir = index.get("subdir").and_then(|v| v.as_str()).unwrap_or("");
        if subdir.is_empty() {
            error!(
                "info/index.json for {}@{} doesn't contain subdir!",
                self.name()?,
                self.version_and_build()?
            );
            return Ok(Vec::new());
        }

        if dry_run {
            info!(
                "Would push {} layer(s) for {} to {}",
                pusher.layer_count(),
                self.filename,
                registry.display()
            );
            return Ok(Vec::new());
        }

        let name = registry_name(self.name()?);
        let uri = format!(
            "{}/{}/{}/{}",
            registry.display(),
            self.channel,
            self.subdir,
            name
        );

        let mut tags = vec![self.tag()?];
        tags.extend(extra_tags.iter().cloned());

        let mut receipts = Vec::new();
        for tag in tags {
            receipts.push(pusher.push(registry, &format!("{uri}:{tag}")).await?);
        }
        Ok(receipts)
    }
}
