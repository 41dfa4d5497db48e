use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{MirrorError, Result};
use crate::oci::{OciManifest, OciRegistry, CONFIG_MEDIA_TYPE, MANIFEST_MEDIA_TYPE, TITLE_ANNOTATION};

/// Annotation carrying the shared creation timestamp of a push.
pub const CREATION_TIME_ANNOTATION: &str = "org.conda.creation-time";

/// One file destined to become a manifest layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub path: PathBuf,
    pub title: String,
    pub media_type: String,
    pub annotations: HashMap<String, String>,
}

/// A layer as reported back to the caller after a push.
#[derive(Debug, Clone, Serialize)]
pub struct LayerReceipt {
    pub path: String,
    pub title: String,
    pub media_type: String,
    pub annotations: HashMap<String, String>,
}

/// The result of pushing one manifest under one reference.
#[derive(Debug, Clone, Serialize)]
pub struct PushReceipt {
    pub uri: String,
    pub layers: Vec<LayerReceipt>,
}

/// Collects files rooted at a staging directory and publishes them as a
/// single OCI manifest, one layer per file, in insertion order.
#[derive(Debug)]
pub struct Pusher {
    root: PathBuf,
    created_at: String,
    layers: Vec<Layer>,
    scratch: Option<TempDir>,
}

impl Pusher {
    pub fn new(root: &Path, timestamp: Option<DateTime<Utc>>) -> Self {
        let created_at = timestamp
            .unwrap_or_else(Utc::now)
            .format("%Y.%m.%d.%H.%M")
            .to_string();
        Self {
            root: root.to_path_buf(),
            created_at,
            layers: Vec::new(),
            scratch: None,
        }
    }

    /// The shared creation timestamp, also usable as a tag.
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Record a layer. Relative paths resolve against the staging root. A
    /// directory is compressed to a temporary gzipped tar first; the
    /// temporary lives only as long as the pusher. The title defaults to
    /// the path relative to the staging root so that pulls materialize
    /// the file at the same relative location.
    pub fn add_layer(
        &mut self,
        path: &Path,
        media_type: &str,
        title: Option<&str>,
        annotations: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let (resolved, default_title) = if resolved.is_dir() {
            let name = resolved
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("layer");
            let tarball_name = format!("{name}.tar.gz");
            let scratch = match &self.scratch {
                Some(dir) => dir.path().to_path_buf(),
                None => {
                    let dir = TempDir::new()?;
                    let path = dir.path().to_path_buf();
                    self.scratch = Some(dir);
                    path
                }
            };
            let tarball = scratch.join(&tarball_name);
            compress_folder(&resolved, &tarball)?;
            debug!("Compressed {} to {}", resolved.display(), tarball.display());
            (tarball, tarball_name)
        } else {
            if !resolved.exists() {
                return Err(MirrorError::Format(format!(
                    "layer file does not exist: {}",
                    resolved.display()
                )));
            }
            let default_title = resolved
                .strip_prefix(&self.root)
                .ok()
                .and_then(|p| p.to_str())
                .map(str::to_string)
                .or_else(|| {
                    resolved
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(str::to_string)
                })
                .unwrap_or_default();
            (resolved, default_title)
        };

        let title = title.map(str::to_string).unwrap_or(default_title);
        let mut annotations = annotations.unwrap_or_default();
        annotations.insert(TITLE_ANNOTATION.to_string(), title.clone());
        annotations.insert(
            CREATION_TIME_ANNOTATION.to_string(),
            self.created_at.clone(),
        );

        self.layers.push(Layer {
            path: resolved,
            title,
            media_type: media_type.to_string(),
            annotations,
        });
        Ok(())
    }

    /// Upload every layer blob, a minimal empty config blob, and the
    /// manifest binding them, under `uri` = `{repository}:{tag}`.
    pub async fn push(&self, registry: &OciRegistry, uri: &str) -> Result<PushReceipt> {
        let (repository, tag) = registry.split_uri(uri)?;
        info!("Pushing {} layer(s) to {repository}:{tag}", self.layers.len());

        let config_file = tempfile::NamedTempFile::new()?;
        std::fs::write(config_file.path(), b"{}")?;
        let config = registry
            .upload_blob(&repository, config_file.path(), CONFIG_MEDIA_TYPE)
            .await?;

        let mut descriptors = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let mut descriptor = registry
                .upload_blob(&repository, &layer.path, &layer.media_type)
                .await?;
            descriptor.annotations = Some(layer.annotations.clone());
            descriptors.push(descriptor);
        }

        let manifest = OciManifest {
            schema_version: 2,
            media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers: descriptors,
            annotations: None,
        };
        registry.upload_manifest(&repository, &tag, &manifest).await?;

        Ok(PushReceipt {
            uri: uri.to_string(),
            layers: self
                .layers
                .iter()
                .map(|layer| LayerReceipt {
                    path: layer.path.display().to_string(),
                    title: layer.title.clone(),
                    media_type: layer.media_type.clone(),
                    annotations: layer.annotations.clone(),
                })
                .collect(),
        })
    }
}

/// Compress a directory into a gzipped tar whose entries are relative to
/// the directory itself.
pub fn compress_folder(source_dir: &Path, output: &Path) -> Result<()> {
    let file = File::create(output)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all("", source_dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_add_layer_titles_and_annotations() {
        let staging = TempDir::new().unwrap();
        write_file(staging.path(), "pkg-1.0-0/info/index.json", "{}");

        let mut pusher = Pusher::new(staging.path(), None);
        pusher
            .add_layer(
                Path::new("pkg-1.0-0/info/index.json"),
                "application/vnd.conda.info.index.v1+json",
                None,
                None,
            )
            .unwrap();

        assert_eq!(pusher.layer_count(), 1);
        let layer = &pusher.layers[0];
        assert_eq!(layer.title, "pkg-1.0-0/info/index.json");
        assert_eq!(
            layer.annotations.get(TITLE_ANNOTATION).unwrap(),
            "pkg-1.0-0/info/index.json"
        );
        assert_eq!(
            layer.annotations.get(CREATION_TIME_ANNOTATION).unwrap(),
            pusher.created_at()
        );
    }

    #[test]
    fn test_explicit_title_wins() {
        let staging = TempDir::new().unwrap();
        let path = write_file(staging.path(), "repodata.json", "{}");

        let mut pusher = Pusher::new(staging.path(), None);
        pusher
            .add_layer(
                &path,
                "application/vnd.conda.repodata.v1+json",
                Some("noarch/repodata.json"),
                None,
            )
            .unwrap();
        assert_eq!(pusher.layers[0].title, "noarch/repodata.json");
    }

    #[test]
    fn test_missing_layer_file_is_rejected() {
        let staging = TempDir::new().unwrap();
        let mut pusher = Pusher::new(staging.path(), None);
        let err = pusher
            .add_layer(Path::new("nope.json"), "application/json", None, None)
            .unwrap_err();
        assert!(matches!(err, MirrorError::Format(_)));
    }

    #[test]
    fn test_directory_layer_is_compressed() {
        let staging = TempDir::new().unwrap();
        write_file(staging.path(), "info/index.json", "{\"subdir\": \"noarch\"}");
        write_file(staging.path(), "info/files", "index.json\n");

        let mut pusher = Pusher::new(staging.path(), None);
        pusher
            .add_layer(
                Path::new("info"),
                "application/vnd.conda.info.v1.tar+gzip",
                None,
                None,
            )
            .unwrap();

        let layer = &pusher.layers[0];
        assert_eq!(layer.title, "info.tar.gz");
        assert!(layer.path.exists());

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&layer.path).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.contains("index.json")));
    }

    #[test]
    fn test_timestamp_format() {
        let staging = TempDir::new().unwrap();
        let ts = chrono::DateTime::parse_from_rfc3339("2023-05-04T15:04:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let pusher = Pusher::new(staging.path(), Some(ts));
        assert_eq!(pusher.created_at(), "2023.05.04.15.04");
    }

    #[test]
    fn test_compress_folder_roundtrip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("info");
        write_file(&src, "index.json", "{\"name\": \"zlib\"}");
        let out = dir.path().join("info.tar.gz");

        compress_folder(&src, &out).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&out).unwrap()));
        let mut found = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy().contains("index.json") {
                entry.read_to_string(&mut found).unwrap();
            }
        }
        assert_eq!(found, "{\"name\": \"zlib\"}");
    }
}
