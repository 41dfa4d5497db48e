use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::digest;
use crate::error::{MirrorError, Result};

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Annotation carrying the file name a layer is materialized under on pull.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Token scope requested from the registry for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Pull,
    Push,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Pull => "pull",
            Scope::Push => "push,pull",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl OciDescriptor {
    pub fn title(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(TITLE_ANNOTATION))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// Client for an OCI distribution (v2) registry.
///
/// Bound to `scheme://host[:port]` plus an optional namespace prefix, e.g.
/// `ghcr.io/myuser` or `http://127.0.0.1:5000/dinosaur`. A plain host with
/// no scheme defaults to https; an `http` scheme marks the registry
/// insecure. Bearer tokens are cached per repository and scope so a
/// token's grant always matches the path being operated on.
#[derive(Debug)]
pub struct OciRegistry {
    spec: String,
    base: Url,
    prefix: String,
    client: Client,
    auth: Option<(String, String)>,
    tokens: Mutex<HashMap<String, Option<String>>>,
}

impl OciRegistry {
    pub fn new(spec: &str, config: &Config) -> Result<Self> {
        let with_scheme = if spec.contains("://") {
            spec.to_string()
        } else {
            format!("https://{spec}")
        };
        let url = Url::parse(&with_scheme)?;
        let prefix = url.path().trim_matches('/').to_string();
        let mut base = url.clone();
        base.set_path("");

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| MirrorError::Transient(e.to_string()))?;

        Ok(Self {
            spec: spec.trim_end_matches('/').to_string(),
            base,
            prefix,
            client,
            auth: config.registry_auth(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// The registry spec as given at construction, used to assemble
    /// human-readable artifact URIs.
    pub fn display(&self) -> &str {
        &self.spec
    }

    pub fn is_insecure(&self) -> bool {
        self.base.scheme() == "http"
    }

    /// Full repository path for a `{channel}/{subdir}/{name}` tail,
    /// including the namespace prefix.
    pub fn repository(&self, tail: &str) -> String {
        if self.prefix.is_empty() {
            tail.to_string()
        } else {
            format!("{}/{}", self.prefix, tail)
        }
    }

    /// Split an artifact URI (`[scheme://]host[:port]/repo/path[:tag]`)
    /// into its repository path and reference. A URI without a tag
    /// resolves to `latest`.
    pub fn split_uri(&self, uri: &str) -> Result<(String, String)> {
        let rest = uri.split_once("://").map(|(_, r)| r).unwrap_or(uri);
        let host = self.host_port();
        let path = rest
            .strip_prefix(host.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .unwrap_or(rest);
        if path.is_empty() {
            return Err(MirrorError::Format(format!("cannot parse uri: {uri}")));
        }
        match path.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                Ok((repository.to_string(), tag.to_string()))
            }
            _ => Ok((path.to_string(), "latest".to_string())),
        }
    }

    fn host_port(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn v2_url(&self, repository: &str, tail: &str) -> Result<Url> {
        if repository.contains("..") {
            return Err(MirrorError::Format(format!(
                "invalid repository path: {repository}"
            )));
        }
        Ok(self.base.join(&format!("/v2/{repository}/{tail}"))?)
    }

    /// Ensure a token session exists for the repository and scope.
    pub async fn authenticate(&self, repository: &str, scope: Scope) -> Result<()> {
        self.token_for(repository, scope).await.map(|_| ())
    }

    async fn token_for(&self, repository: &str, scope: Scope) -> Result<Option<String>> {
        let key = format!("{repository}:{}", scope.as_str());
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(&key) {
            return Ok(token.clone());
        }

        let url = self.base.join(&format!(
            "/token?scope=repository:{repository}:{}",
            scope.as_str()
        ))?;
        let mut request = self.client.get(url);
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;

        let token = match response.status() {
            // Registries without a token endpoint (plain registry:2) are
            // used without authorization.
            StatusCode::NOT_FOUND => None,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(MirrorError::Auth(format!(
                    "token request for {repository} rejected ({})",
                    response.status()
                )));
            }
            status if status.is_success() => {
                let body: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| MirrorError::Transient(e.to_string()))?;
                Some(body.token)
            }
            status => {
                return Err(MirrorError::from_status(
                    status,
                    format!("token request for {repository} failed"),
                ));
            }
        };

        debug!(
            "Authenticated {} for scope {} (token: {})",
            repository,
            scope.as_str(),
            token.is_some()
        );
        tokens.insert(key, token.clone());
        Ok(token)
    }

    fn bearer(
        request: reqwest::RequestBuilder,
        token: &Option<String>,
    ) -> reqwest::RequestBuilder {
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// List all tags of a repository, following `Link` pagination.
    /// A repository that does not exist yet yields an empty list.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let token = self.token_for(repository, Scope::Pull).await?;
        let mut url = self.v2_url(repository, "tags/list?n=10000")?;
        let mut tags = Vec::new();

        loop {
            let request = Self::bearer(self.client.get(url.clone()), &token);
            let response = request
                .send()
                .await
                .map_err(|e| MirrorError::Transient(e.to_string()))?;

            match response.status() {
                StatusCode::NOT_FOUND => return Ok(Vec::new()),
                status if status.is_success() => {}
                status => {
                    return Err(MirrorError::from_status(
                        status,
                        format!("listing tags for {repository} failed"),
                    ));
                }
            }

            let next = response
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);
            let page: TagList = response
                .json()
                .await
                .map_err(|e| MirrorError::Transient(e.to_string()))?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = self.base.join(&next)?,
                None => break,
            }
        }

        Ok(tags)
    }

    /// Fetch the manifest for a tag or digest reference.
    pub async fn get_manifest(&self, repository: &str, reference: &str) -> Result<OciManifest> {
        let token = self.token_for(repository, Scope::Pull).await?;
        let url = self.v2_url(repository, &format!("manifests/{reference}"))?;
        let request = Self::bearer(self.client.get(url), &token)
            .header(header::ACCEPT, MANIFEST_MEDIA_TYPE);
        let response = request
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| MirrorError::Transient(e.to_string())),
            status => Err(MirrorError::from_status(
                status,
                format!("manifest {repository}:{reference} not retrievable"),
            )),
        }
    }

    /// Upload a blob with the two-step POST/PUT flow. Uploads are
    /// idempotent by digest: an existing blob is not re-sent.
    pub async fn upload_blob(
        &self,
        repository: &str,
        path: &Path,
        media_type: &str,
    ) -> Result<OciDescriptor> {
        let hex = digest::sha256sum(path)?;
        let blob_digest = format!("sha256:{hex}");
        let size = std::fs::metadata(path)?.len();
        let descriptor = OciDescriptor {
            media_type: media_type.to_string(),
            digest: blob_digest.clone(),
            size,
            annotations: None,
        };

        let token = self.token_for(repository, Scope::Push).await?;

        let head_url = self.v2_url(repository, &format!("blobs/{blob_digest}"))?;
        let response = Self::bearer(self.client.head(head_url), &token)
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;
        if response.status().is_success() {
            debug!("Blob {} already present in {}", blob_digest, repository);
            return Ok(descriptor);
        }

        let post_url = self.v2_url(repository, "blobs/uploads/")?;
        let response = Self::bearer(self.client.post(post_url), &token)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;

        let location = match response.status() {
            StatusCode::CREATED => return Ok(descriptor),
            StatusCode::ACCEPTED => response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    MirrorError::Registry {
                        status: 202,
                        message: "upload session has no Location header".to_string(),
                    }
                })?,
            status => {
                return Err(MirrorError::from_status(
                    status,
                    format!("blob upload session for {repository} refused"),
                ));
            }
        };

        let mut put_url = self.base.join(&location)?;
        put_url.query_pairs_mut().append_pair("digest", &blob_digest);

        let data = std::fs::read(path)?;
        let response = Self::bearer(self.client.put(put_url), &token)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, data.len() as u64)
            .body(data)
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => Ok(descriptor),
            status => Err(MirrorError::from_status(
                status,
                format!("blob {blob_digest} rejected by {repository}"),
            )),
        }
    }

    /// PUT a manifest under a tag or digest reference.
    pub async fn upload_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &OciManifest,
    ) -> Result<()> {
        let token = self.token_for(repository, Scope::Push).await?;
        let url = self.v2_url(repository, &format!("manifests/{reference}"))?;
        let body = serde_json::to_string(manifest)?;
        let response = Self::bearer(self.client.put(url), &token)
            .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| MirrorError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
            status => Err(MirrorError::from_status(
                status,
                format!("manifest {repository}:{reference} rejected"),
            )),
        }
    }

    /// Download every layer of `repository:reference` carrying the given
    /// media type, materializing each under `dest` at its title
    /// annotation. A layer whose file already matches the layer digest is
    /// not fetched again. Returns the materialized paths.
    pub async fn pull_by_media_type(
        &self,
        repository: &str,
        reference: &str,
        dest: &Path,
        media_type: &str,
    ) -> Result<Vec<PathBuf>> {
        let manifest = self.get_manifest(repository, reference).await?;
        let token = self.token_for(repository, Scope::Pull).await?;
        let mut paths = Vec::new();

        for layer in manifest.layers.iter().filter(|l| l.media_type == media_type) {
            let title = layer.title().ok_or_else(|| {
                MirrorError::Format(format!(
                    "layer {} in {repository}:{reference} has no title annotation",
                    layer.digest
                ))
            })?;
            let relative = sanitize_title(title)?;
            let path = dest.join(relative);

            if path.exists() {
                let local = format!("sha256:{}", digest::sha256sum(&path)?);
                if local == layer.digest {
                    debug!("Skipping {}, already matches {}", path.display(), layer.digest);
                    paths.push(path);
                    continue;
                }
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let url = self.v2_url(repository, &format!("blobs/{}", layer.digest))?;
            let request = Self::bearer(self.client.get(url), &token);
            let mut response = request
                .send()
                .await
                .map_err(|e| MirrorError::Transient(e.to_string()))?;
            if !response.status().is_success() {
                return Err(MirrorError::from_status(
                    response.status(),
                    format!("blob {} not retrievable from {repository}", layer.digest),
                ));
            }

            let mut file = std::fs::File::create(&path)?;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| MirrorError::Transient(e.to_string()))?
            {
                use std::io::Write;
                file.write_all(&chunk)?;
            }

            info!("Materialized {}", path.display());
            paths.push(path);
        }

        Ok(paths)
    }
}

impl From<url::ParseError> for MirrorError {
    fn from(err: url::ParseError) -> Self {
        MirrorError::Format(err.to_string())
    }
}

/// A layer title must stay inside the pull destination.
fn sanitize_title(title: &str) -> Result<PathBuf> {
    let path = Path::new(title);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || title.is_empty() {
        return Err(MirrorError::Format(format!(
            "layer title escapes destination: {title}"
        )));
    }
    Ok(path.to_path_buf())
}

fn parse_next_link(link: &str) -> Option<String> {
    link.split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| part.split('<').nth(1))
        .and_then(|part| part.split('>').next())
        .map(str::to_string)
}
