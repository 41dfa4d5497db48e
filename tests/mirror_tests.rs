use std::io::Write;
use std::path::Path;

use mockito::Matcher;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use conda_oci_mirror::config::Config;
use conda_oci_mirror::error::MirrorError;
use conda_oci_mirror::mirror::Mirror;
use conda_oci_mirror::package::{
    Package, INFO_ARCHIVE_MEDIA_TYPE, INFO_INDEX_MEDIA_TYPE, PACKAGE_TARBZ2_MEDIA_TYPE,
};

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// A minimal but real `.tar.bz2` archive carrying `info/index.json`.
fn build_archive(name: &str, version: &str, build: &str, subdir: &str) -> Vec<u8> {
    let index = serde_json::json!({
        "name": name,
        "version": version,
        "build": build,
        "build_number": 0,
        "depends": [],
        "subdir": subdir,
    })
    .to_string();

    let mut buf = Vec::new();
    {
        let encoder = bzip2::write::BzEncoder::new(&mut buf, bzip2::Compression::best());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(index.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "info/index.json", index.as_bytes())
            .unwrap();

        let files = "info/index.json\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(files.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "info/files", files.as_bytes())
            .unwrap();

        let encoder = builder.into_inner().unwrap();
        encoder.finish().unwrap().flush().unwrap();
    }
    buf
}

fn repodata_body(archive: &str, name: &str, version: &str, build: &str, sha256: &str) -> String {
    serde_json::json!({
        "info": { "subdir": "noarch" },
        "packages": {
            archive: {
                "name": name,
                "version": version,
                "build": build,
                "build_number": 0,
                "sha256": sha256,
                "subdir": "noarch",
            }
        },
        "packages.conda": {}
    })
    .to_string()
}

fn test_config(upstream: &str) -> Config {
    Config {
        timeout_ms: 5_000,
        rate_limit_ms: 10,
        workers: 2,
        upstream_url: upstream.to_string(),
        registry_user: None,
        registry_token: None,
        ..Config::default()
    }
}

/// Registry-side mocks shared by the push flows: anonymous token, blob
/// existence checks, the two-step upload and manifest PUTs.
async fn mock_push_surface(server: &mut mockito::Server) {
    server
        .mock("GET", "/token")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("HEAD", Matcher::Regex(r"^/v2/dinosaur/.+/blobs/sha256:".to_string()))
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("POST", Matcher::Regex(r"^/v2/dinosaur/.+/blobs/uploads/$".to_string()))
        .with_status(202)
        .with_header("Location", "/v2/dinosaur/uploads/session")
        .create_async()
        .await;
    server
        .mock("PUT", Matcher::Regex(r"^/v2/dinosaur/uploads/session".to_string()))
        .match_query(Matcher::Any)
        .with_status(201)
        .create_async()
        .await;
    server
        .mock("PUT", Matcher::Regex(r"^/v2/dinosaur/.+/manifests/.+".to_string()))
        .with_status(201)
        .create_async()
        .await;
}

#[tokio::test]
async fn test_update_mirrors_missing_package_and_publishes_index() {
    let mut server = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();

    let archive = build_archive("redo", "1.2", "0", "noarch");
    let digest = sha256_hex(&archive);
    let repodata = repodata_body("redo-1.2-0.tar.bz2", "redo", "1.2", "0", &digest);

    server
        .mock("GET", "/mirror-testing/noarch/repodata.json")
        .with_body(&repodata)
        .create_async()
        .await;
    server
        .mock("GET", "/mirror-testing/noarch/repodata_from_packages.json")
        .with_body(&repodata)
        .create_async()
        .await;
    server
        .mock("GET", "/mirror-testing/noarch/redo-1.2-0.tar.bz2")
        .with_body(archive.clone())
        .create_async()
        .await;
    let empty_tags = server
        .mock("GET", "/v2/dinosaur/mirror-testing/noarch/redo/tags/list")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;
    mock_push_surface(&mut server).await;

    let mirror = Mirror::new(
        Some("mirror-testing".to_string()),
        Some(vec!["noarch".to_string()]),
        Some(vec!["redo".to_string()]),
        Some(format!("{}/dinosaur", server.url())),
        Some(cache.path().to_path_buf()),
        test_config(&server.url()),
    );

    let receipts = mirror.update(false, false, false).await.unwrap();

    // One package tag plus the dated and latest index tags.
    assert_eq!(receipts.len(), 3);
    assert!(receipts[0].uri.ends_with("/mirror-testing/noarch/redo:1.2-0"));
    assert!(receipts[1].uri.contains("/mirror-testing/noarch/repodata.json:"));
    assert!(receipts[2].uri.ends_with("/mirror-testing/noarch/repodata.json:latest"));

    // The dated tag is immutable and distinct from latest.
    let dated = receipts[1].uri.rsplit(':').next().unwrap();
    assert_ne!(dated, "latest");
    assert_eq!(dated.split('.').count(), 5);

    // Exactly one archive layer, at most one info tarball, exactly one
    // info index.
    let package_layers = &receipts[0].layers;
    let archives = package_layers
        .iter()
        .filter(|l| l.media_type == PACKAGE_TARBZ2_MEDIA_TYPE)
        .count();
    let tarballs = package_layers
        .iter()
        .filter(|l| l.media_type == INFO_ARCHIVE_MEDIA_TYPE)
        .count();
    let indexes = package_layers
        .iter()
        .filter(|l| l.media_type == INFO_INDEX_MEDIA_TYPE)
        .count();
    assert_eq!(archives, 1);
    assert!(tarballs <= 1);
    assert_eq!(indexes, 1);

    // Layers carry the title annotation pulls rely on.
    for layer in package_layers {
        assert_eq!(
            layer.annotations.get("org.opencontainers.image.title").unwrap(),
            &layer.title
        );
    }

    // The local archive is cleaned up after the push; the index stays.
    let subdir_cache = cache.path().join("mirror-testing/noarch");
    assert!(!subdir_cache.join("redo-1.2-0.tar.bz2").exists());
    assert!(subdir_cache.join("repodata.json").exists());

    empty_tags.assert_async().await;

    // Re-mirroring an unchanged upstream pushes no packages: only the
    // index artifact moves again (dated tag + latest).
    server
        .mock("GET", "/v2/dinosaur/mirror-testing/noarch/redo/tags/list")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"name": "dinosaur/mirror-testing/noarch/redo", "tags": ["1.2-0"]}"#)
        .create_async()
        .await;

    let receipts = mirror.update(false, false, false).await.unwrap();
    assert_eq!(receipts.len(), 2);
    for receipt in &receipts {
        assert!(receipt.uri.contains("repodata.json"));
    }
}

#[tokio::test]
async fn test_update_dry_run_uploads_nothing() {
    let mut server = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();

    let archive = build_archive("redo", "1.2", "0", "noarch");
    let digest = sha256_hex(&archive);
    let repodata = repodata_body("redo-1.2-0.tar.bz2", "redo", "1.2", "0", &digest);

    server
        .mock("GET", "/mirror-testing/noarch/repodata.json")
        .with_body(&repodata)
        .create_async()
        .await;
    server
        .mock("GET", "/mirror-testing/noarch/repodata_from_packages.json")
        .with_body(&repodata)
        .create_async()
        .await;
    server
        .mock("GET", "/mirror-testing/noarch/redo-1.2-0.tar.bz2")
        .with_body(archive)
        .create_async()
        .await;
    server
        .mock("GET", "/token")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("GET", "/v2/dinosaur/mirror-testing/noarch/redo/tags/list")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;
    let uploads = server
        .mock("POST", Matcher::Regex(r"^/v2/.*".to_string()))
        .expect(0)
        .create_async()
        .await;
    let manifests = server
        .mock("PUT", Matcher::Regex(r"^/v2/.*".to_string()))
        .expect(0)
        .create_async()
        .await;

    let mirror = Mirror::new(
        Some("mirror-testing".to_string()),
        Some(vec!["noarch".to_string()]),
        None,
        Some(format!("{}/dinosaur", server.url())),
        Some(cache.path().to_path_buf()),
        test_config(&server.url()),
    );

    let receipts = mirror.update(true, false, false).await.unwrap();
    assert!(receipts.is_empty());
    uploads.assert_async().await;
    manifests.assert_async().await;
}

#[tokio::test]
async fn test_forbidden_packages_are_never_candidates() {
    // A skipped name is filtered out before the registry is even
    // consulted, regardless of any other filter.
    let mut server = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();

    let repodata = repodata_body("foo-1.0-0.tar.bz2", "foo", "1.0", "0", &"0".repeat(64));
    server
        .mock("GET", "/mirror-testing/noarch/repodata.json")
        .with_body(&repodata)
        .create_async()
        .await;
    server
        .mock("GET", "/mirror-testing/noarch/repodata_from_packages.json")
        .with_body(&repodata)
        .create_async()
        .await;
    let tag_listings = server
        .mock("GET", Matcher::Regex(r"^/v2/.*tags/list".to_string()))
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let config = test_config(&server.url());
    let ctx = conda_oci_mirror::tasks::RunContext::new(
        config.clone(),
        conda_oci_mirror::oci::OciRegistry::new(&format!("{}/dinosaur", server.url()), &config)
            .unwrap(),
    )
    .unwrap();

    let repo =
        conda_oci_mirror::repo::PackageRepo::new("mirror-testing", "noarch", cache.path());
    repo.ensure_repodata(&ctx.client, &server.url()).await.unwrap();

    let candidates = repo
        .find_packages(&ctx.registry, &ctx.tags, &[], &["foo".to_string()], false)
        .await
        .unwrap();
    assert!(candidates.is_empty());
    tag_listings.assert_async().await;
}

#[tokio::test]
async fn test_checksum_mismatch_discards_download() {
    let mut server = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();

    server
        .mock("GET", "/mirror-testing/noarch/redo-1.2-0.tar.bz2")
        .with_body(b"corrupted bytes")
        .create_async()
        .await;

    let config = Config {
        retry_attempts: 1,
        upstream_url: server.url(),
        ..test_config(&server.url())
    };
    let client = reqwest::Client::new();

    let subdir_cache = cache.path().join("mirror-testing/noarch");
    let mut package = Package::new(
        "mirror-testing",
        "noarch",
        "redo-1.2-0.tar.bz2",
        &subdir_cache,
    )
    .with_info(conda_oci_mirror::repo::PackageInfo {
        sha256: Some("e".repeat(64)),
        ..conda_oci_mirror::repo::PackageInfo::default()
    });

    let err = package.ensure_file(&client, &config).await.unwrap_err();
    assert!(matches!(err, MirrorError::Checksum { .. }));
    // A mismatching file never survives to be pushed.
    assert!(!subdir_cache.join("redo-1.2-0.tar.bz2").exists());
}

#[tokio::test]
async fn test_download_falls_back_on_404() {
    let mut primary = mockito::Server::new_async().await;
    let mut secondary = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();

    let body = b"archive from the secondary mirror";
    primary
        .mock("GET", "/mirror-testing/noarch/redo-1.2-0.tar.bz2")
        .with_status(404)
        .create_async()
        .await;
    secondary
        .mock("GET", "/mirror-testing/noarch/redo-1.2-0.tar.bz2")
        .with_body(body.as_slice())
        .create_async()
        .await;

    let config = Config {
        upstream_url: primary.url(),
        fallback_url: Some(secondary.url()),
        ..test_config(&primary.url())
    };
    let client = reqwest::Client::new();

    let subdir_cache = cache.path().join("mirror-testing/noarch");
    let mut package = Package::new(
        "mirror-testing",
        "noarch",
        "redo-1.2-0.tar.bz2",
        &subdir_cache,
    )
    .with_info(conda_oci_mirror::repo::PackageInfo {
        sha256: Some(sha256_hex(body)),
        ..conda_oci_mirror::repo::PackageInfo::default()
    });

    package.ensure_file(&client, &config).await.unwrap();
    assert_eq!(
        std::fs::read(subdir_cache.join("redo-1.2-0.tar.bz2")).unwrap(),
        body
    );
}

#[tokio::test]
async fn test_reverse_helpers_pull_published_layers() {
    let mut server = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();

    server
        .mock("GET", "/token")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let index_content = serde_json::json!({
        "name": "redo", "version": "1.2", "build": "0",
        "build_number": 0, "subdir": "noarch",
    })
    .to_string();
    let index_digest = format!("sha256:{}", sha256_hex(index_content.as_bytes()));
    let archive_digest = format!("sha256:{}", sha256_hex(b"archive!"));

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", sha256_hex(b"{}")),
            "size": 2
        },
        "layers": [
            {
                "mediaType": "application/vnd.conda.package.v1",
                "digest": archive_digest.clone(),
                "size": 8,
                "annotations": { "org.opencontainers.image.title": "redo-1.2-0.tar.bz2" }
            },
            {
                "mediaType": "application/vnd.conda.info.index.v1+json",
                "digest": index_digest.clone(),
                "size": index_content.len(),
                "annotations": {
                    "org.opencontainers.image.title": "redo-1.2-0/info/index.json"
                }
            }
        ]
    })
    .to_string();

    server
        .mock("GET", "/v2/dinosaur/mirror-testing/noarch/redo/manifests/1.2-0")
        .with_body(&manifest)
        .create_async()
        .await;
    server
        .mock(
            "GET",
            format!("/v2/dinosaur/mirror-testing/noarch/redo/blobs/{index_digest}").as_str(),
        )
        .with_body(&index_content)
        .create_async()
        .await;
    server
        .mock(
            "GET",
            format!("/v2/dinosaur/mirror-testing/noarch/redo/blobs/{archive_digest}").as_str(),
        )
        .with_body(b"archive!".as_slice())
        .create_async()
        .await;

    let config = test_config(&server.url());
    let registry = conda_oci_mirror::oci::OciRegistry::new(
        &format!("{}/dinosaur", server.url()),
        &config,
    )
    .unwrap();
    let repo =
        conda_oci_mirror::repo::PackageRepo::new("mirror-testing", "noarch", cache.path());

    let index = repo.get_index_json(&registry, "redo:1.2-0").await.unwrap();
    assert_eq!(index.get("subdir").and_then(|v| v.as_str()), Some("noarch"));
    assert_eq!(index.get("name").and_then(|v| v.as_str()), Some("redo"));

    // The new format is preferred but this artifact only carries the
    // classic archive.
    let archive = repo.get_package(&registry, "redo:1.2-0").await.unwrap();
    assert!(archive.to_string_lossy().ends_with("redo-1.2-0.tar.bz2"));
    assert_eq!(std::fs::read(&archive).unwrap(), b"archive!");
}

#[tokio::test]
async fn test_push_cache_new_vs_all() {
    let mut server = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();
    mock_push_surface(&mut server).await;

    // One archive already present in the local cache, and an upstream
    // index that already knows it.
    let subdir_cache = cache.path().join("mirror-testing/noarch");
    std::fs::create_dir_all(&subdir_cache).unwrap();
    let archive = build_archive("redo", "1.2", "0", "noarch");
    std::fs::write(subdir_cache.join("redo-1.2-0.tar.bz2"), &archive).unwrap();
    let repodata = repodata_body(
        "redo-1.2-0.tar.bz2",
        "redo",
        "1.2",
        "0",
        &sha256_hex(&archive),
    );
    std::fs::write(subdir_cache.join("repodata.json"), &repodata).unwrap();

    let mirror = Mirror::new(
        Some("mirror-testing".to_string()),
        Some(vec!["noarch".to_string()]),
        None,
        Some(format!("{}/dinosaur", server.url())),
        Some(cache.path().to_path_buf()),
        test_config(&server.url()),
    )
    // The external indexer is not under test.
    .with_indexer(conda_oci_mirror::mirror::ChannelIndexer::new("true"));

    // Nothing is new, so nothing is pushed.
    let receipts = mirror.push_new(false, false).await.unwrap();
    assert!(receipts.is_empty());
    assert!(subdir_cache.join("redo-1.2-0.tar.bz2").exists());

    // push-all pushes every local archive and restores the upstream
    // index afterwards.
    let receipts = mirror.push_all(false, false).await.unwrap();
    assert_eq!(receipts.len(), 1);
    assert!(receipts[0].uri.ends_with("/mirror-testing/noarch/redo:1.2-0"));
    assert_eq!(
        std::fs::read_to_string(subdir_cache.join("repodata.json")).unwrap(),
        repodata
    );
    assert!(subdir_cache.join("original_repodata.json").exists());
}

#[tokio::test]
async fn test_pull_latest_materializes_index_and_archives() {
    let mut server = mockito::Server::new_async().await;
    let cache = TempDir::new().unwrap();

    server
        .mock("GET", "/token")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let repodata = repodata_body(
        "redo-1.2-0.tar.bz2",
        "redo",
        "1.2",
        "0",
        &sha256_hex(b"archive!"),
    );
    let repodata_digest = format!("sha256:{}", sha256_hex(repodata.as_bytes()));
    let index_manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", sha256_hex(b"{}")),
            "size": 2
        },
        "layers": [{
            "mediaType": "application/vnd.conda.repodata.v1+json",
            "digest": repodata_digest.clone(),
            "size": repodata.len(),
            "annotations": { "org.opencontainers.image.title": "noarch/repodata.json" }
        }]
    })
    .to_string();

    let archive_digest = format!("sha256:{}", sha256_hex(b"archive!"));
    let package_manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", sha256_hex(b"{}")),
            "size": 2
        },
        "layers": [{
            "mediaType": "application/vnd.conda.package.v1",
            "digest": archive_digest.clone(),
            "size": 8,
            "annotations": { "org.opencontainers.image.title": "redo-1.2-0.tar.bz2" }
        }]
    })
    .to_string();

    server
        .mock(
            "GET",
            "/v2/dinosaur/mirror-testing/noarch/repodata.json/manifests/latest",
        )
        .with_body(&index_manifest)
        .create_async()
        .await;
    server
        .mock(
            "GET",
            format!("/v2/dinosaur/mirror-testing/noarch/repodata.json/blobs/{repodata_digest}")
                .as_str(),
        )
        .with_body(&repodata)
        .create_async()
        .await;
    server
        .mock("GET", "/v2/dinosaur/mirror-testing/noarch/redo/manifests/1.2-0")
        .with_body(&package_manifest)
        .create_async()
        .await;
    server
        .mock(
            "GET",
            format!("/v2/dinosaur/mirror-testing/noarch/redo/blobs/{archive_digest}").as_str(),
        )
        .with_body(b"archive!".as_slice())
        .create_async()
        .await;

    let mirror = Mirror::new(
        Some("mirror-testing".to_string()),
        Some(vec!["noarch".to_string()]),
        None,
        Some(format!("{}/dinosaur", server.url())),
        Some(cache.path().to_path_buf()),
        test_config(&server.url()),
    );

    let paths = mirror.pull_latest(false, false).await.unwrap();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with(Path::new("mirror-testing/noarch/redo-1.2-0.tar.bz2")));
    assert_eq!(std::fs::read(&paths[0]).unwrap(), b"archive!");
    assert!(cache
        .path()
        .join("mirror-testing/noarch/repodata.json")
        .exists());
}
