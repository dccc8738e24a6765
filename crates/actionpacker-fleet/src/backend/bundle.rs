// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent bundle download, cache and unpacking.
//!
//! Bundles are cached once per platform/version under `<data_dir>/cache` and
//! unpacked into each runner's working directory. A marker file records which
//! bundle a directory holds, so unpacking the same bundle twice is a no-op.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::platform::Platform;
use super::{BackendError, Result};

/// Marker written into a working directory after a successful unpack.
pub const BUNDLE_MARKER: &str = ".actionpacker-bundle";

/// Agent entry points that must be executable after unpacking.
const ENTRY_POINTS: [&str; 2] = ["config.sh", "run.sh"];

/// Cap on a single decompressed entry.
const MAX_ENTRY_SIZE: u64 = 1024 * 1024 * 1024;

/// File name of the agent bundle for `platform` and `version`.
pub fn bundle_file_name(platform: Platform, version: &str) -> String {
    format!("actions-runner-{}-{}.tar.gz", platform, version)
}

/// Download URL of the agent bundle.
pub fn bundle_url(base_url: &str, platform: Platform, version: &str) -> String {
    format!(
        "{}/v{}/{}",
        base_url.trim_end_matches('/'),
        version,
        bundle_file_name(platform, version)
    )
}

/// Marker contents identifying a bundle.
fn marker_contents(platform: Platform, version: &str) -> String {
    format!("{}/{}", platform, version)
}

/// Whether `dir` already holds the unpacked bundle for `platform`/`version`.
pub fn is_unpacked(dir: &Path, platform: Platform, version: &str) -> bool {
    std::fs::read_to_string(dir.join(BUNDLE_MARKER))
        .map(|contents| contents.trim() == marker_contents(platform, version))
        .unwrap_or(false)
}

/// Make sure the bundle is in the cache and matches `expected_sha256`.
///
/// Returns the cached archive path.
pub async fn ensure_cached(
    http: &reqwest::Client,
    base_url: &str,
    cache_dir: &Path,
    platform: Platform,
    version: &str,
    expected_sha256: Option<&str>,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(cache_dir).await?;
    let archive_path = cache_dir.join(bundle_file_name(platform, version));

    if tokio::fs::try_exists(&archive_path).await? {
        match expected_sha256 {
            None => {
                debug!(path = %archive_path.display(), "Using cached agent bundle");
                return Ok(archive_path);
            }
            Some(expected) => {
                let actual = file_sha256(archive_path.clone()).await?;
                if actual == expected {
                    debug!(path = %archive_path.display(), "Using verified cached agent bundle");
                    return Ok(archive_path);
                }
                warn!(
                    path = %archive_path.display(),
                    expected = %expected,
                    actual = %actual,
                    "Cached agent bundle failed verification, downloading again"
                );
                tokio::fs::remove_file(&archive_path).await?;
            }
        }
    }

    let url = bundle_url(base_url, platform, version);
    info!(url = %url, "Downloading agent bundle");

    let mut response = http
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| BackendError::Download(format!("GET {}: {}", url, e)))?;

    // One partial file per download; concurrent downloads never share one
    let partial_path = cache_dir.join(format!(
        "{}.{}.partial",
        bundle_file_name(platform, version),
        Uuid::new_v4().simple()
    ));
    let streamed = stream_to_file(&mut response, &partial_path).await;
    let (total_bytes, actual) = match streamed {
        Ok(done) => done,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(e);
        }
    };

    if let Some(expected) = expected_sha256
        && actual != expected
    {
        let _ = tokio::fs::remove_file(&partial_path).await;
        return Err(BackendError::Download(format!(
            "checksum mismatch for {}: expected {}, got {}",
            url, expected, actual
        )));
    }

    // Atomic replace: a racing download of the same bundle lands identical bytes
    if let Err(e) = tokio::fs::rename(&partial_path, &archive_path).await {
        let _ = tokio::fs::remove_file(&partial_path).await;
        return Err(e.into());
    }
    info!(
        path = %archive_path.display(),
        bytes = total_bytes,
        sha256 = %actual,
        "Agent bundle cached"
    );
    Ok(archive_path)
}

/// Stream a response body into `path`, returning its size and SHA-256.
async fn stream_to_file(response: &mut reqwest::Response, path: &Path) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut total_bytes = 0u64;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| BackendError::Download(format!("reading {}: {}", response.url(), e)))?
    {
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        total_bytes += chunk.len() as u64;
    }
    file.flush().await?;

    Ok((total_bytes, format!("{:x}", hasher.finalize())))
}

/// Unpack `archive` into `dest` and write the bundle marker.
pub async fn unpack(
    archive: PathBuf,
    dest: PathBuf,
    platform: Platform,
    version: String,
) -> Result<()> {
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dest, platform, &version))
        .await
        .map_err(|e| BackendError::Download(format!("unpack task failed: {}", e)))?
}

fn unpack_blocking(archive: &Path, dest: &Path, platform: Platform, version: &str) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    let file = std::fs::File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(false);
    #[cfg(unix)]
    archive.set_unpack_xattrs(false);

    let entries = archive
        .entries()
        .map_err(|e| BackendError::Download(format!("bad agent bundle: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| BackendError::Download(format!("bad agent bundle entry: {}", e)))?;

        if entry.size() > MAX_ENTRY_SIZE {
            return Err(BackendError::Download(format!(
                "agent bundle entry too large ({} bytes)",
                entry.size()
            )));
        }

        // unpack_in refuses paths escaping `dest`
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| BackendError::Download(format!("failed to unpack bundle: {}", e)))?;
        if !unpacked {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            warn!(path = %path, "Skipped agent bundle entry outside the working directory");
        }
    }

    for name in ENTRY_POINTS {
        let path = dest.join(name);
        if !path.exists() {
            return Err(BackendError::Download(format!("agent bundle has no {}", name)));
        }
        make_executable(&path)?;
    }

    std::fs::write(dest.join(BUNDLE_MARKER), marker_contents(platform, version))?;
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// SHA-256 of a file, hex encoded.
pub async fn file_sha256(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| BackendError::Download(format!("hash task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    const LINUX_X64: Platform = Platform {
        os: "linux",
        arch: "x64",
    };

    fn write_bundle(path: &Path, files: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_bundle_url() {
        assert_eq!(
            bundle_url("https://example.com/releases/", LINUX_X64, "2.321.0"),
            "https://example.com/releases/v2.321.0/actions-runner-linux-x64-2.321.0.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_unpack_writes_marker_and_makes_scripts_executable() {
        let temp = tempfile::TempDir::new().unwrap();
        let archive = temp.path().join("bundle.tar.gz");
        write_bundle(
            &archive,
            &[
                ("config.sh", "#!/bin/sh\nexit 0\n"),
                ("run.sh", "#!/bin/sh\nexit 0\n"),
                ("bin/Runner.Listener", "binary"),
            ],
        );
        let dest = temp.path().join("runner");

        unpack(archive, dest.clone(), LINUX_X64, "2.321.0".to_string())
            .await
            .unwrap();

        assert!(is_unpacked(&dest, LINUX_X64, "2.321.0"));
        assert!(!is_unpacked(&dest, LINUX_X64, "2.322.0"));
        assert!(dest.join("bin/Runner.Listener").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dest.join("run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn test_unpack_rejects_bundle_without_entry_points() {
        let temp = tempfile::TempDir::new().unwrap();
        let archive = temp.path().join("bundle.tar.gz");
        write_bundle(&archive, &[("README.md", "nothing here")]);

        let err = unpack(archive, temp.path().join("runner"), LINUX_X64, "1".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Download(_)));
    }

    #[tokio::test]
    async fn test_concurrent_first_downloads_share_cache() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let body = vec![7u8; 256 * 1024];
        let expected = format!("{:x}", Sha256::digest(&body));
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.321.0/actions-runner-linux-x64-2.321.0.tar.gz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body)
                    .set_delay(std::time::Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let temp = tempfile::TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let http = reqwest::Client::new();
        let base_url = server.uri();

        let downloads = (0..6).map(|_| {
            ensure_cached(&http, &base_url, &cache, LINUX_X64, "2.321.0", Some(&expected))
        });
        let results = futures::future::join_all(downloads).await;

        for result in results {
            let archive = result.expect("every download should succeed");
            assert_eq!(file_sha256(archive).await.unwrap(), expected);
        }
        let leftovers = std::fs::read_dir(&cache)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_file_sha256() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("data");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
