//! Download and install the managed Caddy binary
//!
//! Fetches the latest release tag from the GitHub API, downloads the
//! platform asset and extracts the single binary into place. Everything
//! here is a collaborator of the supervisor, not part of it.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const RELEASES_URL: &str = "https://api.github.com/repos/caddyserver/caddy/releases/latest";

pub struct Installer {
    target: PathBuf,
    client: reqwest::Client,
}

impl Installer {
    pub fn new(target: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        Self { target, client }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Install or update the binary. Skips the download when the target
    /// already exists, unless `force`.
    pub async fn install(&self, force: bool) -> Result<()> {
        if self.target.exists() && !force {
            info!(path = %self.target.display(), "Binary already installed");
            return Ok(());
        }

        let version = self.latest_version().await?;
        info!(%version, "Installing caddy");

        let asset = asset_name(&version, std::env::consts::OS, std::env::consts::ARCH)?;
        let url = format!(
            "https://github.com/caddyserver/caddy/releases/download/v{version}/{asset}"
        );

        info!(%url, "Downloading release asset");
        let archive = self
            .client
            .get(&url)
            .send()
            .await
            .context("download request failed")?
            .error_for_status()
            .context("download rejected")?
            .bytes()
            .await
            .context("download interrupted")?;

        let staging = tempfile::tempdir().context("cannot create staging directory")?;
        let extracted = extract_binary(&archive, &asset, staging.path())?;

        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent)?;
        }
        // rename fails across filesystems, fall back to copy
        if fs::rename(&extracted, &self.target).is_err() {
            fs::copy(&extracted, &self.target)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.target, fs::Permissions::from_mode(0o755))?;
        }

        info!(path = %self.target.display(), "Binary installed");
        Ok(())
    }

    async fn latest_version(&self) -> Result<String> {
        let release: serde_json::Value = self
            .client
            .get(RELEASES_URL)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("release lookup failed")?
            .error_for_status()
            .context("release lookup rejected")?
            .json()
            .await
            .context("release metadata is not JSON")?;

        let tag = release["tag_name"]
            .as_str()
            .context("release metadata has no tag_name")?;
        Ok(tag.trim_start_matches('v').to_string())
    }
}

/// Where the managed binary is expected: `caddy` on `PATH` when present,
/// otherwise next to the current working directory
pub fn default_binary_path() -> PathBuf {
    let name = binary_file_name();
    if let Some(found) = find_in_path(name) {
        return found;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(name)
}

fn binary_file_name() -> &'static str {
    if cfg!(windows) {
        "caddy.exe"
    } else {
        "caddy"
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Release asset for this platform, following the upstream naming scheme
fn asset_name(version: &str, os: &str, arch: &str) -> Result<String> {
    let arch = match arch {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" | "arm64" => "arm64",
        other => bail!("unsupported architecture: {other}"),
    };
    let name = match os {
        "linux" => format!("caddy_{version}_linux_{arch}.tar.gz"),
        "macos" => format!("caddy_{version}_mac_{arch}.tar.gz"),
        "windows" => format!("caddy_{version}_windows_{arch}.zip"),
        other => bail!("unsupported operating system: {other}"),
    };
    Ok(name)
}

/// Pull the single binary out of the downloaded archive
fn extract_binary(archive: &[u8], asset: &str, staging: &Path) -> Result<PathBuf> {
    if asset.ends_with(".zip") {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).context("invalid zip archive")?;
        let mut entry = zip
            .by_name("caddy.exe")
            .context("archive has no caddy.exe entry")?;
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        let out = staging.join("caddy.exe");
        fs::write(&out, content)?;
        Ok(out)
    } else {
        let decoder = flate2::read::GzDecoder::new(archive);
        let mut tar = tar::Archive::new(decoder);
        for entry in tar.entries().context("invalid tar archive")? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if path.as_path() == Path::new("caddy") {
                let out = staging.join("caddy");
                entry.unpack(&out)?;
                return Ok(out);
            }
        }
        bail!("archive has no caddy entry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_name_linux_amd64() {
        assert_eq!(
            asset_name("2.8.4", "linux", "x86_64").unwrap(),
            "caddy_2.8.4_linux_amd64.tar.gz"
        );
    }

    #[test]
    fn test_asset_name_mac_arm64() {
        assert_eq!(
            asset_name("2.8.4", "macos", "aarch64").unwrap(),
            "caddy_2.8.4_mac_arm64.tar.gz"
        );
    }

    #[test]
    fn test_asset_name_windows_zip() {
        assert_eq!(
            asset_name("2.8.4", "windows", "x86_64").unwrap(),
            "caddy_2.8.4_windows_amd64.zip"
        );
    }

    #[test]
    fn test_asset_name_rejects_unknown_platform() {
        assert!(asset_name("2.8.4", "plan9", "x86_64").is_err());
        assert!(asset_name("2.8.4", "linux", "mips").is_err());
    }

    #[test]
    fn test_extract_from_tar_gz() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        // build a small caddy-shaped tar.gz in memory
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let content = b"#!/bin/sh\necho caddy\n";
            let mut header = tar::Header::new_gnu();
            header.set_path("caddy").unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, &content[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut gz, &tar_bytes).unwrap();
        let archive = gz.finish().unwrap();

        let staging = tempfile::tempdir().unwrap();
        let extracted =
            extract_binary(&archive, "caddy_2.8.4_linux_amd64.tar.gz", staging.path()).unwrap();
        assert!(extracted.ends_with("caddy"));
        assert!(extracted.exists());
    }

    #[test]
    fn test_extract_missing_entry_errors() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let content = b"not the binary";
            let mut header = tar::Header::new_gnu();
            header.set_path("README.md").unwrap();
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder.append(&header, &content[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut gz, &tar_bytes).unwrap();
        let archive = gz.finish().unwrap();

        let staging = tempfile::tempdir().unwrap();
        assert!(
            extract_binary(&archive, "caddy_2.8.4_linux_amd64.tar.gz", staging.path()).is_err()
        );
    }
}
