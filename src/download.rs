//! Package downloads.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{self, File};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Fetches a package archive to a local file.
pub trait Downloader: Send + Sync {
    /// Download `url`, sending `bearer` as an `Authorization` token when given.
    /// Returns the path of the downloaded file; the caller removes it.
    fn download(&self, url: &str, bearer: Option<&str>) -> Result<PathBuf>;
}

/// Downloads into `<downloads_dir>/<uuid>.zip`.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
    downloads_dir: PathBuf,
}

impl HttpDownloader {
    pub fn new(downloads_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("moduledepot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            downloads_dir: downloads_dir.into(),
        })
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, bearer: Option<&str>) -> Result<PathBuf> {
        fs::create_dir_all(&self.downloads_dir).context(format!(
            "Failed to create downloads directory: {:?}",
            self.downloads_dir
        ))?;

        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        debug!(url = %url, "Downloading module package");

        let mut response = request
            .send()
            .map_err(|e| anyhow!("Failed to download module from {}: {}", url, e))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Failed to download module from {}: HTTP {}", url, status);
        }

        let path = self
            .downloads_dir
            .join(format!("{}.zip", uuid::Uuid::new_v4()));
        let mut file = File::create(&path).context(format!("Failed to create {:?}", path))?;
        if let Err(e) = response.copy_to(&mut file) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(anyhow!("Failed to download module from {}: {}", url, e));
        }

        info!(url = %url, path = ?path, "Module package downloaded");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("module_downloads");
        let downloader = HttpDownloader::new(&downloads, Duration::from_secs(2)).unwrap();

        // Nothing listens on the discard port.
        let result = downloader.download("http://127.0.0.1:9/module.zip", Some("token"));
        assert!(result.is_err());
        assert_eq!(fs::read_dir(&downloads).unwrap().count(), 0);
    }
}
