//! Following bill download links.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_DISPOSITION;
use thiserror::Error;
use url::Url;

/// Download links are one-shot and small; anything slower than this is treated as a failure.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuildFailed(reqwest::Error),
    #[error("failed to download {0}: {1}")]
    RequestFailure(Url, reqwest::Error),
}

/// The parts of an HTTP response needed to save a downloaded bill.
#[derive(Clone, Debug)]
pub struct Download {
    status: u16,
    content_disposition: Option<String>,
    body: Vec<u8>,
}

impl Download {
    #[must_use]
    pub fn new(status: u16, content_disposition: Option<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_disposition,
            body,
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn content_disposition(&self) -> Option<&str> {
        self.content_disposition.as_deref()
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// A `Downloader` performs a plain GET of a link found in an email.
#[async_trait]
pub trait Downloader {
    /// Fetch the given URL. Non-success statuses are not errors at this level; they are returned
    /// so the caller can decide what they mean.
    ///
    /// # Errors
    /// Returns a [`DownloadError`] if the request could not be completed at all.
    async fn get(&self, url: &Url) -> Result<Download, DownloadError>;
}

/// Downloads over HTTP with a bounded timeout.
pub struct HttpDownloader {
    http_client: reqwest::Client,
}

impl HttpDownloader {
    /// Make a new `HttpDownloader`.
    ///
    /// # Errors
    /// Returns [`DownloadError::ClientBuildFailed`] if the underlying client cannot be set up.
    pub fn new() -> Result<Self, DownloadError> {
        let http_client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(DownloadError::ClientBuildFailed)?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn get(&self, url: &Url) -> Result<Download, DownloadError> {
        debug!("Sending GET request to {url}");

        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| DownloadError::RequestFailure(url.clone(), err))?;

        let status = response.status().as_u16();
        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            // Some servers send raw UTF-8 filenames here, which `to_str` rejects
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

        let body = response
            .bytes()
            .await
            .map_err(|err| DownloadError::RequestFailure(url.clone(), err))?;

        Ok(Download::new(status, content_disposition, body.to_vec()))
    }
}
