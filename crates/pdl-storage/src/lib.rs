//! Dataset fetch utilities: HTTP client, remote source description and
//! download-to-file artifacts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pdl_core::{parse_rows_page, DatasetRow, DATASET_PAGE_LENGTH};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pdl-storage";

pub const DEFAULT_DATASET_BASE_URL: &str = "https://datasets-server.huggingface.co/rows";
pub const DEFAULT_DATASET_ID: &str = "fka/awesome-chatgpt-prompts";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid dataset url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding dataset rows from {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("file error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Remote page of the dataset-server `rows` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSource {
    pub base_url: String,
    pub dataset: String,
    pub config: String,
    pub split: String,
    pub offset: u32,
    pub length: u32,
}

impl Default for DatasetSource {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DATASET_BASE_URL.to_string(),
            dataset: DEFAULT_DATASET_ID.to_string(),
            config: "default".to_string(),
            split: "train".to_string(),
            offset: 0,
            length: DATASET_PAGE_LENGTH,
        }
    }
}

impl DatasetSource {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn rows_url(&self) -> Result<Url, FetchError> {
        let offset = self.offset.to_string();
        let length = self.length.to_string();
        Url::parse_with_params(
            &self.base_url,
            &[
                ("dataset", self.dataset.as_str()),
                ("config", self.config.as_str()),
                ("split", self.split.as_str()),
                ("offset", offset.as_str()),
                ("length", length.as_str()),
            ],
        )
        .map_err(|err| FetchError::InvalidUrl {
            url: self.base_url.clone(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Single-shot HTTP GET client. Retries belong to the pipeline stage, not here.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: Url) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url = %url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub downloaded_at: DateTime<Utc>,
}

/// Fetches the configured dataset page, either into memory or onto disk.
#[derive(Debug, Clone)]
pub struct DatasetFetcher {
    http: HttpFetcher,
    source: DatasetSource,
}

impl DatasetFetcher {
    pub fn new(http: HttpFetcher, source: DatasetSource) -> Self {
        Self { http, source }
    }

    /// Direct variant: one GET, decoded in memory.
    pub async fn fetch_rows(&self, run_id: Uuid) -> Result<Vec<DatasetRow>, FetchError> {
        let url = self.source.rows_url()?;
        let resp = self.http.fetch_bytes(run_id, url).await?;
        let rows = parse_rows_page(&resp.body).map_err(|source| FetchError::Decode {
            origin: resp.final_url.clone(),
            source,
        })?;
        info!(%run_id, rows = rows.len(), url = %resp.final_url, "dataset loaded");
        Ok(rows)
    }

    /// Download variant: writes the raw page body to `dest`, creating its directory.
    ///
    /// The file is replaced atomically, so a failed download leaves any previous
    /// file untouched.
    pub async fn download_to(
        &self,
        run_id: Uuid,
        dest: &Path,
    ) -> Result<DownloadedArtifact, FetchError> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| FetchError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let url = self.source.rows_url()?;
        let resp = self.http.fetch_bytes(run_id, url).await?;
        write_atomic(dest, &resp.body).await?;

        let artifact = DownloadedArtifact {
            path: dest.to_path_buf(),
            content_hash: sha256_hex(&resp.body),
            byte_size: resp.body.len(),
            downloaded_at: Utc::now(),
        };
        info!(
            %run_id,
            path = %artifact.path.display(),
            bytes = artifact.byte_size,
            sha256 = %artifact.content_hash,
            "dataset file downloaded"
        );
        Ok(artifact)
    }
}

/// Parse a previously downloaded page file.
pub async fn read_rows_file(path: &Path) -> Result<Vec<DatasetRow>, FetchError> {
    let bytes = fs::read(path).await.map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_rows_page(&bytes).map_err(|source| FetchError::Decode {
        origin: path.display().to_string(),
        source,
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| FetchError::Io { path, source }
    };

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let temp_path = dest.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, dest).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(dest)(err));
    }
    Ok(())
}
