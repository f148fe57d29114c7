//! HTTP client for the remote CAS site.
//!
//! Grounded on `clients/src/courier/v1/client.rs`'s `Client` (cheap-clone
//! `reqwest::Client` wrapper, `bearer_auth`-free here since the remote CAS
//! server is a same-trust-boundary cache service, not Courier's multi-tenant
//! API) and the `cas_exists`/bulk read/write shape of that client.

use bxl_types::ContentHash;
use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display};
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::instrument;
use url::Url;

/// Client for a remote CAS site.
///
/// Cheaply cloneable; clones share the underlying HTTP connection pool.
#[derive(Clone, Debug, Display)]
#[display("{base}")]
pub struct RemoteCasSite {
    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,
    #[debug(skip)]
    http: reqwest::Client,
}

impl RemoteCasSite {
    pub fn new(base: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .context("build http client")?;
        Ok(Self {
            base: Arc::new(base),
            http,
        })
    }

    fn blob_url(&self, hash: &ContentHash) -> Result<Url> {
        self.base
            .join(&format!("api/v1/cas/{}", hash.to_hex()))
            .context("build blob url")
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        let url = self.blob_url(hash)?;
        let response = self.http.head(url).send().await.context("send")?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(unexpected_status(status, &response)),
        }
    }

    #[instrument(skip(self, content))]
    pub async fn store(&self, hash: &ContentHash, content: Vec<u8>) -> Result<()> {
        let url = self.blob_url(hash)?;
        let response = self
            .http
            .put(url)
            .body(content)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            status => Err(unexpected_status(status, &response)),
        }
    }

    #[instrument(skip(self))]
    pub async fn read(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let url = self.blob_url(hash)?;
        let response = self.http.get(url).send().await.context("send")?;
        match response.status() {
            StatusCode::OK => response
                .bytes()
                .await
                .context("read body")
                .map(|b| Some(b.to_vec())),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected_status(status, &response)),
        }
    }
}

fn unexpected_status(status: StatusCode, response: &reqwest::Response) -> color_eyre::Report {
    let url = response.url().to_string();
    eyre!("unexpected status code: {status}").with_section(|| url.header("Url:"))
}
