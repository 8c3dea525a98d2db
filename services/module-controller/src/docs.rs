//! Documentation builder synchronization.
//!
//! Builders announce themselves through leases labelled
//! [`DOCS_LEASE_LABEL`]; each lease holder is an HTTP base address. Every
//! deployed module version has its documentation archive pushed to every
//! builder, followed by a build request.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use semver::Version;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::downloader::DownloadError;
use crate::model::{Lease, DOCS_LEASE_LABEL};
use crate::store::{LabelSelector, Store, StoreError};

/// Errors from documentation synchronization.
#[derive(Debug, Error)]
pub enum DocsError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered {status}: {body}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("documentation archive: {0}")]
    Archive(#[from] DownloadError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A documentation builder endpoint.
#[async_trait]
pub trait DocsBuilder: Send + Sync {
    /// Upload a module version's documentation archive.
    async fn send_documentation(
        &self,
        base: &str,
        module: &str,
        version: &Version,
        archive: Bytes,
    ) -> Result<(), DocsError>;

    /// Ask the builder to rebuild the site.
    async fn build(&self, base: &str) -> Result<(), DocsError>;
}

/// HTTP client for documentation builders.
pub struct DocsBuilderClient {
    client: Client,
}

impl DocsBuilderClient {
    pub fn new(timeout: Duration) -> Result<Self, DocsError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post(&self, url: String, body: Bytes) -> Result<(), DocsError> {
        let response = self.client.post(&url).body(body).send().await?;

        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(url = %url, status = %status, body = %body, "Documentation builder request failed");
            return Err(DocsError::UnexpectedStatus { url, status, body });
        }

        Ok(())
    }
}

#[async_trait]
impl DocsBuilder for DocsBuilderClient {
    async fn send_documentation(
        &self,
        base: &str,
        module: &str,
        version: &Version,
        archive: Bytes,
    ) -> Result<(), DocsError> {
        let url = format!("{}/loadDocArchive/{}/v{}", base, module, version);
        debug!(url = %url, size = archive.len(), "Sending documentation archive");
        self.post(url, archive).await
    }

    async fn build(&self, base: &str) -> Result<(), DocsError> {
        let url = format!("{}/build", base);
        debug!(url = %url, "Requesting documentation build");
        self.post(url, Bytes::new()).await
    }
}

/// Base addresses of every live documentation builder.
pub async fn builder_addresses(leases: &dyn Store<Lease>) -> Result<Vec<String>, StoreError> {
    let selector = LabelSelector::everything().with_key(DOCS_LEASE_LABEL);
    let mut addresses: Vec<String> = leases
        .list(&selector)
        .await?
        .into_iter()
        .filter_map(|lease| lease.spec.holder_identity)
        .filter(|holder| !holder.is_empty())
        .map(|holder| format!("http://{}", holder))
        .collect();
    addresses.sort();
    addresses.dedup();
    Ok(addresses)
}

/// Push an archive to every builder and trigger a build on each.
pub async fn publish(
    builder: &dyn DocsBuilder,
    addresses: &[String],
    module: &str,
    version: &Version,
    archive: Bytes,
) -> Result<(), DocsError> {
    for base in addresses {
        builder
            .send_documentation(base, module, version, archive.clone())
            .await?;
        builder.build(base).await?;
        info!(builder = %base, module = %module, version = %version, "Documentation published");
    }
    Ok(())
}
