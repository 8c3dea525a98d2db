//! Module artifact retrieval.
//!
//! A [`Downloader`] is built per [`ModuleSource`] and places module payloads
//! into the module tree. [`MirrorDownloader`] reads gzip'd tarballs from a
//! registry mirror, either a local directory or an HTTP(S) endpoint:
//!
//! ```text
//! <repo>/<module>/v<version>.tar.gz         release build
//! <repo>/<module>/v<version>.tar.gz.sha256  optional digest sidecar
//! <repo>/<module>/<tag>.tar.gz              development build
//! ```

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use extmod_reconcile::MIN_EXTERNAL_WEIGHT;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{Client, StatusCode};
use semver::Version;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fs::{ModuleTree, DEV_VERSION_DIR};
use crate::model::{ModuleDefinition, ModuleSource};

/// Definition file at the root of a module payload.
pub const DEFINITION_FILE: &str = "module.yaml";

/// Payload directories packed into documentation archives.
const DOCS_DIRS: [&str; 2] = ["docs", "openapi"];

/// Errors from artifact retrieval.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("artifact {0} not found")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("digest mismatch for {artifact}: expected {expected}, got {actual}")]
    DigestMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("invalid module definition: {0}")]
    Definition(#[from] serde_yaml::Error),

    #[error("unsupported registry scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("unpack task failed: {0}")]
    Task(String),
}

impl DownloadError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Fetches module payloads from one source.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Place `module` at `version` into `<root>/<module>/v<version>`.
    async fn download_by_version(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<PathBuf, DownloadError>;

    /// Place a development build into `<root>/<module>/dev` and read its definition.
    async fn download_dev_tag(
        &self,
        module: &str,
        tag: &str,
    ) -> Result<ModuleDefinition, DownloadError>;

    /// A tar.gz of the version's documentation and schemas.
    async fn documentation_archive(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<Bytes, DownloadError>;
}

/// Builds a [`Downloader`] for a source.
pub trait DownloaderFactory: Send + Sync {
    fn for_source(&self, source: &ModuleSource) -> Result<Arc<dyn Downloader>, DownloadError>;
}

/// Registry settings derived from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    pub repo: String,
    pub scheme: String,
    pub dockercfg: Option<String>,
    pub ca: Option<String>,
}

impl RegistryOptions {
    pub fn from_source(source: &ModuleSource) -> Self {
        let registry = &source.spec.registry;
        Self {
            repo: registry.repo.trim_end_matches('/').to_string(),
            scheme: registry
                .scheme
                .as_deref()
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| "https".to_string()),
            dockercfg: registry.dockercfg.clone(),
            ca: registry.ca.clone(),
        }
    }
}

/// Where a mirror's artifacts are read from.
enum Transport {
    Dir(PathBuf),
    Http { client: Client, base: String },
}

impl Transport {
    fn new(options: &RegistryOptions, timeout: Duration) -> Result<Self, DownloadError> {
        match options.scheme.as_str() {
            "file" => Ok(Self::Dir(PathBuf::from(&options.repo))),
            "http" | "https" => {
                let mut builder = Client::builder().timeout(timeout);
                if let Some(ca) = &options.ca {
                    let cert = reqwest::Certificate::from_pem(ca.as_bytes())?;
                    builder = builder.add_root_certificate(cert);
                }
                Ok(Self::Http {
                    client: builder.build()?,
                    base: format!("{}://{}", options.scheme, options.repo),
                })
            }
            other => Err(DownloadError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Read an artifact. Returns `None` if it does not exist.
    async fn fetch(&self, artifact: &str) -> Result<Option<Bytes>, DownloadError> {
        match self {
            Self::Dir(dir) => match tokio::fs::read(dir.join(artifact)).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            Self::Http { client, base } => {
                let url = format!("{}/{}", base, artifact);
                debug!(url = %url, "Fetching artifact");
                let response = client.get(&url).send().await?;
                match response.status() {
                    StatusCode::OK => Ok(Some(response.bytes().await?)),
                    StatusCode::NOT_FOUND => Ok(None),
                    _ => Err(response
                        .error_for_status()
                        .err()
                        .map(DownloadError::Http)
                        .unwrap_or_else(|| DownloadError::NotFound(url))),
                }
            }
        }
    }
}

/// Reads module tarballs from a registry mirror.
pub struct MirrorDownloader {
    tree: ModuleTree,
    transport: Transport,
}

impl MirrorDownloader {
    pub fn new(
        tree: ModuleTree,
        options: &RegistryOptions,
        timeout: Duration,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            tree,
            transport: Transport::new(options, timeout)?,
        })
    }

    /// Fetch an artifact and check it against its `.sha256` sidecar, if any.
    async fn fetch_verified(&self, artifact: &str) -> Result<Bytes, DownloadError> {
        let data = self
            .transport
            .fetch(artifact)
            .await?
            .ok_or_else(|| DownloadError::NotFound(artifact.to_string()))?;

        if let Some(sidecar) = self.transport.fetch(&format!("{}.sha256", artifact)).await? {
            let expected = String::from_utf8_lossy(&sidecar)
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();
            let actual = hex::encode(Sha256::digest(&data));
            if expected != actual {
                return Err(DownloadError::DigestMismatch {
                    artifact: artifact.to_string(),
                    expected,
                    actual,
                });
            }
        }

        Ok(data)
    }

    /// Unpack `data` into `<root>/<module>/<version_dir>`, replacing what was there.
    async fn install(
        &self,
        module: &str,
        version_dir: &str,
        data: Bytes,
    ) -> Result<PathBuf, DownloadError> {
        let dest = self.tree.version_dir(module, version_dir);
        let staging = self
            .tree
            .module_dir(module)
            .join(format!(".{}.partial", version_dir));

        let task_dest = dest.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DownloadError> {
            remove_dir_if_exists(&staging)?;
            fs::create_dir_all(&staging)?;
            unpack(&data, &staging)?;
            remove_dir_if_exists(&task_dest)?;
            fs::rename(&staging, &task_dest)?;
            Ok(())
        })
        .await
        .map_err(|e| DownloadError::Task(e.to_string()))??;

        Ok(dest)
    }
}

#[async_trait]
impl Downloader for MirrorDownloader {
    async fn download_by_version(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<PathBuf, DownloadError> {
        let version_dir = format!("v{}", version);
        let artifact = format!("{}/{}.tar.gz", module, version_dir);

        let data = self.fetch_verified(&artifact).await?;
        let path = self.install(module, &version_dir, data).await?;

        info!(module = %module, version = %version, path = %path.display(), "Module downloaded");
        Ok(path)
    }

    async fn download_dev_tag(
        &self,
        module: &str,
        tag: &str,
    ) -> Result<ModuleDefinition, DownloadError> {
        let artifact = format!("{}/{}.tar.gz", module, tag);

        let data = self.fetch_verified(&artifact).await?;
        let path = self.install(module, DEV_VERSION_DIR, data).await?;
        let definition = read_definition(module, &path)?;

        info!(module = %module, tag = %tag, weight = definition.weight, "Development build downloaded");
        Ok(definition)
    }

    async fn documentation_archive(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<Bytes, DownloadError> {
        let version_dir = format!("v{}", version);
        let mut payload = self.tree.version_dir(module, &version_dir);
        if !payload.is_dir() {
            payload = self.download_by_version(module, version).await?;
        }

        let archive = tokio::task::spawn_blocking(move || pack_docs(&payload))
            .await
            .map_err(|e| DownloadError::Task(e.to_string()))??;
        Ok(Bytes::from(archive))
    }
}

/// Builds a [`MirrorDownloader`] per source.
pub struct MirrorDownloaderFactory {
    tree: ModuleTree,
    timeout: Duration,
}

impl MirrorDownloaderFactory {
    pub fn new(tree: ModuleTree, timeout: Duration) -> Self {
        Self { tree, timeout }
    }
}

impl DownloaderFactory for MirrorDownloaderFactory {
    fn for_source(&self, source: &ModuleSource) -> Result<Arc<dyn Downloader>, DownloadError> {
        let options = RegistryOptions::from_source(source);
        if options.dockercfg.is_some() {
            debug!(source = %source.metadata.name, "Registry credentials ignored by mirror downloader");
        }
        Ok(Arc::new(MirrorDownloader::new(
            self.tree.clone(),
            &options,
            self.timeout,
        )?))
    }
}

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    name: Option<String>,
    weight: Option<u32>,
}

/// Read `module.yaml` from a payload directory.
///
/// A payload without a definition file gets the module name and the lowest
/// external weight.
pub fn read_definition(module: &str, path: &Path) -> Result<ModuleDefinition, DownloadError> {
    let file = path.join(DEFINITION_FILE);
    let parsed = match fs::read_to_string(&file) {
        Ok(content) => serde_yaml::from_str::<DefinitionFile>(&content)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => DefinitionFile {
            name: None,
            weight: None,
        },
        Err(e) => return Err(e.into()),
    };

    Ok(ModuleDefinition {
        name: parsed.name.unwrap_or_else(|| module.to_string()),
        weight: parsed.weight.unwrap_or(MIN_EXTERNAL_WEIGHT),
        path: path.to_path_buf(),
    })
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Unpack a tarball, gzip'd or not, skipping entries that escape `dest`.
fn unpack(data: &[u8], dest: &Path) -> Result<(), DownloadError> {
    if is_gzip(data) {
        extract(Archive::new(GzDecoder::new(data)), dest)
    } else {
        extract(Archive::new(data), dest)
    }
}

fn extract<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<(), DownloadError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(path = %path.display(), "Skipping entry outside the payload");
            continue;
        }

        entry.unpack_in(dest)?;
    }
    Ok(())
}

fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == [0x1f, 0x8b]
}

fn pack_docs(payload: &Path) -> Result<Vec<u8>, DownloadError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for dir in DOCS_DIRS {
        let source = payload.join(dir);
        if source.is_dir() {
            builder.append_dir_all(dir, &source)?;
        }
    }

    Ok(builder.into_inner()?.finish()?)
}
