//! Object-store backed coordination store.
//!
//! Alias paths map one-to-one onto object keys under an optional prefix.
//!
//! ```text
//! # Local filesystem (dev/testing)
//! TOKENSYNC_REMOTE_STORE=type=object;address=file:///var/lib/tokensync
//!
//! # S3 / MinIO
//! TOKENSYNC_REMOTE_STORE=type=object;address=s3://my-bucket?region=us-east-1&endpoint=http://minio:9000
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{path::Path, ObjectStore};

use super::{RemoteStore, StoreResult};

const DEFAULT_S3_REGION: &str = "us-east-1";

pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let (store, prefix) = StoreAddress::parse(url)?.connect()?;
        tracing::info!(url = %url, prefix = %prefix, "using object store backend");
        Ok(Self::new(store, prefix))
    }

    fn object_path(&self, path: &str) -> Path {
        let key = path.trim_matches('/');
        if self.prefix.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.prefix, key))
        }
    }
}

#[async_trait]
impl RemoteStore for ObjectStoreBackend {
    async fn exists(&self, path: &str) -> StoreResult<bool> {
        match self.store.head(&self.object_path(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        let bytes = self
            .store
            .get(&self.object_path(path))
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    async fn write(&self, path: &str, value: &[u8]) -> StoreResult<()> {
        self.store
            .put(&self.object_path(path), Bytes::copy_from_slice(value).into())
            .await?;
        tracing::debug!(path = %path, "alias written to object store");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<BTreeSet<String>> {
        let listing = self
            .store
            .list_with_delimiter(Some(&self.object_path(prefix)))
            .await?;

        let dirs = listing.common_prefixes.iter();
        let files = listing.objects.iter().map(|meta| &meta.location);
        Ok(dirs
            .chain(files)
            .filter_map(|p| p.filename().map(String::from))
            .collect())
    }
}

/// Parsed `TOKENSYNC_REMOTE_STORE` object address.
#[derive(Debug, PartialEq)]
enum StoreAddress {
    Local {
        root: String,
    },
    S3 {
        bucket: String,
        params: HashMap<String, String>,
    },
}

impl StoreAddress {
    fn parse(url: &str) -> Result<Self> {
        if let Some(root) = url.strip_prefix("file://") {
            return Ok(Self::Local {
                root: root.to_string(),
            });
        }
        let Some(rest) = url.strip_prefix("s3://") else {
            anyhow::bail!("unsupported object store url scheme: {}", url);
        };

        let (bucket, query) = rest.split_once('?').unwrap_or((rest, ""));
        if bucket.is_empty() {
            anyhow::bail!("s3 address has no bucket: {}", url);
        }
        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| -> Result<(String, String)> {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = urlencoding::decode(value)
                    .with_context(|| format!("bad percent-encoding in s3 param {key}"))?;
                Ok((key.to_string(), value.into_owned()))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self::S3 {
            bucket: bucket.to_string(),
            params,
        })
    }

    /// Build the object store and the key prefix aliases live under.
    fn connect(self) -> Result<(Arc<dyn ObjectStore>, String)> {
        match self {
            Self::Local { root } => {
                std::fs::create_dir_all(&root)
                    .with_context(|| format!("failed to create store directory {root}"))?;
                let store: Arc<dyn ObjectStore> = Arc::new(
                    LocalFileSystem::new_with_prefix(&root)
                        .context("failed to open local object store")?,
                );
                Ok((store, String::new()))
            }
            Self::S3 { bucket, mut params } => {
                // Credentials and other AWS_* settings come from the environment.
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(
                        params
                            .remove("region")
                            .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                    );
                if let Some(endpoint) = params.remove("endpoint") {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                let store: Arc<dyn ObjectStore> =
                    Arc::new(builder.build().context("failed to build S3 object store")?);
                Ok((store, params.remove("prefix").unwrap_or_default()))
            }
        }
    }
}
