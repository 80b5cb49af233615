//! Digest-keyed blob file storage over the remote object client.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::{
    client::ObjectClient,
    digest::is_multipart_etag,
    error::{StoreError, StoreResult},
};

/// Store, fetch and size blobs identified by digest. One implementation
/// per storage backend.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store a local file under its digest. Idempotent: storing a digest
    /// that is already durable is a no-op success.
    async fn store_file(&self, digest: &str, file: &Path) -> StoreResult<()>;

    /// Download the blob into `dest`. Returns `false` when the blob is
    /// absent or fails verification; the caller treats `false` as
    /// "unavailable" and falls back.
    async fn fetch_file(&self, digest: &str, dest: &Path) -> StoreResult<bool>;

    /// Remote content length without downloading. `None` when absent or
    /// failing verification.
    async fn fetch_length(&self, digest: &str) -> StoreResult<Option<u64>>;

    /// Delete the blob.
    async fn remove(&self, digest: &str) -> StoreResult<()>;
}

/// S3-bucket file storage: objects keyed `bucket_prefix + digest`, with
/// the store's ETag checked against the digest on every transfer.
pub struct S3FileStorage {
    client: Arc<dyn ObjectClient>,
    bucket_prefix: String,
    encrypted: bool,
}

impl S3FileStorage {
    pub fn new(client: Arc<dyn ObjectClient>, bucket_prefix: String, encrypted: bool) -> Self {
        Self {
            client,
            bucket_prefix,
            encrypted,
        }
    }

    fn key(&self, digest: &str) -> String {
        format!("{}{}", self.bucket_prefix, digest)
    }

    /// Whether the remote ETag confirms the digest. Multipart-composite
    /// tags are accepted as-is since they cannot be compared; encrypted
    /// uploads skip the check because the remote tag reflects ciphertext.
    fn etag_matches(&self, digest: &str, etag: Option<&str>) -> bool {
        if self.encrypted {
            return true;
        }
        match etag {
            Some(etag) => etag == digest || is_multipart_etag(etag),
            None => false,
        }
    }
}

#[async_trait]
impl FileStorage for S3FileStorage {
    async fn store_file(&self, digest: &str, file: &Path) -> StoreResult<()> {
        let key = self.key(digest);
        let etag = match self.client.head(&key).await {
            Ok(meta) => {
                debug!(digest = %digest, "blob already present, skipping upload");
                meta.etag
            }
            Err(err) if err.is_not_found() => {
                debug!(digest = %digest, "storing blob");
                self.client.store_file(&key, file).await?.etag
            }
            Err(err) => return Err(err),
        };
        // The remote checksum is the only independent confirmation the
        // bytes arrived intact; a mismatch must abort the write rather
        // than publish a corrupt digest mapping.
        if !self.etag_matches(digest, etag.as_deref()) {
            return Err(StoreError::IntegrityMismatch {
                digest: digest.to_string(),
                etag: etag.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn fetch_file(&self, digest: &str, dest: &Path) -> StoreResult<bool> {
        let key = self.key(digest);
        match self.client.fetch_file(&key, dest).await {
            Ok(meta) => {
                if self.etag_matches(digest, meta.etag.as_deref()) {
                    debug!(digest = %digest, size_bytes = meta.size_bytes, "fetched blob");
                    Ok(true)
                } else {
                    error!(
                        digest = %digest,
                        etag = %meta.etag.unwrap_or_default(),
                        "invalid ETag for fetched blob"
                    );
                    Ok(false)
                }
            }
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn fetch_length(&self, digest: &str) -> StoreResult<Option<u64>> {
        let key = self.key(digest);
        match self.client.head(&key).await {
            Ok(meta) => {
                if self.etag_matches(digest, meta.etag.as_deref()) {
                    Ok(Some(meta.size_bytes))
                } else {
                    error!(
                        digest = %digest,
                        etag = %meta.etag.unwrap_or_default(),
                        "invalid ETag for blob length lookup"
                    );
                    Ok(None)
                }
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn remove(&self, digest: &str) -> StoreResult<()> {
        self.client.delete(&self.key(digest)).await
    }
}
