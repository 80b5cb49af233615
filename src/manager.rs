//! Entry point tying the pieces together: one manager per configured
//! bucket, handing out storage, GC and direct-download facades over a
//! shared client.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    client::ObjectClient,
    config::S3StorageConfig,
    error::StoreResult,
    gc::BucketGarbageCollector,
    s3::S3ObjectClient,
    storage::S3FileStorage,
};

/// Multipart uploads abandoned for longer than this are aborted at
/// startup so their parts stop accruing storage.
const STALE_UPLOAD_AGE: Duration = Duration::from_secs(60 * 60 * 24);

pub struct S3BinaryManager {
    config: S3StorageConfig,
    client: Arc<dyn ObjectClient>,
}

impl S3BinaryManager {
    pub async fn new(config: S3StorageConfig) -> StoreResult<Self> {
        config.validate()?;
        let client = Arc::new(S3ObjectClient::new(&config, false).await?);
        let manager = Self::new_with_client(config, client);
        // Best effort; a failure here must not block startup.
        match manager.client.abort_stale_uploads(STALE_UPLOAD_AGE).await {
            Ok(0) => {}
            Ok(aborted) => info!(aborted, "aborted stale multipart uploads"),
            Err(err) => warn!(error = %err, "unable to abort stale multipart uploads"),
        }
        Ok(manager)
    }

    /// Wire the manager over a pre-built client, for alternate backends.
    pub fn new_with_client(config: S3StorageConfig, client: Arc<dyn ObjectClient>) -> Self {
        Self { config, client }
    }

    pub fn file_storage(&self) -> S3FileStorage {
        S3FileStorage::new(
            self.client.clone(),
            self.config.normalized_prefix(),
            self.config.is_encrypted(),
        )
    }

    pub fn garbage_collector(&self) -> BucketGarbageCollector {
        BucketGarbageCollector::new(
            self.client.clone(),
            &self.config.bucket,
            self.config.normalized_prefix(),
        )
    }

    /// Delete the given blobs outright, bypassing GC.
    pub async fn remove_binaries(&self, digests: &[String]) -> StoreResult<()> {
        let prefix = self.config.normalized_prefix();
        for digest in digests {
            self.client.delete(&format!("{}{}", prefix, digest)).await?;
        }
        Ok(())
    }

    /// Pre-signed download URL for a blob, when direct download is
    /// enabled. `None` means the caller should stream the bytes itself.
    pub async fn download_uri(&self, digest: &str) -> StoreResult<Option<String>> {
        if !self.config.direct_download {
            return Ok(None);
        }
        let key = format!("{}{}", self.config.normalized_prefix(), digest);
        let expires_in = Duration::from_secs(self.config.direct_download_expire_secs);
        let uri = self.client.presign_download(&key, expires_in).await?;
        Ok(Some(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{digest::content_digest, storage::FileStorage, testing::InMemoryObjectClient};

    fn manager(client: Arc<InMemoryObjectClient>, direct_download: bool) -> S3BinaryManager {
        let config = S3StorageConfig {
            bucket: "docs-bucket".to_string(),
            bucket_prefix: "docs/".to_string(),
            direct_download,
            ..Default::default()
        };
        S3BinaryManager::new_with_client(config, client)
    }

    #[tokio::test]
    async fn test_remove_binaries() {
        let client = Arc::new(InMemoryObjectClient::new());
        let data = b"to be removed".to_vec();
        let digest = content_digest(&data);
        client.insert_raw(&format!("docs/{}", digest), data, &digest, None);

        let manager = manager(client.clone(), false);
        manager.remove_binaries(&[digest.clone()]).await.unwrap();
        assert!(client.head(&format!("docs/{}", digest)).await.is_err());
    }

    #[tokio::test]
    async fn test_download_uri_disabled() {
        let client = Arc::new(InMemoryObjectClient::new());
        let manager = manager(client, false);
        assert!(manager.download_uri("0123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_uri_enabled() {
        let client = Arc::new(InMemoryObjectClient::new());
        let data = b"downloadable".to_vec();
        let digest = content_digest(&data);
        client.insert_raw(&format!("docs/{}", digest), data, &digest, None);

        let manager = manager(client, true);
        let uri = manager.download_uri(&digest).await.unwrap().unwrap();
        assert!(uri.contains(&digest));
    }

    #[tokio::test]
    async fn test_facades_share_the_prefix() {
        let client = Arc::new(InMemoryObjectClient::new());
        let manager = manager(client.clone(), false);

        let storage = manager.file_storage();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"shared prefix").unwrap();
        let digest = content_digest(b"shared prefix");
        storage.store_file(&digest, &path).await.unwrap();

        let gc = manager.garbage_collector();
        assert_eq!(gc.id(), "s3:docs-bucket");
        assert!(client.head(&format!("docs/{}", digest)).await.is_ok());
    }
}
