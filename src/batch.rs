//! Direct-upload batches: clients push bytes straight to the bucket under
//! short-lived, batch-scoped credentials, and completion turns the raw
//! uploaded object into a verified, digest-identified blob.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sts::config::{Credentials, Region};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    client::ObjectClient,
    config::S3StorageConfig,
    digest::is_multipart_etag,
    error::{StoreError, StoreResult},
    s3::{S3ObjectClient, NON_MULTIPART_COPY_MAX_SIZE},
};

/// Time-limited credentials scoped to one batch. Never reused across
/// batches, never persisted beyond the batch's properties.
#[derive(Debug, Clone)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration_millis: i64,
}

/// Issues batch-scoped temporary credentials via role assumption.
#[async_trait]
pub trait CredentialsIssuer: Send + Sync {
    async fn issue(&self, role_arn: &str, session_name: &str) -> StoreResult<TemporaryCredentials>;
}

/// STS-backed issuer.
pub struct StsCredentialsIssuer {
    client: aws_sdk_sts::Client,
}

impl StsCredentialsIssuer {
    pub async fn new(config: &S3StorageConfig) -> StoreResult<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(id, secret, None, None, "config"));
        }
        let sdk_config = loader.load().await;
        Ok(Self {
            client: aws_sdk_sts::Client::new(&sdk_config),
        })
    }
}

#[async_trait]
impl CredentialsIssuer for StsCredentialsIssuer {
    async fn issue(&self, role_arn: &str, session_name: &str) -> StoreResult<TemporaryCredentials> {
        let out = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .send()
            .await
            .map_err(|e| StoreError::Credentials {
                reason: e.to_string(),
            })?;
        let credentials = out.credentials().ok_or_else(|| StoreError::Credentials {
            reason: "assume-role response carried no credentials".to_string(),
        })?;
        let expiration_millis =
            credentials
                .expiration()
                .to_millis()
                .map_err(|e| StoreError::Credentials {
                    reason: format!("unrepresentable expiration: {}", e),
                })?;
        Ok(TemporaryCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration_millis,
        })
    }
}

/// The batch-visible properties returned to the client. These are the only
/// values a client ever sees; the long-lived root credentials are not
/// among them.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProperties {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration_millis: i64,
    pub bucket: String,
    pub base_key: String,
    pub region: Option<String>,
    pub use_accelerate: bool,
}

/// A transient upload session.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub id: String,
    pub properties: BatchProperties,
}

/// What the client tells us about a file it uploaded out-of-band.
#[derive(Debug, Clone)]
pub struct BatchFileInfo {
    /// Client-chosen object key the bytes were uploaded under.
    pub key: String,
    pub filename: String,
    pub mime_type: Option<String>,
}

/// A finalized blob. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobDescriptor {
    /// `<providerId>:<finalTag>`.
    pub key: String,
    pub digest: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub length: u64,
}

struct BatchEntry {
    created: Instant,
    files: HashMap<String, BlobDescriptor>,
}

/// In-process transient session store. Entries expire on access after the
/// configured TTL.
pub struct TransientBatchStore {
    entries: DashMap<String, BatchEntry>,
    ttl: Duration,
}

impl TransientBatchStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Open a new batch session and return its opaque id.
    pub fn begin(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.entries.insert(
            id.clone(),
            BatchEntry {
                created: Instant::now(),
                files: HashMap::new(),
            },
        );
        id
    }

    fn expire(&self, batch_id: &str) -> bool {
        let expired = self
            .entries
            .get(batch_id)
            .map(|entry| entry.created.elapsed() > self.ttl)
            .unwrap_or(false);
        if expired {
            self.entries.remove(batch_id);
            debug!(batch_id = %batch_id, "expired upload batch");
        }
        expired
    }

    pub fn contains(&self, batch_id: &str) -> bool {
        !self.expire(batch_id) && self.entries.contains_key(batch_id)
    }

    fn attach_file(&self, batch_id: &str, file_index: &str, descriptor: BlobDescriptor) -> bool {
        if self.expire(batch_id) {
            return false;
        }
        match self.entries.get_mut(batch_id) {
            Some(mut entry) => {
                entry.files.insert(file_index.to_string(), descriptor);
                true
            }
            None => false,
        }
    }

    pub fn file(&self, batch_id: &str, file_index: &str) -> Option<BlobDescriptor> {
        self.entries
            .get(batch_id)
            .and_then(|entry| entry.files.get(file_index).cloned())
    }
}

/// Handler for the direct-upload protocol: issues scoped credentials for a
/// session and adopts the uploaded objects on completion.
pub struct DirectUploadHandler {
    client: Arc<dyn ObjectClient>,
    issuer: Arc<dyn CredentialsIssuer>,
    batches: TransientBatchStore,
    bucket: String,
    bucket_prefix: String,
    region: Option<String>,
    role_arn: String,
    accelerate: bool,
    provider_id: String,
    non_multipart_copy_max_size: u64,
}

impl std::fmt::Debug for DirectUploadHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectUploadHandler")
            .field("bucket", &self.bucket)
            .field("bucket_prefix", &self.bucket_prefix)
            .field("region", &self.region)
            .field("role_arn", &self.role_arn)
            .field("accelerate", &self.accelerate)
            .field("provider_id", &self.provider_id)
            .field("non_multipart_copy_max_size", &self.non_multipart_copy_max_size)
            .finish_non_exhaustive()
    }
}

impl DirectUploadHandler {
    /// Build the handler from configuration. Credentials, bucket, region
    /// and role ARN are mandatory here even where the plain store can fall
    /// back to ambient defaults, because they are handed to STS.
    pub async fn new(config: &S3StorageConfig) -> StoreResult<Self> {
        let direct_upload = config
            .direct_upload
            .clone()
            .ok_or_else(|| missing_property("direct_upload"))?;
        if config.access_key_id.as_deref().unwrap_or("").is_empty() {
            return Err(missing_property("access_key_id"));
        }
        if config.secret_access_key.as_deref().unwrap_or("").is_empty() {
            return Err(missing_property("secret_access_key"));
        }
        if config.bucket.is_empty() {
            return Err(missing_property("bucket"));
        }
        if config.region.as_deref().unwrap_or("").is_empty() {
            return Err(missing_property("region"));
        }
        if direct_upload.role_arn.is_empty() {
            return Err(missing_property("direct_upload.role_arn"));
        }

        let issuer = Arc::new(StsCredentialsIssuer::new(config).await?);
        let client = Arc::new(S3ObjectClient::new(config, direct_upload.accelerate).await?);
        Ok(Self::with_parts(client, issuer, config, &direct_upload))
    }

    /// Wire the handler from pre-built parts; the seam for alternate
    /// backends and tests.
    pub fn with_parts(
        client: Arc<dyn ObjectClient>,
        issuer: Arc<dyn CredentialsIssuer>,
        config: &S3StorageConfig,
        direct_upload: &crate::config::DirectUploadConfig,
    ) -> Self {
        Self {
            client,
            issuer,
            batches: TransientBatchStore::new(Duration::from_secs(direct_upload.batch_ttl_secs)),
            bucket: config.bucket.clone(),
            bucket_prefix: config.normalized_prefix(),
            region: config.region.clone(),
            role_arn: direct_upload.role_arn.clone(),
            accelerate: direct_upload.accelerate,
            provider_id: direct_upload.provider_id.clone(),
            non_multipart_copy_max_size: NON_MULTIPART_COPY_MAX_SIZE,
        }
    }

    /// Lower the single-copy ceiling. The default is the store's
    /// documented per-copy maximum.
    pub fn with_non_multipart_copy_max_size(mut self, ceiling: u64) -> Self {
        self.non_multipart_copy_max_size = ceiling;
        self
    }

    /// Open a new transient upload session.
    pub fn init_batch(&self) -> String {
        self.batches.begin()
    }

    /// Look up a session and attach freshly issued scoped credentials.
    /// `None` when the session is unknown or expired.
    pub async fn create_batch(&self, batch_id: &str) -> StoreResult<Option<UploadBatch>> {
        if !self.batches.contains(batch_id) {
            return Ok(None);
        }
        let credentials = self.issuer.issue(&self.role_arn, batch_id).await?;
        Ok(Some(UploadBatch {
            id: batch_id.to_string(),
            properties: BatchProperties {
                access_key_id: credentials.access_key_id,
                secret_access_key: credentials.secret_access_key,
                session_token: credentials.session_token,
                expiration_millis: credentials.expiration_millis,
                bucket: self.bucket.clone(),
                base_key: self.bucket_prefix.clone(),
                region: self.region.clone(),
                use_accelerate: self.accelerate,
            },
        }))
    }

    /// Finalized descriptor for a completed file, if any.
    pub fn batch_file(&self, batch_id: &str, file_index: &str) -> Option<BlobDescriptor> {
        self.batches.file(batch_id, file_index)
    }

    /// Validate and adopt an object the client uploaded out-of-band.
    ///
    /// Returns `Ok(false)` when the upload cannot be confirmed yet (absent
    /// object, empty tag, unknown batch); clients may legitimately poll
    /// before their upload finishes. Transport failures propagate.
    pub async fn complete_upload(
        &self,
        batch_id: &str,
        file_index: &str,
        info: &BatchFileInfo,
    ) -> StoreResult<bool> {
        if !self.batches.contains(batch_id) {
            return Ok(false);
        }
        let meta = match self.client.head(&info.key).await {
            Ok(meta) => meta,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        let Some(etag) = meta.etag.clone().filter(|tag| !tag.is_empty()) else {
            return Ok(false);
        };
        let size_bytes = meta.size_bytes;

        // relocate under the tag; the store re-hashes the bytes at rest
        let dst = self.prefixed(&etag);
        let mut final_tag = etag.clone();
        if info.key != dst {
            // the store rejects copying an object onto itself
            let copied_tag = self.copy_object(&info.key, &dst, size_bytes).await?;
            if is_multipart_etag(&etag) && !is_multipart_etag(&copied_tag) {
                // A multipart upload's client-visible tag is not comparable
                // to any content digest; the copy produced a plain tag, so
                // re-key the object under it.
                final_tag = copied_tag;
                let normalized_dst = self.prefixed(&final_tag);
                self.copy_object(&dst, &normalized_dst, size_bytes).await?;
                self.client.delete(&dst).await?;
            }
        }

        let final_key = self.prefixed(&final_tag);
        if info.key != final_key {
            self.client.delete(&info.key).await?;
        }

        let descriptor = BlobDescriptor {
            key: format!("{}:{}", self.provider_id, final_tag),
            digest: final_tag,
            filename: info.filename.clone(),
            mime_type: info.mime_type.clone().or(meta.content_type),
            length: size_bytes,
        };
        info!(
            batch_id = %batch_id,
            file_index = %file_index,
            blob_key = %descriptor.key,
            length = size_bytes,
            "adopted direct upload"
        );
        Ok(self.batches.attach_file(batch_id, file_index, descriptor))
    }

    fn prefixed(&self, tag: &str) -> String {
        format!("{}{}", self.bucket_prefix, tag)
    }

    async fn copy_object(&self, src: &str, dst: &str, size_bytes: u64) -> StoreResult<String> {
        if size_bytes > self.non_multipart_copy_max_size {
            self.client.copy_multipart(src, dst, size_bytes).await
        } else {
            self.client.copy(src, dst).await
        }
    }
}

fn missing_property(name: &str) -> StoreError {
    StoreError::Config {
        reason: format!("missing configuration property: {}", name),
    }
}
