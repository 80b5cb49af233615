//! S3 adapter for the remote object client, using aws-sdk-s3.

use std::{
    io::SeekFrom,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{http::HttpResponse, retry::RetryConfig, timeout::TimeoutConfig, Credentials, Region},
    error::{ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, MetadataDirective},
    Client as S3Client,
};
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

use crate::{
    client::{ListEntry, ListPage, ObjectClient, ObjectMeta},
    config::S3StorageConfig,
    error::{StoreError, StoreResult},
};

/// S3's hard ceiling for a single PUT or a single server-side copy.
/// Objects above it must be uploaded or copied in parts.
pub const NON_MULTIPART_COPY_MAX_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Smallest part size used for multipart uploads.
const MIN_UPLOAD_PART_SIZE: u64 = 64 * 1024 * 1024;

/// S3's limit on parts per multipart upload.
const MAX_UPLOAD_PARTS: u64 = 10_000;

/// Part size for multipart server-side copies.
const COPY_PART_SIZE: u64 = 1024 * 1024 * 1024;

/// Concurrent in-flight part uploads per stored file.
const UPLOAD_CONCURRENCY: usize = 4;

/// S3-backed object client for a single bucket.
pub struct S3ObjectClient {
    client: S3Client,
    bucket: String,
}

/// S3 quotes ETags in responses; compare them unquoted.
fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// Missing-key classification: a `NoSuchKey`/`NotFound` error code, a
/// literal "Not Found" message, or a bare HTTP 404. S3-compatible
/// endpoints may answer 404 without a parseable error body, so the raw
/// status is checked alongside the modeled error.
fn is_missing_key<E>(err: &SdkError<E, HttpResponse>) -> bool
where
    E: ProvideErrorMetadata,
{
    if err
        .as_service_error()
        .map(|e| missing_key_metadata(e.code(), e.message()))
        .unwrap_or(false)
    {
        return true;
    }
    err.raw_response()
        .map(|response| response.status().as_u16() == 404)
        .unwrap_or(false)
}

fn missing_key_metadata(code: Option<&str>, message: Option<&str>) -> bool {
    matches!(code, Some("NoSuchKey") | Some("NotFound") | Some("404"))
        || message == Some("Not Found")
}

/// Part size keeping the part count within the store's limit, never
/// below the minimum.
fn upload_part_size(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(MAX_UPLOAD_PARTS).max(MIN_UPLOAD_PART_SIZE)
}

impl S3ObjectClient {
    /// Build a client from configuration. Region, static credentials (with
    /// default-chain fallback), endpoint override, retry count and timeouts
    /// all come from the config; `accelerate` enables S3 Transfer
    /// Acceleration endpoints for the direct-upload handler.
    pub async fn new(config: &S3StorageConfig, accelerate: bool) -> StoreResult<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(id, secret, None, None, "config"));
        }
        if let Some(max_retries) = config.connection.max_retries {
            loader = loader.retry_config(RetryConfig::standard().with_max_attempts(max_retries + 1));
        }
        let tuning = &config.connection;
        if tuning.connect_timeout_ms.is_some() || tuning.read_timeout_ms.is_some() {
            let mut timeouts = TimeoutConfig::builder();
            if let Some(ms) = tuning.connect_timeout_ms {
                timeouts = timeouts.connect_timeout(Duration::from_millis(ms));
            }
            if let Some(ms) = tuning.read_timeout_ms {
                timeouts = timeouts.read_timeout(Duration::from_millis(ms));
            }
            loader = loader.timeout_config(timeouts.build());
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).accelerate(accelerate);
        if let Some(endpoint) = &config.endpoint {
            // path-style addressing for S3-compatible stores
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        debug!(
            bucket = %config.bucket,
            accelerate = accelerate,
            "created S3 object client"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    fn copy_source(&self, src_key: &str) -> String {
        format!("{}/{}", self.bucket, src_key)
    }

    async fn store_file_multipart(
        &self,
        key: &str,
        file: &Path,
        size_bytes: u64,
    ) -> StoreResult<ObjectMeta> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context(format!("create_multipart_upload {}", key)),
            })?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StoreError::Network {
                source: anyhow!("no upload id returned for {}", key),
            })?
            .to_string();

        match self.upload_parts(key, file, size_bytes, &upload_id).await {
            Ok(meta) => Ok(meta),
            Err(err) => {
                // leave no dangling upload behind a failed store
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        file: &Path,
        size_bytes: u64,
        upload_id: &str,
    ) -> StoreResult<ObjectMeta> {
        let part_size = upload_part_size(size_bytes);
        let part_count = size_bytes.div_ceil(part_size);
        let parts: Vec<CompletedPart> = stream::iter(1..=part_count)
            .map(|part_number| {
                let client = self.client.clone();
                let bucket = self.bucket.clone();
                let key = key.to_string();
                let file = file.to_path_buf();
                let upload_id = upload_id.to_string();
                async move {
                    let offset = (part_number - 1) * part_size;
                    let len = part_size.min(size_bytes - offset) as usize;
                    let mut f = fs::File::open(&file).await?;
                    f.seek(SeekFrom::Start(offset)).await?;
                    let mut buf = vec![0u8; len];
                    f.read_exact(&mut buf).await?;
                    let out = client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number as i32)
                        .body(ByteStream::from(Bytes::from(buf)))
                        .send()
                        .await
                        .map_err(|e| StoreError::Network {
                            source: anyhow::Error::new(e)
                                .context(format!("upload_part {} of {}", part_number, key)),
                        })?;
                    let etag = out.e_tag().ok_or_else(|| StoreError::Network {
                        source: anyhow!("part {} of {} returned no etag", part_number, key),
                    })?;
                    Ok::<_, StoreError>(
                        CompletedPart::builder()
                            .e_tag(etag)
                            .part_number(part_number as i32)
                            .build(),
                    )
                }
            })
            .buffered(UPLOAD_CONCURRENCY)
            .try_collect()
            .await?;

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        let out = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context(format!("complete_multipart_upload {}", key)),
            })?;

        Ok(ObjectMeta {
            etag: out.e_tag().map(normalize_etag),
            size_bytes,
            content_type: None,
        })
    }
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    async fn store_file(&self, key: &str, file: &Path) -> StoreResult<ObjectMeta> {
        let size_bytes = fs::metadata(file).await?.len();
        if size_bytes > NON_MULTIPART_COPY_MAX_SIZE {
            return self.store_file_multipart(key, file, size_bytes).await;
        }
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context(format!("reading {}", file.display())),
            })?;
        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context(format!("put_object {}", key)),
            })?;
        Ok(ObjectMeta {
            etag: out.e_tag().map(normalize_etag),
            size_bytes,
            content_type: None,
        })
    }

    async fn fetch_file(&self, key: &str, dest: &Path) -> StoreResult<ObjectMeta> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if is_missing_key(&err) {
                    StoreError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    StoreError::Network {
                        source: anyhow::Error::new(err).context(format!("get_object {}", key)),
                    }
                }
            })?;

        let etag = out.e_tag().map(normalize_etag);
        let content_type = out.content_type().map(String::from);
        let mut body = out.body;
        let mut dest_file = fs::File::create(dest).await?;
        let mut size_bytes = 0u64;
        while let Some(chunk) = body.try_next().await.map_err(|e| StoreError::Network {
            source: anyhow::Error::new(e).context(format!("reading body of {}", key)),
        })? {
            size_bytes += chunk.len() as u64;
            dest_file.write_all(&chunk).await?;
        }
        dest_file.flush().await?;

        Ok(ObjectMeta {
            etag,
            size_bytes,
            content_type,
        })
    }

    async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if is_missing_key(&err) {
                    StoreError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    StoreError::Network {
                        source: anyhow::Error::new(err).context(format!("head_object {}", key)),
                    }
                }
            })?;
        Ok(ObjectMeta {
            etag: out.e_tag().map(normalize_etag),
            size_bytes: out.content_length().unwrap_or(0) as u64,
            content_type: out.content_type().map(String::from),
        })
    }

    async fn list_page(&self, prefix: &str, token: Option<String>) -> StoreResult<ListPage> {
        let mut req = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix);
        if let Some(token) = token {
            req = req.continuation_token(token);
        }
        let out = req.send().await.map_err(|e| StoreError::Network {
            source: anyhow::Error::new(e).context(format!("list_objects_v2 {}", prefix)),
        })?;
        let entries = out
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| ListEntry {
                    key: key.to_string(),
                    size_bytes: object.size().unwrap_or(0) as u64,
                })
            })
            .collect();
        let next_token = if out.is_truncated().unwrap_or(false) {
            out.next_continuation_token().map(String::from)
        } else {
            None
        };
        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context(format!("delete_object {}", key)),
            })?;
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> StoreResult<String> {
        let out = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(src_key))
            .key(dst_key)
            .metadata_directive(MetadataDirective::Copy)
            .send()
            .await
            .map_err(|err| {
                if is_missing_key(&err) {
                    StoreError::NotFound {
                        key: src_key.to_string(),
                    }
                } else {
                    StoreError::Network {
                        source: anyhow::Error::new(err)
                            .context(format!("copy_object {} -> {}", src_key, dst_key)),
                    }
                }
            })?;
        out.copy_object_result()
            .and_then(|r| r.e_tag())
            .map(normalize_etag)
            .ok_or_else(|| StoreError::Network {
                source: anyhow!("copy of {} returned no etag", src_key),
            })
    }

    async fn copy_multipart(
        &self,
        src_key: &str,
        dst_key: &str,
        size_bytes: u64,
    ) -> StoreResult<String> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e)
                    .context(format!("create_multipart_upload {}", dst_key)),
            })?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StoreError::Network {
                source: anyhow!("no upload id returned for {}", dst_key),
            })?
            .to_string();

        let result = async {
            let mut parts = Vec::new();
            let mut part_number = 1i32;
            let mut offset = 0u64;
            while offset < size_bytes {
                let end = (offset + COPY_PART_SIZE).min(size_bytes) - 1;
                let out = self
                    .client
                    .upload_part_copy()
                    .bucket(&self.bucket)
                    .key(dst_key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .copy_source(self.copy_source(src_key))
                    .copy_source_range(format!("bytes={}-{}", offset, end))
                    .send()
                    .await
                    .map_err(|e| StoreError::Network {
                        source: anyhow::Error::new(e)
                            .context(format!("upload_part_copy {} of {}", part_number, src_key)),
                    })?;
                let etag = out
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .ok_or_else(|| StoreError::Network {
                        source: anyhow!("part copy {} of {} returned no etag", part_number, src_key),
                    })?;
                parts.push(
                    CompletedPart::builder()
                        .e_tag(etag)
                        .part_number(part_number)
                        .build(),
                );
                part_number += 1;
                offset = end + 1;
            }

            let completed = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();
            let out = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(dst_key)
                .upload_id(&upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(|e| StoreError::Network {
                    source: anyhow::Error::new(e)
                        .context(format!("complete_multipart_upload {}", dst_key)),
                })?;
            out.e_tag()
                .map(normalize_etag)
                .ok_or_else(|| StoreError::Network {
                    source: anyhow!("multipart copy of {} returned no etag", src_key),
                })
        }
        .await;

        if result.is_err() {
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(dst_key)
                .upload_id(&upload_id)
                .send()
                .await;
        }
        result
    }

    async fn presign_download(&self, key: &str, expires_in: Duration) -> StoreResult<String> {
        let presigning_config =
            PresigningConfig::expires_in(expires_in).map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context("building presigning config"),
            })?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context(format!("presigning {}", key)),
            })?;
        Ok(presigned.uri().to_string())
    }

    async fn abort_stale_uploads(&self, older_than: Duration) -> StoreResult<usize> {
        let cutoff_secs = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let mut aborted = 0usize;
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        loop {
            let mut req = self.client.list_multipart_uploads().bucket(&self.bucket);
            if let Some(marker) = key_marker.take() {
                req = req.key_marker(marker);
            }
            if let Some(marker) = upload_id_marker.take() {
                req = req.upload_id_marker(marker);
            }
            let out = req.send().await.map_err(|e| StoreError::Network {
                source: anyhow::Error::new(e).context("list_multipart_uploads"),
            })?;

            for upload in out.uploads() {
                let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
                    continue;
                };
                let stale = upload
                    .initiated()
                    .map(|t| t.secs() < cutoff_secs)
                    .unwrap_or(false);
                if !stale {
                    continue;
                }
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                    .map_err(|e| StoreError::Network {
                        source: anyhow::Error::new(e)
                            .context(format!("abort_multipart_upload {}", key)),
                    })?;
                debug!(key = %key, upload_id = %upload_id, "aborted stale multipart upload");
                aborted += 1;
            }

            if !out.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = out.next_key_marker().map(String::from);
            upload_id_marker = out.next_upload_id_marker().map(String::from);
        }
        Ok(aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_metadata() {
        assert!(missing_key_metadata(Some("NoSuchKey"), None));
        assert!(missing_key_metadata(Some("NotFound"), None));
        assert!(missing_key_metadata(Some("404"), None));
        // bare message with no parseable code, as some S3-compatible
        // endpoints return
        assert!(missing_key_metadata(None, Some("Not Found")));
        assert!(!missing_key_metadata(None, None));
        assert!(!missing_key_metadata(Some("AccessDenied"), Some("Access Denied")));
        assert!(!missing_key_metadata(Some("SlowDown"), None));
    }

    #[test]
    fn test_upload_part_size() {
        // small files stay at the minimum part size
        assert_eq!(upload_part_size(1), MIN_UPLOAD_PART_SIZE);
        assert_eq!(
            upload_part_size(MAX_UPLOAD_PARTS * MIN_UPLOAD_PART_SIZE),
            MIN_UPLOAD_PART_SIZE
        );
        // part size grows so the part count never exceeds the limit,
        // up to the 5 TiB object ceiling
        for size in [
            MAX_UPLOAD_PARTS * MIN_UPLOAD_PART_SIZE + 1,
            1024 * 1024 * 1024 * 1024,
            5 * 1024 * 1024 * 1024 * 1024,
        ] {
            let part_size = upload_part_size(size);
            assert!(part_size >= MIN_UPLOAD_PART_SIZE);
            assert!(size.div_ceil(part_size) <= MAX_UPLOAD_PARTS);
        }
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(
            normalize_etag("\"d41d8cd98f00b204e9800998ecf8427e\""),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            normalize_etag("d41d8cd98f00b204e9800998ecf8427e"),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }
}
