//! Remote object client interface.
//!
//! A thin capability set over the object store, shared by file storage,
//! the garbage collector and the direct-upload handler. The concrete S3
//! adapter lives in [`crate::s3`]; tests run against an in-memory fake.

use std::{path::Path, time::Duration};

use async_trait::async_trait;

use crate::error::StoreResult;

/// Metadata about a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Integrity tag computed by the store. Equals the MD5 digest for
    /// single-part objects; composite for multipart ones.
    pub etag: Option<String>,

    /// Content length in bytes.
    pub size_bytes: u64,

    /// MIME type, when the store recorded one.
    pub content_type: Option<String>,
}

/// One entry of a bucket listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub key: String,
    pub size_bytes: u64,
}

/// A single page of a bucket listing. The listing is lazy and finite:
/// callers thread `next_token` back in until it comes back `None`.
/// Restartable from scratch only, never resumable mid-page.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ListEntry>,
    pub next_token: Option<String>,
}

/// Synchronous-looking facade over the object store. Every operation is a
/// single blocking call from the caller's perspective; bulk uploads may be
/// split into concurrent part uploads internally and joined before return.
///
/// Absence is signaled as `StoreError::NotFound`; any other transport
/// failure maps to `StoreError::Network`.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Upload a local file under `key`. Returns the stored object's
    /// metadata, including the integrity tag the store computed.
    async fn store_file(&self, key: &str, file: &Path) -> StoreResult<ObjectMeta>;

    /// Download the object at `key` directly into `dest`, returning its
    /// metadata for verification.
    async fn fetch_file(&self, key: &str, dest: &Path) -> StoreResult<ObjectMeta>;

    /// Read object metadata without downloading content.
    async fn head(&self, key: &str) -> StoreResult<ObjectMeta>;

    /// Fetch one page of the bucket listing under `prefix`. Pass the
    /// previous page's `next_token` to continue; `None` starts over.
    async fn list_page(&self, prefix: &str, token: Option<String>) -> StoreResult<ListPage>;

    /// Delete the object at `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Server-side copy within the bucket. Subject to the store's per-copy
    /// size ceiling. Returns the destination's integrity tag.
    async fn copy(&self, src_key: &str, dst_key: &str) -> StoreResult<String>;

    /// Server-side copy for objects above the single-copy ceiling,
    /// assembled from part copies. Returns the most precise integrity tag
    /// the store reports for the reassembled destination.
    async fn copy_multipart(
        &self,
        src_key: &str,
        dst_key: &str,
        size_bytes: u64,
    ) -> StoreResult<String>;

    /// Generate a time-limited pre-signed download URL for `key`.
    async fn presign_download(&self, key: &str, expires_in: Duration) -> StoreResult<String>;

    /// Abort multipart uploads initiated more than `older_than` ago.
    /// Advisory maintenance; returns the number of uploads aborted.
    async fn abort_stale_uploads(&self, older_than: Duration) -> StoreResult<usize>;
}
