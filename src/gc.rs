//! Mark-and-sweep garbage collection over the bucket.
//!
//! The caller marks every digest still referenced by the repository, then
//! sweeps: the full bucket listing is walked page by page, digest-shaped
//! keys are partitioned into retained and reclaimable, and reclaimable
//! objects are deleted one key at a time. Keys that are not digest-shaped
//! are never touched. A partially completed sweep is safe to re-run from
//! scratch: retained objects are never placed on the deletion list, and
//! sweep decisions are purely a function of the marked set and the
//! current listing.

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, info};

use crate::{client::ObjectClient, digest::digest_from_key, error::StoreResult};

/// Collection phases. One pass per collector instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Idle,
    Marking,
    Sweeping,
    Done,
}

/// Retained/reclaimed accounting for one collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStatus {
    pub retained_count: u64,
    pub retained_bytes: u64,
    pub reclaimed_count: u64,
    pub reclaimed_bytes: u64,
}

/// Result of a sweep: the reclaimed digests plus the run's accounting.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub reclaimed: Vec<String>,
    pub status: GcStatus,
}

/// Garbage collector over one bucket prefix.
pub struct BucketGarbageCollector {
    client: Arc<dyn ObjectClient>,
    bucket_prefix: String,
    id: String,
    marked: HashSet<String>,
    state: GcState,
}

impl BucketGarbageCollector {
    pub fn new(client: Arc<dyn ObjectClient>, bucket: &str, bucket_prefix: String) -> Self {
        Self {
            client,
            bucket_prefix,
            id: format!("s3:{}", bucket),
            marked: HashSet::new(),
            state: GcState::Idle,
        }
    }

    /// Identifier of this collector, `s3:<bucket>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> GcState {
        self.state
    }

    /// Begin a run, discarding any previous marked set.
    pub fn start(&mut self) {
        self.marked.clear();
        self.state = GcState::Marking;
    }

    /// Record a digest as currently referenced. One call per live blob,
    /// all before `sweep`.
    pub fn mark(&mut self, digest: &str) {
        debug_assert!(self.state == GcState::Marking);
        self.marked.insert(digest.to_string());
    }

    /// Enumerate the bucket, delete every digest-shaped object that was
    /// not marked, and report the outcome. Consumes the marked set.
    pub async fn sweep(&mut self) -> StoreResult<SweepOutcome> {
        self.state = GcState::Sweeping;
        let mut status = GcStatus::default();
        let mut reclaimed = Vec::new();

        let mut token = None;
        loop {
            let page = self
                .client
                .list_page(&self.bucket_prefix, token.take())
                .await?;
            for entry in &page.entries {
                // never delete objects that cannot be content hashes
                let Some(digest) = digest_from_key(&entry.key, &self.bucket_prefix) else {
                    debug!(key = %entry.key, "skipping non-digest key");
                    continue;
                };
                if self.marked.remove(digest) {
                    status.retained_count += 1;
                    status.retained_bytes += entry.size_bytes;
                } else {
                    status.reclaimed_count += 1;
                    status.reclaimed_bytes += entry.size_bytes;
                    reclaimed.push(digest.to_string());
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        for digest in &reclaimed {
            self.client
                .delete(&format!("{}{}", self.bucket_prefix, digest))
                .await?;
        }

        info!(
            id = %self.id,
            retained_count = status.retained_count,
            retained_bytes = status.retained_bytes,
            reclaimed_count = status.reclaimed_count,
            reclaimed_bytes = status.reclaimed_bytes,
            "garbage collection complete"
        );
        self.marked = HashSet::new();
        self.state = GcState::Done;
        Ok(SweepOutcome { reclaimed, status })
    }
}
