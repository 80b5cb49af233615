//! Content-addressed binary storage on S3.
//!
//! Blobs are identified by the MD5 digest of their content and stored
//! under `<bucket_prefix><digest>` in a single bucket. On top of that
//! layout the crate provides:
//!
//! - Idempotent store and fetch with integrity verification against the
//!   remote ETag ([`storage::S3FileStorage`])
//! - Mark-and-sweep garbage collection of unreferenced blobs
//!   ([`gc::BucketGarbageCollector`])
//! - Direct uploads from clients under short-lived STS credentials, with
//!   server-side adoption of the uploaded objects
//!   ([`batch::DirectUploadHandler`])
//! - Pre-signed download URLs
//!
//! All remote access goes through the [`client::ObjectClient`] trait;
//! [`s3::S3ObjectClient`] is the AWS SDK implementation. The
//! [`manager::S3BinaryManager`] ties a configured bucket to these
//! facades.

pub mod batch;
pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod gc;
pub mod manager;
pub mod s3;
pub mod storage;

#[cfg(test)]
mod testing;

pub use client::ObjectClient;
pub use config::S3StorageConfig;
pub use error::{StoreError, StoreResult};
pub use manager::S3BinaryManager;
