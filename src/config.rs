//! Binary store configuration.

use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Configuration for the S3-backed binary store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StorageConfig {
    /// Target bucket. Mandatory.
    #[serde(default)]
    pub bucket: String,

    /// Key prefix inside the bucket, e.g. `docs/`.
    #[serde(default)]
    pub bucket_prefix: String,

    /// AWS region.
    #[serde(default)]
    pub region: Option<String>,

    /// Static credential pair. When absent the SDK default chain
    /// (environment, instance role) is used.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Custom endpoint, for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Transport tuning.
    #[serde(default)]
    pub connection: ConnectionTuning,

    /// Client-side encryption keystore reference. Loading the keystore is
    /// the caller's concern; configuring it here flags uploads as
    /// encrypted, which disables ETag verification.
    #[serde(default)]
    pub crypt: Option<CryptoConfig>,

    /// Serve reads through pre-signed S3 URLs instead of the server.
    #[serde(default)]
    pub direct_download: bool,

    /// Lifetime of pre-signed download URLs, in seconds.
    #[serde(default = "default_direct_download_expire_secs")]
    pub direct_download_expire_secs: u64,

    /// Direct-upload batch handler settings. Absent disables the handler.
    #[serde(default)]
    pub direct_upload: Option<DirectUploadConfig>,
}

/// Transport tuning knobs, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionTuning {
    /// Maximum retries for a failed request.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Connect timeout in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Read timeout in milliseconds.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
}

/// Client-side encryption keystore reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    pub keystore_file: String,

    /// May be blank, but must be present.
    #[serde(default)]
    pub keystore_password: Option<String>,

    #[serde(default)]
    pub key_alias: Option<String>,

    /// May be blank, but must be present.
    #[serde(default)]
    pub key_password: Option<String>,
}

/// Direct-upload batch handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectUploadConfig {
    /// Role assumed to mint batch-scoped temporary credentials. Mandatory.
    #[serde(default)]
    pub role_arn: String,

    /// Enable S3 transfer acceleration for client uploads.
    #[serde(default)]
    pub accelerate: bool,

    /// Provider id prefixed to finalized blob keys.
    #[serde(default = "default_provider_id")]
    pub provider_id: String,

    /// Lifetime of a transient upload batch, in seconds.
    #[serde(default = "default_batch_ttl_secs")]
    pub batch_ttl_secs: u64,
}

fn default_direct_download_expire_secs() -> u64 {
    60 * 60
}

fn default_provider_id() -> String {
    "s3".to_string()
}

fn default_batch_ttl_secs() -> u64 {
    60 * 60 * 24
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            bucket_prefix: String::new(),
            region: None,
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
            connection: ConnectionTuning::default(),
            crypt: None,
            direct_download: false,
            direct_download_expire_secs: default_direct_download_expire_secs(),
            direct_upload: None,
        }
    }
}

impl S3StorageConfig {
    pub fn from_path(path: &str) -> StoreResult<S3StorageConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: S3StorageConfig = Figment::new()
            .merge(Yaml::string(&config_str))
            .extract()
            .map_err(|e| StoreError::Config {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.bucket.is_empty() {
            return Err(StoreError::Config {
                reason: "missing bucket".to_string(),
            });
        }
        if let Some(crypt) = &self.crypt {
            let mut missing = Vec::new();
            if crypt.keystore_password.is_none() {
                missing.push("keystore_password");
            }
            if crypt.key_alias.as_deref().unwrap_or("").is_empty() {
                missing.push("key_alias");
            }
            if crypt.key_password.is_none() {
                missing.push("key_password");
            }
            if !missing.is_empty() {
                return Err(StoreError::Config {
                    reason: format!("crypto configuration incomplete: {}", missing.join(", ")),
                });
            }
        }
        Ok(())
    }

    /// Bucket prefix with a trailing `/` guaranteed when non-empty.
    pub fn normalized_prefix(&self) -> String {
        if self.bucket_prefix.is_empty() || self.bucket_prefix.ends_with('/') {
            self.bucket_prefix.clone()
        } else {
            warn!(
                bucket_prefix = %self.bucket_prefix,
                "bucket prefix should end with '/', added automatically"
            );
            format!("{}/", self.bucket_prefix)
        }
    }

    /// Whether uploads are client-side encrypted, in which case the
    /// remote ETag reflects ciphertext and cannot be verified.
    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> S3StorageConfig {
        S3StorageConfig {
            bucket: "docs-bucket".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_bucket() {
        let config = S3StorageConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
    }

    #[test]
    fn test_minimal_valid() {
        minimal().validate().unwrap();
    }

    #[test]
    fn test_crypt_incomplete() {
        let mut config = minimal();
        config.crypt = Some(CryptoConfig {
            keystore_file: "/etc/keys.jks".to_string(),
            keystore_password: Some("".to_string()),
            key_alias: None,
            key_password: None,
        });
        let err = config.validate().unwrap_err();
        match err {
            StoreError::Config { reason } => {
                assert!(reason.contains("key_alias"));
                assert!(reason.contains("key_password"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_crypt_complete_passwords_may_be_blank() {
        let mut config = minimal();
        config.crypt = Some(CryptoConfig {
            keystore_file: "/etc/keys.jks".to_string(),
            keystore_password: Some("".to_string()),
            key_alias: Some("docs".to_string()),
            key_password: Some("".to_string()),
        });
        config.validate().unwrap();
        assert!(config.is_encrypted());
    }

    #[test]
    fn test_prefix_normalization() {
        let mut config = minimal();
        assert_eq!(config.normalized_prefix(), "");
        config.bucket_prefix = "docs".to_string();
        assert_eq!(config.normalized_prefix(), "docs/");
        config.bucket_prefix = "docs/".to_string();
        assert_eq!(config.normalized_prefix(), "docs/");
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = r#"
bucket: docs-bucket
bucket_prefix: docs/
region: us-east-1
direct_upload:
  role_arn: arn:aws:iam::123456789012:role/direct-upload
  accelerate: true
"#;
        let config: S3StorageConfig = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.bucket, "docs-bucket");
        let direct_upload = config.direct_upload.unwrap();
        assert!(direct_upload.accelerate);
        assert_eq!(direct_upload.provider_id, "s3");
        assert_eq!(direct_upload.batch_ttl_secs, 60 * 60 * 24);
    }
}
