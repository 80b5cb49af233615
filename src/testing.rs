//! In-memory test doubles for the object client and credentials issuer.

use std::{collections::BTreeMap, path::Path, sync::Mutex, time::Duration};

use async_trait::async_trait;

use crate::{
    batch::{CredentialsIssuer, TemporaryCredentials},
    client::{ListEntry, ListPage, ObjectClient, ObjectMeta},
    digest::content_digest,
    error::{StoreError, StoreResult},
};

struct StoredObject {
    data: Vec<u8>,
    etag: String,
    content_type: Option<String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    etag_override: Option<String>,
    uploads: usize,
    copies: usize,
    multipart_copies: usize,
}

/// Bucket simulation over a sorted map. Put and copy operations report a
/// plain content digest as the integrity tag, matching a store that
/// re-hashes bytes at rest; `corrupt_etags` overrides every reported tag
/// to simulate a store that does not.
pub struct InMemoryObjectClient {
    state: Mutex<State>,
    page_size: Option<usize>,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: None,
        }
    }

    /// Limit list pages to `page_size` entries to exercise pagination.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: Some(page_size),
        }
    }

    /// Seed an object directly, bypassing upload accounting.
    pub fn insert_raw(&self, key: &str, data: Vec<u8>, etag: &str, content_type: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag: etag.to_string(),
                content_type: content_type.map(str::to_string),
            },
        );
    }

    /// Force every subsequently reported tag to `etag`.
    pub fn corrupt_etags(&self, etag: &str) {
        self.state.lock().unwrap().etag_override = Some(etag.to_string());
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().unwrap().uploads
    }

    pub fn copy_count(&self) -> usize {
        self.state.lock().unwrap().copies
    }

    pub fn multipart_copy_count(&self) -> usize {
        self.state.lock().unwrap().multipart_copies
    }

    fn meta_of(state: &State, object: &StoredObject) -> ObjectMeta {
        let etag = state
            .etag_override
            .clone()
            .unwrap_or_else(|| object.etag.clone());
        ObjectMeta {
            etag: Some(etag),
            size_bytes: object.data.len() as u64,
            content_type: object.content_type.clone(),
        }
    }

    fn not_found(key: &str) -> StoreError {
        StoreError::NotFound {
            key: key.to_string(),
        }
    }

    fn copy_impl(&self, src_key: &str, dst_key: &str) -> StoreResult<String> {
        let mut state = self.state.lock().unwrap();
        let source = state
            .objects
            .get(src_key)
            .ok_or_else(|| Self::not_found(src_key))?;
        let copied = StoredObject {
            data: source.data.clone(),
            etag: content_digest(&source.data),
            content_type: source.content_type.clone(),
        };
        let etag = copied.etag.clone();
        state.objects.insert(dst_key.to_string(), copied);
        Ok(etag)
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn store_file(&self, key: &str, file: &Path) -> StoreResult<ObjectMeta> {
        let data = std::fs::read(file)?;
        let mut state = self.state.lock().unwrap();
        state.uploads += 1;
        let object = StoredObject {
            data: data.clone(),
            etag: content_digest(&data),
            content_type: None,
        };
        let meta = Self::meta_of(&state, &object);
        state.objects.insert(key.to_string(), object);
        Ok(meta)
    }

    async fn fetch_file(&self, key: &str, dest: &Path) -> StoreResult<ObjectMeta> {
        let state = self.state.lock().unwrap();
        let object = state.objects.get(key).ok_or_else(|| Self::not_found(key))?;
        std::fs::write(dest, &object.data)?;
        Ok(Self::meta_of(&state, object))
    }

    async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        let state = self.state.lock().unwrap();
        let object = state.objects.get(key).ok_or_else(|| Self::not_found(key))?;
        Ok(Self::meta_of(&state, object))
    }

    async fn list_page(&self, prefix: &str, token: Option<String>) -> StoreResult<ListPage> {
        let state = self.state.lock().unwrap();
        let entries: Vec<ListEntry> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .skip_while(|(key, _)| match &token {
                Some(marker) => key.as_str() <= marker.as_str(),
                None => false,
            })
            .take(self.page_size.unwrap_or(usize::MAX))
            .map(|(key, object)| ListEntry {
                key: key.clone(),
                size_bytes: object.data.len() as u64,
            })
            .collect();
        let next_token = match self.page_size {
            Some(page_size) if entries.len() == page_size => {
                entries.last().map(|entry| entry.key.clone())
            }
            _ => None,
        };
        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.state.lock().unwrap().objects.remove(key);
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> StoreResult<String> {
        let result = self.copy_impl(src_key, dst_key);
        if result.is_ok() {
            self.state.lock().unwrap().copies += 1;
        }
        result
    }

    async fn copy_multipart(
        &self,
        src_key: &str,
        dst_key: &str,
        _size_bytes: u64,
    ) -> StoreResult<String> {
        let result = self.copy_impl(src_key, dst_key);
        if result.is_ok() {
            self.state.lock().unwrap().multipart_copies += 1;
        }
        result
    }

    async fn presign_download(&self, key: &str, expires_in: Duration) -> StoreResult<String> {
        Ok(format!(
            "https://bucket.s3.test/{}?X-Amz-Expires={}",
            key,
            expires_in.as_secs()
        ))
    }

    async fn abort_stale_uploads(&self, _older_than: Duration) -> StoreResult<usize> {
        Ok(0)
    }
}

/// Deterministic issuer recording every assume-role request.
pub struct FakeCredentialsIssuer {
    issued: Mutex<Vec<(String, String)>>,
}

impl FakeCredentialsIssuer {
    pub fn new() -> Self {
        Self {
            issued: Mutex::new(Vec::new()),
        }
    }

    /// `(role_arn, session_name)` pairs in issue order.
    pub fn issued(&self) -> Vec<(String, String)> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialsIssuer for FakeCredentialsIssuer {
    async fn issue(&self, role_arn: &str, session_name: &str) -> StoreResult<TemporaryCredentials> {
        self.issued
            .lock()
            .unwrap()
            .push((role_arn.to_string(), session_name.to_string()));
        Ok(TemporaryCredentials {
            access_key_id: "temp-id".to_string(),
            secret_access_key: "temp-secret".to_string(),
            session_token: "temp-token".to_string(),
            expiration_millis: 1_900_000_000_000,
        })
    }
}
