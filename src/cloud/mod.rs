//! Cloud document store — one entitlement document per authenticated user.
//!
//! The contract mirrors a document database: get (existence + fields),
//! create, and set-with-merge (partial field update). Anonymous identities
//! never touch this store. Every write carries the revision the writer last
//! saw; the store rejects stale writes, which is this daemon's one deliberate
//! hardening over a plain last-write-wins merge.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::CloudConfig;
use crate::missions::MissionFlags;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The document exists but does not decode as an entitlement snapshot.
    #[error("cloud document is malformed: {0}")]
    Decode(#[source] serde_json::Error),
    /// The write carried a revision older than the document's current one.
    #[error("stale write rejected (expected rev {expected}, document rev {actual})")]
    StaleWrite { expected: u64, actual: u64 },
    #[error("cloud store error: {0}")]
    Other(String),
}

impl CloudError {
    /// Stale writes are resolved by re-reading, not by waiting and repeating.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CloudError::StaleWrite { .. } | CloudError::Decode(_))
    }
}

// ─── Document model ───────────────────────────────────────────────────────────

/// Server-held mirror of one user's entitlement state.
///
/// Fields default individually so a partially-written document still decodes;
/// a document whose fields carry the wrong types fails decoding entirely and
/// surfaces as [`CloudError::Decode`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudSnapshot {
    pub balance: i64,
    pub favorites: Vec<String>,
    /// Mission completion/claim flags keyed by mission name.
    pub missions: BTreeMap<String, MissionFlags>,
    /// RFC 3339 timestamp of the last successful sync.
    pub last_sync: Option<String>,
    /// Monotonic document revision. Bumped by the store on every merge.
    pub rev: u64,
}

/// Partial update for [`CloudStore::set_merge`]. Unset fields are left
/// untouched on the document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favorites: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missions: Option<BTreeMap<String, MissionFlags>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    /// Revision the writer last observed. The store rejects the patch when
    /// the document has moved past it.
    pub expected_rev: u64,
}

// ─── Contract ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Fetch the user's document. `Ok(None)` means it has never been created.
    async fn get(&self, user_id: &str) -> Result<Option<CloudSnapshot>, CloudError>;

    /// Create the user's document. Overwrites an existing one.
    async fn create(&self, user_id: &str, snapshot: &CloudSnapshot) -> Result<(), CloudError>;

    /// Merge `patch` into the user's document and return the new revision.
    async fn set_merge(&self, user_id: &str, patch: &SnapshotPatch) -> Result<u64, CloudError>;
}

// ─── HTTP implementation ──────────────────────────────────────────────────────

/// Entitlement API client.
///
/// Document address: `{api_base_url}/v1/users/{user_id}/entitlements`.
/// GET returns the document (404 = never created), PUT creates/overwrites,
/// PATCH merges and answers `{"rev": n}` — or 412 when `expectedRev` is
/// behind the document.
pub struct HttpCloudStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct MergeResponse {
    rev: u64,
}

impl HttpCloudStore {
    pub fn new(config: &CloudConfig) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn document_url(&self, user_id: &str) -> String {
        format!("{}/v1/users/{}/entitlements", self.base_url, user_id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl CloudStore for HttpCloudStore {
    async fn get(&self, user_id: &str) -> Result<Option<CloudSnapshot>, CloudError> {
        let resp = self
            .authorize(self.client.get(self.document_url(user_id)))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.error_for_status()?.text().await?;
        let snapshot = serde_json::from_str(&body).map_err(CloudError::Decode)?;
        Ok(Some(snapshot))
    }

    async fn create(&self, user_id: &str, snapshot: &CloudSnapshot) -> Result<(), CloudError> {
        self.authorize(self.client.put(self.document_url(user_id)))
            .json(snapshot)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn set_merge(&self, user_id: &str, patch: &SnapshotPatch) -> Result<u64, CloudError> {
        let resp = self
            .authorize(self.client.patch(self.document_url(user_id)))
            .json(patch)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            let actual = resp
                .json::<MergeResponse>()
                .await
                .map(|m| m.rev)
                .unwrap_or(0);
            return Err(CloudError::StaleWrite {
                expected: patch.expected_rev,
                actual,
            });
        }
        let body: MergeResponse = resp.error_for_status()?.json().await?;
        Ok(body.rev)
    }
}

// ─── In-memory implementation ─────────────────────────────────────────────────

/// In-memory document store with the same revision semantics as the HTTP
/// store. Used by tests and by `serve --offline`.
///
/// Documents are held as raw JSON so tests can plant malformed ones and
/// exercise the decode path.
#[derive(Default)]
pub struct MemoryCloudStore {
    docs: Mutex<HashMap<String, Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryCloudStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant a raw JSON document, bypassing the typed model.
    pub async fn insert_raw(&self, user_id: &str, doc: Value) {
        self.docs.lock().await.insert(user_id.to_string(), doc);
    }

    /// Make every subsequent read fail until cleared.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Decode the stored document, if any. Test helper.
    pub async fn snapshot(&self, user_id: &str) -> Option<CloudSnapshot> {
        let docs = self.docs.lock().await;
        docs.get(user_id)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[async_trait]
impl CloudStore for MemoryCloudStore {
    async fn get(&self, user_id: &str) -> Result<Option<CloudSnapshot>, CloudError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CloudError::Other("injected read failure".to_string()));
        }
        let docs = self.docs.lock().await;
        match docs.get(user_id) {
            None => Ok(None),
            Some(v) => {
                let snapshot =
                    serde_json::from_value(v.clone()).map_err(CloudError::Decode)?;
                Ok(Some(snapshot))
            }
        }
    }

    async fn create(&self, user_id: &str, snapshot: &CloudSnapshot) -> Result<(), CloudError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CloudError::Other("injected write failure".to_string()));
        }
        let value = serde_json::to_value(snapshot)
            .map_err(|e| CloudError::Other(e.to_string()))?;
        self.docs.lock().await.insert(user_id.to_string(), value);
        Ok(())
    }

    async fn set_merge(&self, user_id: &str, patch: &SnapshotPatch) -> Result<u64, CloudError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CloudError::Other("injected write failure".to_string()));
        }
        let mut docs = self.docs.lock().await;
        let current = docs
            .get(user_id)
            .ok_or_else(|| CloudError::Other(format!("no document for user {user_id}")))?;
        let mut snapshot: CloudSnapshot =
            serde_json::from_value(current.clone()).map_err(CloudError::Decode)?;

        if snapshot.rev != patch.expected_rev {
            return Err(CloudError::StaleWrite {
                expected: patch.expected_rev,
                actual: snapshot.rev,
            });
        }

        if let Some(balance) = patch.balance {
            snapshot.balance = balance;
        }
        if let Some(favorites) = &patch.favorites {
            snapshot.favorites = favorites.clone();
        }
        if let Some(missions) = &patch.missions {
            snapshot.missions = missions.clone();
        }
        if let Some(last_sync) = &patch.last_sync {
            snapshot.last_sync = Some(last_sync.clone());
        }
        snapshot.rev += 1;

        let rev = snapshot.rev;
        let value = serde_json::to_value(&snapshot)
            .map_err(|e| CloudError::Other(e.to_string()))?;
        docs.insert(user_id.to_string(), value);
        Ok(rev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_missing_document_is_none() {
        let store = MemoryCloudStore::new();
        assert!(store.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_then_merge_bumps_rev() {
        let store = MemoryCloudStore::new();
        let snapshot = CloudSnapshot {
            balance: 3,
            rev: 1,
            ..Default::default()
        };
        store.create("u1", &snapshot).await.unwrap();

        let rev = store
            .set_merge(
                "u1",
                &SnapshotPatch {
                    balance: Some(2),
                    expected_rev: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rev, 2);

        let doc = store.get("u1").await.unwrap().unwrap();
        assert_eq!(doc.balance, 2);
        assert_eq!(doc.rev, 2);
        // Untouched fields survive the merge.
        assert!(doc.favorites.is_empty());
    }

    #[tokio::test]
    async fn stale_write_is_rejected() {
        let store = MemoryCloudStore::new();
        store
            .create("u1", &CloudSnapshot { balance: 10, rev: 5, ..Default::default() })
            .await
            .unwrap();

        let err = store
            .set_merge(
                "u1",
                &SnapshotPatch {
                    balance: Some(1),
                    expected_rev: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        match err {
            CloudError::StaleWrite { expected, actual } => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 5);
            }
            other => panic!("expected StaleWrite, got {other:?}"),
        }
        // Document unchanged.
        assert_eq!(store.get("u1").await.unwrap().unwrap().balance, 10);
    }

    #[tokio::test]
    async fn partially_written_document_decodes_with_defaults() {
        let store = MemoryCloudStore::new();
        store.insert_raw("u1", json!({ "balance": 7 })).await;

        let doc = store.get("u1").await.unwrap().unwrap();
        assert_eq!(doc.balance, 7);
        assert_eq!(doc.rev, 0);
        assert!(doc.missions.is_empty());
    }

    #[tokio::test]
    async fn wrong_typed_document_fails_decoding() {
        let store = MemoryCloudStore::new();
        store
            .insert_raw("u1", json!({ "balance": "not-a-number" }))
            .await;

        let err = store.get("u1").await.unwrap_err();
        assert!(matches!(err, CloudError::Decode(_)));
    }

    #[tokio::test]
    async fn injected_failures_cover_both_directions() {
        let store = MemoryCloudStore::new();
        store
            .create("u1", &CloudSnapshot { rev: 1, ..Default::default() })
            .await
            .unwrap();

        store.set_fail_reads(true);
        assert!(store.get("u1").await.is_err());
        store.set_fail_reads(false);

        store.set_fail_writes(true);
        assert!(store
            .set_merge(
                "u1",
                &SnapshotPatch { balance: Some(1), expected_rev: 1, ..Default::default() }
            )
            .await
            .is_err());
    }
}
