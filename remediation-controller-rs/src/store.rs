//! Versioned collection of execution requests.
//!
//! No cache in this crate is authoritative: lock decisions always re-read siblings through
//! [`RequestStore::list`]. Every write bumps `resource_version`, and status writes are
//! conditional on the version the writer last read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{ExecutionRequest, ObjectKey, RequestStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("request {0} not found")]
    NotFound(ObjectKey),

    #[error("request {0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("conflicting write to {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("request store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, StoreError::AlreadyExists(_))
    }
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ExecutionRequest>, StoreError>;

    /// All requests in `namespace`, or in every namespace when `None`.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ExecutionRequest>, StoreError>;

    async fn create(&self, request: ExecutionRequest) -> Result<ExecutionRequest, StoreError>;

    /// Replace the status if the stored version still equals `expected_version`.
    async fn update_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: RequestStatus,
    ) -> Result<ExecutionRequest, StoreError>;

    async fn add_cleanup_marker(&self, key: &ObjectKey, marker: &str) -> Result<ExecutionRequest, StoreError>;

    /// Returns `None` once the request has been physically removed.
    async fn remove_cleanup_marker(
        &self,
        key: &ObjectKey,
        marker: &str,
    ) -> Result<Option<ExecutionRequest>, StoreError>;

    /// Mark a request for deletion. Requests without cleanup markers are removed immediately.
    async fn request_deletion(
        &self,
        key: &ObjectKey,
        at: DateTime<Utc>,
    ) -> Result<Option<ExecutionRequest>, StoreError>;

    /// Cascade deletion from a parent: mark every request it owns. Returns how many were marked.
    async fn delete_owned_by(&self, owner_uid: &str, at: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// In-process [`RequestStore`].
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    requests: RwLock<HashMap<ObjectKey, ExecutionRequest>>,
    unavailable: AtomicBool,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

fn bump(request: &mut ExecutionRequest) {
    request.metadata.resource_version += 1;
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ExecutionRequest>, StoreError> {
        self.check_available()?;
        Ok(self.requests.read().await.get(key).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ExecutionRequest>, StoreError> {
        self.check_available()?;
        let requests = self.requests.read().await;
        let mut out: Vec<ExecutionRequest> = requests
            .values()
            .filter(|r| namespace.is_none() || r.metadata.namespace.as_deref() == namespace)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn create(&self, mut request: ExecutionRequest) -> Result<ExecutionRequest, StoreError> {
        self.check_available()?;
        let key = request.key();
        let mut requests = self.requests.write().await;
        if requests.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        request.metadata.resource_version = 1;
        requests.insert(key, request.clone());
        Ok(request)
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: RequestStatus,
    ) -> Result<ExecutionRequest, StoreError> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if request.metadata.resource_version != expected_version {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected_version,
                actual: request.metadata.resource_version,
            });
        }

        request.status = Some(status);
        bump(request);
        Ok(request.clone())
    }

    async fn add_cleanup_marker(&self, key: &ObjectKey, marker: &str) -> Result<ExecutionRequest, StoreError> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if !request.metadata.cleanup_markers.iter().any(|m| m == marker) {
            request.metadata.cleanup_markers.push(marker.to_string());
            bump(request);
        }
        Ok(request.clone())
    }

    async fn remove_cleanup_marker(
        &self,
        key: &ObjectKey,
        marker: &str,
    ) -> Result<Option<ExecutionRequest>, StoreError> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let before = request.metadata.cleanup_markers.len();
        request.metadata.cleanup_markers.retain(|m| m != marker);
        if request.metadata.cleanup_markers.len() != before {
            bump(request);
        }

        if request.is_being_deleted() && request.metadata.cleanup_markers.is_empty() {
            requests.remove(key);
            return Ok(None);
        }
        Ok(Some(request.clone()))
    }

    async fn request_deletion(
        &self,
        key: &ObjectKey,
        at: DateTime<Utc>,
    ) -> Result<Option<ExecutionRequest>, StoreError> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if request.metadata.cleanup_markers.is_empty() {
            requests.remove(key);
            return Ok(None);
        }
        if request.metadata.deletion_requested_at.is_none() {
            request.metadata.deletion_requested_at = Some(at);
            bump(request);
        }
        Ok(Some(request.clone()))
    }

    async fn delete_owned_by(&self, owner_uid: &str, at: DateTime<Utc>) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut requests = self.requests.write().await;

        let owned: Vec<ObjectKey> = requests
            .values()
            .filter(|r| r.metadata.owner.as_ref().map(|o| o.uid.as_str()) == Some(owner_uid))
            .map(ExecutionRequest::key)
            .collect();

        for key in &owned {
            let remove_now = match requests.get_mut(key) {
                Some(request) if request.metadata.cleanup_markers.is_empty() => true,
                Some(request) => {
                    if request.metadata.deletion_requested_at.is_none() {
                        request.metadata.deletion_requested_at = Some(at);
                        bump(request);
                    }
                    false
                }
                None => false,
            };
            if remove_now {
                requests.remove(key);
            }
        }

        Ok(owned.len())
    }
}
