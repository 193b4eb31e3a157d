//! Typed object store used by every reconciler.
//!
//! Reconcilers never talk to [`kube::Api`] directly: they go through
//! [`ObjectStore`], which keeps the not-found / already-exists / conflict
//! distinction explicit and lets the same logic run against an in-memory store
//! in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::{core::ErrorResponse, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

mod kube_store;
pub use kube_store::KubeStore;

#[cfg(test)]
pub(crate) mod memory;

/// Attempts made by [`update_with_retry`] before a conflict is surfaced.
pub const MAX_UPDATE_ATTEMPTS: usize = 5;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} `{name}` was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("Request error: {0}")]
    Request(#[source] kube::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Maps an API server response onto the store taxonomy.
    pub fn classify(kind: &str, name: &str, err: kube::Error) -> Self {
        let (kind, name) = (kind.to_string(), name.to_string());
        match err {
            kube::Error::Api(ErrorResponse { code: 404, .. }) => Self::NotFound { kind, name },
            kube::Error::Api(ErrorResponse { code: 409, ref reason, .. })
                if reason == "AlreadyExists" =>
            {
                Self::AlreadyExists { kind, name }
            }
            kube::Error::Api(ErrorResponse { code: 409, .. }) => Self::Conflict { kind, name },
            err => Self::Request(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Bounds shared by every resource kept in an [`ObjectStore`].
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Get/list/create/update access to one resource kind.
///
/// Objects are exchanged by value: callers own what they read and nothing they
/// mutate is visible to the store until it is written back.
#[async_trait]
pub trait ObjectStore<K: StoreObject>: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str) -> StoreResult<K>;

    /// Lists objects in `namespace`, or across all namespaces for `None`.
    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>)
        -> StoreResult<Vec<K>>;

    async fn create(&self, obj: &K) -> StoreResult<K>;

    /// Replaces the object. A set `resourceVersion` must match the stored one.
    async fn update(&self, obj: &K) -> StoreResult<K>;

    async fn update_status(&self, obj: &K) -> StoreResult<K>;
}

pub async fn get_opt<K, S>(store: &S, namespace: Option<&str>, name: &str) -> StoreResult<Option<K>>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
{
    match store.get(namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Outcome of [`get_or_create`].
#[derive(Debug, Clone, PartialEq)]
pub enum Ensured<K> {
    Existing(K),
    Created(K),
}

impl<K> Ensured<K> {
    pub fn into_inner(self) -> K {
        match self {
            Self::Existing(obj) | Self::Created(obj) => obj,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Looks the object up first and creates it only when absent.
pub async fn get_or_create<K, S>(store: &S, obj: &K) -> StoreResult<Ensured<K>>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
{
    let namespace = obj.namespace();
    let name = obj.name_any();

    if let Some(existing) = get_opt(store, namespace.as_deref(), &name).await? {
        return Ok(Ensured::Existing(existing));
    }

    match store.create(obj).await {
        Ok(created) => Ok(Ensured::Created(created)),
        Err(StoreError::AlreadyExists { .. }) => {
            debug!(name, "Lost create race, reading stored object");
            store
                .get(namespace.as_deref(), &name)
                .await
                .map(Ensured::Existing)
        }
        Err(e) => Err(e),
    }
}

/// Applies `mutate` and writes the object, re-reading it on conflict.
///
/// `mutate` returns whether it changed anything; an unchanged object is not
/// written. It is re-applied to the fresh copy after every conflict, so it must
/// decide from the object it is given rather than from captured state.
pub async fn update_with_retry<K, S, F>(store: &S, current: K, mut mutate: F) -> StoreResult<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> bool + Send,
{
    let namespace = current.namespace();
    let name = current.name_any();
    let mut working = current;

    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        if !mutate(&mut working) {
            return Ok(working);
        }

        match store.update(&working).await {
            Ok(updated) => return Ok(updated),
            Err(StoreError::Conflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                debug!(name, attempt, "Update conflict, re-reading");
                working = store.get(namespace.as_deref(), &name).await?;
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Conflict {
        kind: K::kind(&()).to_string(),
        name,
    })
}

/// Same as [`update_with_retry`], writing through the status sub-resource.
pub async fn update_status_with_retry<K, S, F>(
    store: &S,
    current: K,
    mut mutate: F,
) -> StoreResult<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> bool + Send,
{
    let namespace = current.namespace();
    let name = current.name_any();
    let mut working = current;

    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        if !mutate(&mut working) {
            return Ok(working);
        }

        match store.update_status(&working).await {
            Ok(updated) => return Ok(updated),
            Err(StoreError::Conflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                debug!(name, attempt, "Status update conflict, re-reading");
                working = store.get(namespace.as_deref(), &name).await?;
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Conflict {
        kind: K::kind(&()).to_string(),
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryStore, Op};
    use super::*;
    use crate::api::node_pool::{NodePool, NodePoolSpec};
    use kube::api::ObjectMeta;

    fn pool(name: &str, template: &str) -> NodePool {
        NodePool {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("c-1".into()),
                ..Default::default()
            },
            spec: NodePoolSpec {
                node_template_name: template.into(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn classify_api_errors() {
        let api = |code, reason: &str| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: String::new(),
                reason: reason.into(),
                code,
            })
        };

        assert!(StoreError::classify("Plan", "p", api(404, "NotFound")).is_not_found());
        assert!(matches!(
            StoreError::classify("Plan", "p", api(409, "AlreadyExists")),
            StoreError::AlreadyExists { .. }
        ));
        assert!(matches!(
            StoreError::classify("Plan", "p", api(409, "Conflict")),
            StoreError::Conflict { .. }
        ));
        assert!(matches!(
            StoreError::classify("Plan", "p", api(503, "ServiceUnavailable")),
            StoreError::Request(_)
        ));
    }

    #[tokio::test]
    async fn get_or_create_creates_once() {
        let store = MemoryStore::default();

        let first = get_or_create(&store, &pool("np-1", "a:b")).await.unwrap();
        let second = get_or_create(&store, &pool("np-1", "c:d")).await.unwrap();

        assert!(first.created());
        assert!(!second.created());
        assert_eq!(second.into_inner().spec.node_template_name, "a:b");
        assert_eq!(store.count::<NodePool>(), 1);
    }

    #[tokio::test]
    async fn update_skips_unchanged_objects() {
        let store = MemoryStore::default();
        let stored = store.insert(pool("np-1", "a:b"));

        let result = update_with_retry(&store, stored.clone(), |_| false)
            .await
            .unwrap();

        assert_eq!(result, stored);
        assert_eq!(store.writes::<NodePool>(), 0);
    }

    #[tokio::test]
    async fn update_rereads_on_conflict() {
        let store = MemoryStore::default();
        let stale = store.insert(pool("np-1", "a:b"));

        // Someone else writes in between; our copy is now stale.
        let mut other = stale.clone();
        other.spec.quantity = 3;
        store.update(&other).await.unwrap();

        let updated = update_with_retry(&store, stale, |p| {
            p.spec.node_template_name = "x:y".into();
            true
        })
        .await
        .unwrap();

        assert_eq!(updated.spec.node_template_name, "x:y");
        assert_eq!(updated.spec.quantity, 3);
    }

    #[tokio::test]
    async fn update_surfaces_other_errors() {
        let store = MemoryStore::default();
        let stored = store.insert(pool("np-1", "a:b"));
        store.fail_next::<NodePool>(Op::Update);

        let err = update_with_retry(&store, stored, |p| {
            p.spec.quantity = 1;
            true
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Request(_)));
    }
}
