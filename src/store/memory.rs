use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use kube::{core::ErrorResponse, ResourceExt};
use serde_json::Value;

use super::{ObjectStore, StoreError, StoreObject, StoreResult};

type Key = (String, Option<String>, String);

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
}

/// In-memory [`ObjectStore`] with API server like semantics.
///
/// Objects are kept serialized, so every read hands out a fresh copy. Writes
/// bump a global resource version and reject stale `resourceVersion`s.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    version: u64,
    writes: BTreeMap<String, usize>,
    missing: BTreeSet<String>,
    failures: Vec<(String, Op)>,
}

fn kind_of<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

fn key_of<K: StoreObject>(namespace: Option<&str>, name: &str) -> Key {
    (kind_of::<K>(), namespace.map(String::from), name.to_string())
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => match term.strip_prefix('!') {
                Some(k) => !labels.contains_key(k),
                None => labels.contains_key(term),
            },
        })
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Stores an object directly, assigning uid and resource version.
    pub(crate) fn insert<K: StoreObject>(&self, mut obj: K) -> K {
        let mut inner = self.lock();
        inner.version += 1;
        let version = inner.version;
        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(|| format!("uid-{version}"));
        meta.resource_version = Some(version.to_string());

        let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
        inner
            .objects
            .insert(key, serde_json::to_value(&obj).unwrap());
        obj
    }

    pub(crate) fn stored<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub(crate) fn all<K: StoreObject>(&self) -> Vec<K> {
        let kind = kind_of::<K>();
        self.lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    pub(crate) fn count<K: StoreObject>(&self) -> usize {
        self.all::<K>().len()
    }

    /// Creates and updates performed through the store API for this kind.
    pub(crate) fn writes<K: StoreObject>(&self) -> usize {
        self.lock()
            .writes
            .get(&kind_of::<K>())
            .copied()
            .unwrap_or_default()
    }

    /// Makes the kind unknown to the store, like a missing CRD.
    pub(crate) fn remove_kind<K: StoreObject>(&self) {
        self.lock().missing.insert(kind_of::<K>());
    }

    /// Fails the next `op` on this kind with a server error.
    pub(crate) fn fail_next<K: StoreObject>(&self, op: Op) {
        self.lock().failures.push((kind_of::<K>(), op));
    }

    fn check<K: StoreObject>(inner: &mut Inner, op: Op, name: &str) -> StoreResult<()> {
        let kind = kind_of::<K>();
        if let Some(pos) = inner
            .failures
            .iter()
            .position(|(k, o)| *k == kind && *o == op)
        {
            inner.failures.remove(pos);
            return Err(StoreError::Request(kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: format!("injected {op:?} failure"),
                reason: "InternalError".into(),
                code: 500,
            })));
        }
        if inner.missing.contains(&kind) {
            return Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn write<K: StoreObject>(
        &self,
        op: Op,
        obj: &K,
        apply: impl FnOnce(&mut Value, Value),
    ) -> StoreResult<K> {
        let mut inner = self.lock();
        let name = obj.name_any();
        Self::check::<K>(&mut inner, op, &name)?;

        let key = key_of::<K>(obj.namespace().as_deref(), &name);
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind_of::<K>(),
                name: name.clone(),
            })?;
        let current: K = serde_json::from_value(stored.clone())?;
        if obj.resource_version().is_some() && obj.resource_version() != current.resource_version() {
            return Err(StoreError::Conflict {
                kind: kind_of::<K>(),
                name,
            });
        }

        inner.version += 1;
        let mut next = stored;
        apply(&mut next, serde_json::to_value(obj)?);
        next["metadata"]["resourceVersion"] = Value::String(inner.version.to_string());
        *inner.writes.entry(kind_of::<K>()).or_default() += 1;
        inner.objects.insert(key, next.clone());

        Ok(serde_json::from_value(next)?)
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for MemoryStore {
    async fn get(&self, namespace: Option<&str>, name: &str) -> StoreResult<K> {
        let mut inner = self.lock();
        Self::check::<K>(&mut inner, Op::Get, name)?;

        match inner.objects.get(&key_of::<K>(namespace, name)) {
            Some(v) => Ok(serde_json::from_value(v.clone())?),
            None => Err(StoreError::NotFound {
                kind: kind_of::<K>(),
                name: name.to_string(),
            }),
        }
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> StoreResult<Vec<K>> {
        let mut inner = self.lock();
        Self::check::<K>(&mut inner, Op::List, "*")?;

        let kind = kind_of::<K>();
        let mut items = vec![];
        for ((k, ns, _), v) in inner.objects.iter() {
            if *k != kind || (namespace.is_some() && ns.as_deref() != namespace) {
                continue;
            }
            let obj: K = serde_json::from_value(v.clone())?;
            if label_selector.is_some_and(|s| !matches_selector(obj.labels(), s)) {
                continue;
            }
            items.push(obj);
        }
        Ok(items)
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let mut inner = self.lock();
        let name = obj.name_any();
        Self::check::<K>(&mut inner, Op::Create, &name)?;

        let key = key_of::<K>(obj.namespace().as_deref(), &name);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                name,
            });
        }

        inner.version += 1;
        let version = inner.version;
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = Some(format!("uid-{version}"));
        meta.resource_version = Some(version.to_string());

        *inner.writes.entry(kind_of::<K>()).or_default() += 1;
        inner.objects.insert(key, serde_json::to_value(&created)?);
        Ok(created)
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        self.write(Op::Update, obj, |stored, mut incoming| {
            // Status belongs to the status sub-resource and uid is immutable.
            match stored.get("status") {
                Some(status) => incoming["status"] = status.clone(),
                None => {
                    if let Some(map) = incoming.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            incoming["metadata"]["uid"] = stored["metadata"]["uid"].clone();
            *stored = incoming;
        })
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        self.write(Op::UpdateStatus, obj, |stored, incoming| {
            match incoming.get("status") {
                Some(status) => stored["status"] = status.clone(),
                None => {
                    if let Some(map) = stored.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_terms() {
        let labels: BTreeMap<String, String> =
            [("rancher-managed".to_string(), "true".to_string())].into();

        assert!(matches_selector(&labels, "rancher-managed"));
        assert!(matches_selector(&labels, "rancher-managed=true"));
        assert!(!matches_selector(&labels, "rancher-managed=false"));
        assert!(matches_selector(&labels, "!other"));
        assert!(!matches_selector(&labels, "rancher-managed,other"));
    }
}
