//! Migration progress recorded on the migrated object itself.
//!
//! The state lives in a single annotation so that it survives restarts and is
//! visible to anything reading the object. Only forward transitions are legal.

use kube::ResourceExt;
use tracing::info;

use crate::store::{update_with_retry, ObjectStore, StoreObject};

use super::{MigrationError, MigrationResult};

/// Annotation set to `"true"` once a legacy object has been migrated.
pub static MIGRATED_ANNOTATION: &str = "migrated";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationStatus {
    Unmigrated,
    Migrated,
}

impl MigrationStatus {
    /// Reads the status; anything but an exact `"true"` is unmigrated.
    pub fn of(obj: &impl ResourceExt) -> Self {
        match obj.annotations().get(MIGRATED_ANNOTATION).map(String::as_str) {
            Some("true") => Self::Migrated,
            _ => Self::Unmigrated,
        }
    }

    pub fn transition(self, to: Self) -> MigrationResult<Self> {
        match (self, to) {
            (Self::Migrated, Self::Unmigrated) => {
                Err(MigrationError::IllegalTransition { from: self, to })
            }
            _ => Ok(to),
        }
    }

    /// Writes the status onto the object, returning whether it changed.
    fn apply(self, obj: &mut impl ResourceExt) -> MigrationResult<bool> {
        let current = Self::of(obj);
        if current.transition(self)? == current {
            return Ok(false);
        }

        let annotations = obj.annotations_mut();
        match self {
            Self::Migrated => {
                annotations.insert(MIGRATED_ANNOTATION.to_string(), "true".to_string())
            }
            Self::Unmigrated => annotations.remove(MIGRATED_ANNOTATION),
        };
        Ok(true)
    }
}

pub fn is_migrated(obj: &impl ResourceExt) -> bool {
    MigrationStatus::of(obj) == MigrationStatus::Migrated
}

/// Records the migration on `obj`, re-reading and retrying on conflicts.
///
/// If a concurrent writer already marked the object, no further write is made.
pub async fn mark_migrated<K, S>(store: &S, obj: K) -> MigrationResult<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
{
    let name = obj.name_any();
    let mut wrote = false;

    let updated = update_with_retry(store, obj, |o| {
        // A fresh copy can only move forward, so apply never fails here.
        wrote = MigrationStatus::Migrated.apply(o).unwrap_or(false);
        wrote
    })
    .await?;

    if wrote {
        info!(name, "Marked migrated");
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;
    use crate::api::node_template::NodeTemplate;
    use crate::store::memory::MemoryStore;

    fn template(annotation: Option<&str>) -> NodeTemplate {
        NodeTemplate {
            metadata: ObjectMeta {
                name: Some("aws-template".into()),
                namespace: Some("user-1".into()),
                annotations: annotation
                    .map(|v| [(MIGRATED_ANNOTATION.to_string(), v.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn status_from_annotation() {
        assert_eq!(MigrationStatus::of(&template(None)), MigrationStatus::Unmigrated);
        assert_eq!(
            MigrationStatus::of(&template(Some("false"))),
            MigrationStatus::Unmigrated
        );
        assert_eq!(
            MigrationStatus::of(&template(Some("TRUE"))),
            MigrationStatus::Unmigrated
        );
        assert!(is_migrated(&template(Some("true"))));
    }

    #[test]
    fn backward_transition_is_rejected() {
        use MigrationStatus::*;

        assert_eq!(Unmigrated.transition(Migrated).unwrap(), Migrated);
        assert_eq!(Migrated.transition(Migrated).unwrap(), Migrated);
        assert_eq!(Unmigrated.transition(Unmigrated).unwrap(), Unmigrated);
        assert!(matches!(
            Migrated.transition(Unmigrated),
            Err(MigrationError::IllegalTransition { .. })
        ));

        let mut migrated = template(Some("true"));
        assert!(Unmigrated.apply(&mut migrated).is_err());
        assert!(is_migrated(&migrated));
    }

    #[tokio::test]
    async fn mark_writes_once() {
        let store = MemoryStore::default();
        let stored = store.insert(template(None));

        let marked = mark_migrated(&store, stored).await.unwrap();
        assert!(is_migrated(&marked));
        assert_eq!(store.writes::<NodeTemplate>(), 1);

        let again = mark_migrated(&store, marked).await.unwrap();
        assert!(is_migrated(&again));
        assert_eq!(store.writes::<NodeTemplate>(), 1);
    }

    #[tokio::test]
    async fn mark_with_stale_copy_does_not_rewrite() {
        let store = MemoryStore::default();
        let stale = store.insert(template(None));

        // A racing pass marks the object first.
        let mut racer = stale.clone();
        racer
            .annotations_mut()
            .insert(MIGRATED_ANNOTATION.into(), "true".into());
        store.update(&racer).await.unwrap();

        let marked = mark_migrated(&store, stale).await.unwrap();

        assert!(is_migrated(&marked));
        assert_eq!(store.writes::<NodeTemplate>(), 1);
    }
}
