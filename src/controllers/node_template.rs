//! Migration of per-user node templates into the global namespace.
//!
//! Every step checks its own postcondition before acting (the global copy
//! exists, a reference already points at it, the migrated annotation is set),
//! so a pass interrupted at any point is completed by the next one.

use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::api::{node::Node, node_pool::NodePool, node_template::NodeTemplate, NodeTemplateRef};
use crate::store::{get_opt, get_or_create, update_with_retry, ObjectStore, StoreObject};

use super::migration::{is_migrated, mark_migrated, MIGRATED_ANNOTATION};
use super::rbac::{self, RbacTarget};
use super::{NodeTemplateSyncError, NodeTemplateSyncResult};

/// Everything the node template reconciler reads or writes.
pub trait ManagementStore:
    ObjectStore<NodeTemplate>
    + ObjectStore<NodePool>
    + ObjectStore<Node>
    + ObjectStore<Role>
    + ObjectStore<RoleBinding>
{
}

impl<S> ManagementStore for S where
    S: ObjectStore<NodeTemplate>
        + ObjectStore<NodePool>
        + ObjectStore<Node>
        + ObjectStore<Role>
        + ObjectStore<RoleBinding>
{
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The template is being deleted; nothing was done.
    Deleted,
    Synced {
        /// The template the rest of the system should use.
        canonical: NodeTemplate,
        /// Whether this pass completed a migration.
        migrated: bool,
    },
}

pub struct NodeTemplateReconciler<S> {
    store: S,
    global_namespace: String,
}

impl<S: ManagementStore> NodeTemplateReconciler<S> {
    pub fn new(store: S, global_namespace: impl Into<String>) -> Self {
        Self {
            store,
            global_namespace: global_namespace.into(),
        }
    }

    #[instrument(skip_all, fields(name = nt.name_any(), namespace = nt.namespace()), err)]
    pub async fn sync(&self, nt: &NodeTemplate) -> NodeTemplateSyncResult<SyncOutcome> {
        if nt.metadata.deletion_timestamp.is_some() {
            return Ok(SyncOutcome::Deleted);
        }

        let creator_id = nt
            .creator_id()
            .ok_or_else(|| NodeTemplateSyncError::MissingCreator(nt.name_any()))?
            .to_string();

        let (canonical, migrated) = match (nt.is_legacy(&creator_id), is_migrated(nt)) {
            (true, false) => (self.migrate(nt.clone()).await?, true),
            (true, true) => match self.global_copy_of(nt).await? {
                Some(global) => (global, false),
                None => {
                    debug!("Global copy of migrated template is gone, skipping RBAC");
                    return Ok(SyncOutcome::Synced {
                        canonical: nt.clone(),
                        migrated: false,
                    });
                }
            },
            (false, _) => (nt.clone(), false),
        };

        rbac::ensure(&self.store, &RbacTarget::of(&canonical)?, &creator_id).await?;

        Ok(SyncOutcome::Synced {
            canonical,
            migrated,
        })
    }

    /// The global template a migrated legacy template was copied to.
    async fn global_copy_of(&self, legacy: &NodeTemplate) -> NodeTemplateSyncResult<Option<NodeTemplate>> {
        get_opt(&self.store, Some(&self.global_namespace), &legacy.global_name())
            .await
            .map_err(NodeTemplateSyncError::GlobalCopy)
    }

    async fn migrate(&self, legacy: NodeTemplate) -> NodeTemplateSyncResult<NodeTemplate> {
        let global = self.ensure_global_copy(&legacy).await?;

        let from = legacy.reference();
        let to = global.reference();
        let pools = self.rewrite_references::<NodePool>(&from, &to).await?;
        let nodes = self.rewrite_references::<Node>(&from, &to).await?;

        mark_migrated(&self.store, legacy).await?;
        info!(global = global.name_any(), pools, nodes, "Migrated node template");

        Ok(global)
    }

    async fn ensure_global_copy(&self, legacy: &NodeTemplate) -> NodeTemplateSyncResult<NodeTemplate> {
        let global = legacy.to_global(&self.global_namespace, &[MIGRATED_ANNOTATION]);

        let ensured = get_or_create(&self.store, &global)
            .await
            .map_err(NodeTemplateSyncError::GlobalCopy)?;
        match ensured.created() {
            true => info!(global = global.name_any(), "Created global node template"),
            false => debug!(global = global.name_any(), "Global node template exists"),
        }

        Ok(ensured.into_inner())
    }

    /// Points every `K` referencing `from` at `to`, returning how many changed.
    async fn rewrite_references<K>(&self, from: &str, to: &str) -> NodeTemplateSyncResult<usize>
    where
        K: StoreObject + NodeTemplateRef,
        S: ObjectStore<K>,
    {
        let referencing: Vec<K> = ObjectStore::<K>::list(&self.store, None, None)
            .await
            .map_err(NodeTemplateSyncError::RewriteReferences)?
            .into_iter()
            .filter(|obj| obj.references(from))
            .collect();

        let mut rewritten = 0;
        for obj in referencing {
            let name = obj.name_any();
            let result = update_with_retry(&self.store, obj, |o| {
                if !o.references(from) {
                    return false;
                }
                o.set_node_template_ref(to.to_string());
                true
            })
            .await;

            match result {
                Ok(_) => {
                    debug!(kind = %K::kind(&()), name, to, "Rewrote node template reference");
                    rewritten += 1;
                }
                Err(e) if e.is_not_found() => debug!(name, "Referencing object is gone"),
                Err(e) => return Err(NodeTemplateSyncError::RewriteReferences(e)),
            }
        }

        Ok(rewritten)
    }

    /// Ensures RBAC for every existing template.
    ///
    /// Templates without a creator are skipped: the regular sync reports them.
    /// Migrated legacy templates are skipped too; their global copy is listed
    /// alongside them.
    pub async fn backfill_rbac(&self) -> NodeTemplateSyncResult<usize> {
        let templates = ObjectStore::<NodeTemplate>::list(&self.store, None, None)
            .await
            .map_err(NodeTemplateSyncError::List)?;

        let mut ensured = 0;
        for nt in templates {
            let Some(creator_id) = nt.creator_id() else {
                warn!(name = nt.name_any(), namespace = nt.namespace(), "Skipping node template without creator");
                continue;
            };
            // Access to a migrated template is granted on its global copy.
            if nt.is_legacy(creator_id) && is_migrated(&nt) {
                continue;
            }
            rbac::ensure(&self.store, &RbacTarget::of(&nt)?, creator_id).await?;
            ensured += 1;
        }

        info!(ensured, "Node template RBAC backfill finished");
        Ok(ensured)
    }
}
