use thiserror::Error;

use crate::store::StoreError;

use self::migration::MigrationStatus;

pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Illegal migration transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: MigrationStatus,
        to: MigrationStatus,
    },

    #[error("Migration annotation update error: {0}")]
    Update(#[from] StoreError),
}

pub type RbacResult<T> = std::result::Result<T, RbacError>;

#[derive(Error, Debug)]
pub enum RbacError {
    #[error("{kind} `{name}` has no uid yet")]
    MissingUid { kind: String, name: String },

    #[error("Role ensure error: {0}")]
    Role(#[source] StoreError),

    #[error("Role binding ensure error: {0}")]
    RoleBinding(#[source] StoreError),
}

pub type NodeTemplateSyncResult<T> = std::result::Result<T, NodeTemplateSyncError>;

#[derive(Error, Debug)]
pub enum NodeTemplateSyncError {
    #[error("NodeTemplate `{0}` has no creatorId annotation")]
    MissingCreator(String),

    #[error("Global NodeTemplate error: {0}")]
    GlobalCopy(#[source] StoreError),

    #[error("Reference rewrite error: {0}")]
    RewriteReferences(#[source] StoreError),

    #[error("NodeTemplate list error: {0}")]
    List(#[source] StoreError),

    #[error("{0}")]
    Migration(#[from] MigrationError),

    #[error("{0}")]
    Rbac(#[from] RbacError),
}

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Cluster `{0}` has no kubeconfig secret")]
    ClusterNotFound(String),

    #[error("Kubeconfig secret for cluster `{0}` has no `value` key")]
    MissingKubeconfig(String),

    #[error("Kubeconfig secret lookup error: {0}")]
    SecretLookup(#[source] kube::Error),

    #[error("Kubeconfig parse error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Cluster client error: {0}")]
    Client(#[source] kube::Error),
}

pub type UpgradeSyncResult<T> = std::result::Result<T, UpgradeSyncError>;

#[derive(Error, Debug)]
pub enum UpgradeSyncError {
    #[error("{0}")]
    Resolve(#[from] ResolveError),

    #[error("Plan list error: {0}")]
    PlanList(#[source] StoreError),

    #[error("Plan write error: {0}")]
    PlanWrite(#[source] StoreError),

    #[error("Cluster status update error: {0}")]
    ClusterStatus(#[source] StoreError),
}

pub mod cluster_context;
pub mod controller;
pub mod migration;
pub mod node_template;
pub mod rbac;
pub mod upgrade;
