use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::ObjectMeta, Resource, ResourceExt};
use tracing::{debug, info};

use crate::api::{MANAGEMENT_API_VERSION, MANAGEMENT_GROUP};
use crate::store::{get_or_create, ObjectStore};

use super::{RbacError, RbacResult};

/// Resource the creator is granted full access to.
#[derive(Clone, Debug, PartialEq)]
pub struct RbacTarget {
    /// Plural resource name, e.g. `nodetemplates`.
    pub resource: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
}

impl RbacTarget {
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> RbacResult<Self> {
        let uid = obj.uid().ok_or_else(|| RbacError::MissingUid {
            kind: K::kind(&()).to_string(),
            name: obj.name_any(),
        })?;

        Ok(Self {
            resource: K::plural(&()).to_string(),
            kind: K::kind(&()).to_string(),
            name: obj.name_any(),
            namespace: obj.namespace(),
            uid,
        })
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: MANAGEMENT_API_VERSION.to_string(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }
}

pub fn role_name(resource: &str, name: &str, creator_id: &str) -> String {
    format!("{resource}-{name}-{creator_id}")
}

pub fn binding_name(role_name: &str) -> String {
    format!("{role_name}-binding")
}

fn owner_role(target: &RbacTarget, name: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: target.namespace.clone(),
            owner_references: Some(vec![target.owner_reference()]),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![MANAGEMENT_GROUP.to_string()]),
            resources: Some(vec![target.resource.clone()]),
            resource_names: Some(vec![target.name.clone()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        }]),
    }
}

fn creator_binding(target: &RbacTarget, role: &str, creator_id: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(binding_name(role)),
            namespace: target.namespace.clone(),
            owner_references: Some(vec![target.owner_reference()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            kind: "User".to_string(),
            name: creator_id.to_string(),
            namespace: None,
        }]),
    }
}

/// Ensures the creator owns `target` through one Role and one RoleBinding.
///
/// Both objects are looked up before being created, so calling this on every
/// reconcile never produces duplicates.
pub async fn ensure<S>(store: &S, target: &RbacTarget, creator_id: &str) -> RbacResult<()>
where
    S: ObjectStore<Role> + ObjectStore<RoleBinding> + ?Sized,
{
    let role = role_name(&target.resource, &target.name, creator_id);

    let ensured = get_or_create::<Role, _>(store, &owner_role(target, &role))
        .await
        .map_err(RbacError::Role)?;
    if ensured.created() {
        info!(role, "Created role");
    }

    let ensured = get_or_create::<RoleBinding, _>(store, &creator_binding(target, &role, creator_id))
        .await
        .map_err(RbacError::RoleBinding)?;
    if ensured.created() {
        info!(role, creator_id, "Created role binding");
    }

    debug!(role, "RBAC ensured");
    Ok(())
}
