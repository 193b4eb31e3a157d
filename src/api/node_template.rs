use std::collections::BTreeMap;

use kube::{api::ObjectMeta, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CREATOR_ID_ANNOTATION;

/// Label placed on a migrated global copy, pointing at the legacy object UID.
pub static PARENT_NODE_TEMPLATE_LABEL: &str = "parentNodeTemplate";

/// Plural resource name, used in RBAC rules and role names.
pub static NODE_TEMPLATE_RESOURCE: &str = "nodetemplates";

/// NodeTemplate describes the machine driver configuration used to provision nodes.
///
/// The driver configuration is opaque to the controller and is carried over
/// verbatim when a template is cloned into the global namespace.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "NodeTemplate",
    plural = "nodetemplates",
    namespaced
)]
#[kube(status = "NodeTemplateStatus")]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_name: Option<String>,

    /// Driver specific configuration blocks, e.g. `amazonec2Config`.
    #[serde(flatten)]
    pub config: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeTemplateStatus {
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl NodeTemplate {
    pub fn creator_id(&self) -> Option<&str> {
        self.annotations()
            .get(CREATOR_ID_ANNOTATION)
            .map(String::as_str)
    }

    /// A legacy template lives in the namespace named after its creator.
    pub fn is_legacy(&self, creator_id: &str) -> bool {
        self.namespace().as_deref() == Some(creator_id)
    }

    /// Reference string used by node pools and nodes: `namespace:name`.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Name of the global copy of this template.
    pub fn global_name(&self) -> String {
        format!("nt-{}-{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Builds the global copy of this template: same spec, fresh metadata.
    pub fn to_global(&self, global_namespace: &str, skip_annotations: &[&str]) -> NodeTemplate {
        let annotations = self
            .annotations()
            .iter()
            .filter(|(k, _)| !skip_annotations.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let labels = self
            .uid()
            .map(|uid| [(PARENT_NODE_TEMPLATE_LABEL.to_string(), uid)].into());

        NodeTemplate {
            metadata: ObjectMeta {
                name: Some(self.global_name()),
                namespace: Some(global_namespace.to_string()),
                annotations: Some(annotations),
                labels,
                ..Default::default()
            },
            spec: self.spec.clone(),
            status: None,
        }
    }
}
