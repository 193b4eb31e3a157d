use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::NodeTemplateRef;

/// NodePool provisions a group of nodes in a cluster from a single node template.
///
/// Fields the controller does not read are kept in `other` so a replace
/// writes them back untouched.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "NodePool",
    plural = "nodepools",
    namespaced
)]
#[kube(status = "NodePoolStatus")]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub hostname_prefix: String,

    #[serde(default)]
    pub quantity: i64,

    /// Node template used for new nodes, as `namespace:name`.
    #[serde(default)]
    pub node_template_name: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub control_plane: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub etcd: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub worker: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodePoolStatus {
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl NodeTemplateRef for NodePool {
    fn node_template_ref(&self) -> Option<&str> {
        Some(self.spec.node_template_name.as_str()).filter(|r| !r.is_empty())
    }

    fn set_node_template_ref(&mut self, reference: String) {
        self.spec.node_template_name = reference;
    }
}
