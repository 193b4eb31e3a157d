use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::NodeTemplateRef;

/// Management view of a node provisioned for a downstream cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "Node",
    plural = "nodes",
    namespaced
)]
#[kube(status = "NodeStatus")]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_template_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_hostname: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub control_plane: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub etcd: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub worker: bool,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// Provisioning state, carried through verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeStatus {
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl NodeTemplateRef for Node {
    fn node_template_ref(&self) -> Option<&str> {
        self.spec.node_template_name.as_deref()
    }

    fn set_node_template_ref(&mut self, reference: String) {
        self.spec.node_template_name = Some(reference);
    }
}
