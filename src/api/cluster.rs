use std::collections::BTreeMap;

use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Condition raised while a managed upgrade is rolling through the cluster.
pub static UPDATED_CONDITION: &str = "Updated";

/// Management cluster object for a downstream cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "Cluster",
    plural = "clusters"
)]
#[kube(status = "ClusterStatus")]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s_config: Option<K3sConfig>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K3sConfig {
    /// Target k3s version, e.g. `v1.17.4+k3s1`.
    pub kubernetes_version: String,

    #[serde(
        default,
        rename = "k3supgradeStrategy",
        skip_serializing_if = "Option::is_none"
    )]
    pub upgrade_strategy: Option<UpgradeStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStrategy {
    #[serde(default)]
    pub server_concurrency: i64,

    #[serde(default)]
    pub worker_concurrency: i64,

    #[serde(default)]
    pub drain_server_nodes: bool,

    #[serde(default)]
    pub drain_worker_nodes: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Distribution driver that provisioned the cluster, e.g. `k3s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    /// Endpoint, credentials and everything else the status carries.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl Cluster {
    pub fn driver(&self) -> Option<&str> {
        self.status.as_ref()?.driver.as_deref()
    }

    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
            .is_some_and(|c| c.status == "True")
    }

    /// Sets the condition status, returning whether anything changed.
    pub fn set_condition(&mut self, type_: &str, value: bool) -> bool {
        let status = if value { "True" } else { "False" };
        let conditions = &mut self.status.get_or_insert_with(Default::default).conditions;

        match conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(condition) if condition.status == status => false,
            Some(condition) => {
                condition.status = status.to_string();
                condition.last_update_time = Some(Utc::now().to_rfc3339());
                true
            }
            None => {
                conditions.push(ClusterCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    last_update_time: Some(Utc::now().to_rfc3339()),
                    ..Default::default()
                });
                true
            }
        }
    }
}
