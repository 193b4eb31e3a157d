use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label marking a Plan as owned by this controller.
pub static RANCHER_MANAGED_LABEL: &str = "rancher-managed";

/// Label key that no node carries, used to switch off foreign plans.
pub static UPGRADE_DISABLE_LABEL: &str = "plan.upgrade.cattle.io/disable";

/// Plan drives the system-upgrade-controller inside a downstream cluster.
///
/// Only the fields the controller converges are modelled explicitly; any other
/// field is kept in the flattened maps so updates never drop it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "upgrade.cattle.io",
    version = "v1",
    kind = "Plan",
    plural = "plans",
    namespaced
)]
#[kube(status = "PlanStatus")]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    #[serde(default)]
    pub concurrency: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<ContainerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cordon: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<ContainerSpec>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ContainerSpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DrainSpec {
    #[serde(default)]
    pub force: bool,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Nodes currently running the upgrade job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applying: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_hash: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// Selector matching no node at all.
pub fn disabled_selector() -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: UPGRADE_DISABLE_LABEL.to_string(),
            operator: "Exists".to_string(),
            values: None,
        }]),
        match_labels: None,
    }
}

impl Plan {
    pub fn is_managed(&self) -> bool {
        self.labels().contains_key(RANCHER_MANAGED_LABEL)
    }

    pub fn is_applying(&self) -> bool {
        self.status.as_ref().is_some_and(|s| !s.applying.is_empty())
    }

    pub fn is_disabled(&self) -> bool {
        self.spec.node_selector.as_ref() == Some(&disabled_selector())
    }

    /// Points the plan at a label nobody carries, returning whether it changed.
    pub fn disable(&mut self) -> bool {
        if self.is_disabled() {
            return false;
        }
        self.spec.node_selector = Some(disabled_selector());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foreign_plan() -> Plan {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "upgrade.cattle.io/v1",
            "kind": "Plan",
            "metadata": {"name": "custom", "namespace": "cattle-system"},
            "spec": {
                "concurrency": 2,
                "version": "v1.17.2+k3s1",
                "nodeSelector": {"matchExpressions": [{"key": "k3s-upgrade", "operator": "Exists"}]},
                "tolerations": [{"operator": "Exists"}],
                "upgrade": {"image": "rancher/k3s-upgrade", "envs": [{"name": "A", "value": "b"}]}
            },
            "status": {"applying": ["node-1"], "latestHash": "abc"}
        }))
        .unwrap()
    }

    #[test]
    fn unmodelled_fields_are_kept() {
        let plan = foreign_plan();
        assert!(plan.spec.other.contains_key("tolerations"));
        assert!(plan.spec.upgrade.as_ref().unwrap().other.contains_key("envs"));

        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["spec"]["tolerations"][0]["operator"], "Exists");
        assert_eq!(value["spec"]["upgrade"]["envs"][0]["name"], "A");
    }

    #[test]
    fn disable_is_idempotent() {
        let mut plan = foreign_plan();
        assert!(!plan.is_managed());
        assert!(plan.is_applying());
        assert!(!plan.is_disabled());

        assert!(plan.disable());
        assert!(plan.is_disabled());
        assert!(!plan.disable());

        let selector = plan.spec.node_selector.unwrap();
        let requirement = &selector.match_expressions.unwrap()[0];
        assert_eq!(requirement.key, UPGRADE_DISABLE_LABEL);
        assert_eq!(requirement.operator, "Exists");
    }
}
