//! Convergence of k3s upgrade plans in downstream clusters.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::{api::ObjectMeta, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::api::{
    cluster::{Cluster, K3sConfig, UPDATED_CONDITION},
    plan::{ContainerSpec, DrainSpec, Plan, PlanSpec, RANCHER_MANAGED_LABEL},
};
use crate::store::{get_opt, update_status_with_retry, update_with_retry, ObjectStore, StoreError};

use super::cluster_context::ClusterResolver;
use super::{UpgradeSyncError, UpgradeSyncResult};

pub static MASTER_PLAN: &str = "k3s-master-plan";
pub static WORKER_PLAN: &str = "k3s-worker-plan";

static MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";
static UPGRADE_SERVICE_ACCOUNT: &str = "system-upgrade";

#[derive(Clone, Debug)]
pub struct UpgradeSettings {
    /// Downstream namespace holding the plans.
    pub namespace: String,
    /// Cluster driver handled by this orchestrator.
    pub driver: String,
    pub image: String,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            namespace: "cattle-system".to_string(),
            driver: "k3s".to_string(),
            image: "rancher/k3s-upgrade".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Deleted, foreign driver or no k3s configuration.
    Skipped,
    /// The downstream cluster does not serve the Plan resource.
    Unsupported,
    Converged {
        created: usize,
        updated: usize,
        deactivated: usize,
        /// Some managed plan is upgrading nodes right now.
        applying: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlanAction {
    Created,
    Updated,
    Unchanged,
    Foreign,
}

fn requirement(operator: &str, values: Option<Vec<String>>) -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: MASTER_ROLE_LABEL.to_string(),
            operator: operator.to_string(),
            values,
        }]),
        match_labels: None,
    }
}

/// Copies every field this controller owns from `desired` onto `plan`.
///
/// Returns whether the spec changed.
fn overlay(plan: &mut Plan, desired: &Plan) -> bool {
    let before = plan.spec.clone();
    let (spec, want) = (&mut plan.spec, &desired.spec);

    spec.concurrency = want.concurrency;
    spec.node_selector = want.node_selector.clone();
    spec.service_account_name = want.service_account_name.clone();
    spec.version = want.version.clone();
    spec.cordon = want.cordon;
    spec.upgrade = overlay_container(spec.upgrade.take(), &want.upgrade);
    spec.prepare = overlay_container(spec.prepare.take(), &want.prepare);
    spec.drain = match (spec.drain.take(), &want.drain) {
        (Some(current), Some(wanted)) => Some(DrainSpec {
            force: wanted.force,
            ..current
        }),
        (None, wanted) => wanted.clone(),
        (_, None) => None,
    };

    plan.labels_mut()
        .insert(RANCHER_MANAGED_LABEL.to_string(), "true".to_string());

    plan.spec != before
}

fn overlay_container(
    current: Option<ContainerSpec>,
    desired: &Option<ContainerSpec>,
) -> Option<ContainerSpec> {
    match (current, desired) {
        (Some(current), Some(wanted)) => Some(ContainerSpec {
            image: wanted.image.clone(),
            args: wanted.args.clone(),
            ..current
        }),
        (_, wanted) => wanted.clone(),
    }
}

pub struct UpgradeOrchestrator<S, R> {
    store: S,
    resolver: R,
    settings: UpgradeSettings,
}

impl<S, R> UpgradeOrchestrator<S, R>
where
    S: ObjectStore<Cluster>,
    R: ClusterResolver,
{
    pub fn new(store: S, resolver: R, settings: UpgradeSettings) -> Self {
        Self {
            store,
            resolver,
            settings,
        }
    }

    fn plan(&self, name: &str, concurrency: i64, config: &K3sConfig) -> Plan {
        Plan {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.settings.namespace.clone()),
                labels: Some([(RANCHER_MANAGED_LABEL.to_string(), "true".to_string())].into()),
                ..Default::default()
            },
            spec: PlanSpec {
                concurrency: concurrency.max(1),
                service_account_name: UPGRADE_SERVICE_ACCOUNT.to_string(),
                version: config.kubernetes_version.clone(),
                upgrade: Some(ContainerSpec {
                    image: self.settings.image.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    fn drain(plan: &mut Plan, drain: bool) {
        match drain {
            true => plan.spec.drain = Some(DrainSpec {
                force: true,
                ..Default::default()
            }),
            false => plan.spec.cordon = Some(true),
        }
    }

    pub fn master_plan(&self, config: &K3sConfig) -> Plan {
        let strategy = config.upgrade_strategy.clone().unwrap_or_default();
        let mut plan = self.plan(MASTER_PLAN, strategy.server_concurrency, config);
        plan.spec.node_selector = Some(requirement("In", Some(vec!["true".to_string()])));
        Self::drain(&mut plan, strategy.drain_server_nodes);
        plan
    }

    pub fn worker_plan(&self, config: &K3sConfig) -> Plan {
        let strategy = config.upgrade_strategy.clone().unwrap_or_default();
        let mut plan = self.plan(WORKER_PLAN, strategy.worker_concurrency, config);
        plan.spec.node_selector = Some(requirement("DoesNotExist", None));
        plan.spec.prepare = Some(ContainerSpec {
            image: self.settings.image.clone(),
            args: Some(vec!["prepare".to_string(), MASTER_PLAN.to_string()]),
            ..Default::default()
        });
        Self::drain(&mut plan, strategy.drain_worker_nodes);
        plan
    }

    #[instrument(skip_all, fields(cluster = cluster.name_any()), err)]
    pub async fn sync(&self, cluster: &Cluster) -> UpgradeSyncResult<UpgradeOutcome> {
        if cluster.metadata.deletion_timestamp.is_some()
            || cluster.driver() != Some(self.settings.driver.as_str())
        {
            return Ok(UpgradeOutcome::Skipped);
        }
        let Some(config) = cluster.spec.k3s_config.as_ref() else {
            debug!("Cluster has no k3s configuration");
            return Ok(UpgradeOutcome::Skipped);
        };

        let downstream = self.resolver.resolve(&cluster.name_any()).await?;

        let plans = match ObjectStore::<Plan>::list(&downstream, Some(&self.settings.namespace), None).await {
            Ok(plans) => plans,
            Err(e) if e.is_not_found() => {
                info!("Plan resource is not installed, upgrades unsupported");
                return Ok(UpgradeOutcome::Unsupported);
            }
            Err(e) => return Err(UpgradeSyncError::PlanList(e)),
        };
        let (managed, unmanaged): (Vec<Plan>, Vec<Plan>) = plans.into_iter().partition(Plan::is_managed);

        let mut deactivated = 0;
        for plan in unmanaged.into_iter().filter(|p| !p.is_disabled()) {
            let name = plan.name_any();
            update_with_retry(&downstream, plan, Plan::disable)
                .await
                .map_err(UpgradeSyncError::PlanWrite)?;
            info!(plan = name, "Disabled unmanaged plan");
            deactivated += 1;
        }

        let (mut created, mut updated, mut applying) = (0, 0, false);
        for desired in [self.master_plan(config), self.worker_plan(config)] {
            let existing = managed.iter().find(|p| p.name_any() == desired.name_any()).cloned();
            let (action, plan) = self.apply_plan(&downstream, existing, &desired).await?;
            match action {
                PlanAction::Created => created += 1,
                PlanAction::Updated => updated += 1,
                PlanAction::Unchanged | PlanAction::Foreign => {}
            }
            applying |= plan.is_some_and(|p| p.is_applying());
        }

        self.update_condition(cluster, applying, created + updated > 0)
            .await?;

        Ok(UpgradeOutcome::Converged {
            created,
            updated,
            deactivated,
            applying,
        })
    }

    async fn apply_plan<D>(
        &self,
        downstream: &D,
        existing: Option<Plan>,
        desired: &Plan,
    ) -> UpgradeSyncResult<(PlanAction, Option<Plan>)>
    where
        D: ObjectStore<Plan>,
    {
        let name = desired.name_any();
        let current = match existing {
            Some(plan) => plan,
            None => match downstream.create(desired).await {
                Ok(plan) => {
                    info!(plan = name, version = plan.spec.version, "Created plan");
                    return Ok((PlanAction::Created, Some(plan)));
                }
                Err(StoreError::AlreadyExists { .. }) => downstream
                    .get(Some(&self.settings.namespace), &name)
                    .await
                    .map_err(UpgradeSyncError::PlanWrite)?,
                Err(e) => return Err(UpgradeSyncError::PlanWrite(e)),
            },
        };

        if !current.is_managed() {
            warn!(plan = name, "Plan exists but is not managed, leaving it alone");
            return Ok((PlanAction::Foreign, None));
        }

        let mut changed = false;
        let plan = update_with_retry(downstream, current, |plan| {
            changed = overlay(plan, desired);
            changed
        })
        .await
        .map_err(UpgradeSyncError::PlanWrite)?;

        match changed {
            true => {
                info!(plan = name, version = plan.spec.version, "Updated plan");
                Ok((PlanAction::Updated, Some(plan)))
            }
            false => Ok((PlanAction::Unchanged, Some(plan))),
        }
    }

    /// Raises `Updated` while nodes are applying and clears it once a pass
    /// finds nothing to change and nothing applying.
    async fn update_condition(&self, cluster: &Cluster, applying: bool, wrote: bool) -> UpgradeSyncResult<()> {
        if !applying && wrote {
            return Ok(());
        }

        // Decide from the stored status, the watched copy may predate our last write.
        let Some(current) = get_opt::<Cluster, _>(&self.store, None, &cluster.name_any())
            .await
            .map_err(UpgradeSyncError::ClusterStatus)?
        else {
            debug!("Cluster is gone, not updating its condition");
            return Ok(());
        };

        update_status_with_retry(&self.store, current, |c| match applying {
            true => c.set_condition(UPDATED_CONDITION, true),
            false => c.condition_is_true(UPDATED_CONDITION) && c.set_condition(UPDATED_CONDITION, false),
        })
        .await
        .map_err(UpgradeSyncError::ClusterStatus)?;

        Ok(())
    }
}
