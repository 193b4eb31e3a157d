use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::controller::{Action, Controller},
    runtime::events::{Event, EventType},
    runtime::watcher::Config,
    Resource,
};
use opentelemetry::trace::TraceId;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::api::{cluster::Cluster, node_template::NodeTemplate};
use crate::config::Settings;
use crate::controllers::{
    controller::Context, node_template::SyncOutcome, upgrade::UpgradeOutcome,
    NodeTemplateSyncError,
};
use crate::metrics::Diagnostics;
use crate::{telemetry, Error, Metrics, Result};

pub static NODE_TEMPLATE_CONTROLLER: &str = "nodetemplate";
pub static CLUSTER_CONTROLLER: &str = "cluster";

/// Requeue delay for failures that need a human to fix the object.
const PERMANENT_FAILURE_REQUEUE: Duration = Duration::from_secs(60 * 60);
const FAILURE_REQUEUE: Duration = Duration::from_secs(30);
/// Polling interval while nodes are being upgraded.
const APPLYING_REQUEUE: Duration = Duration::from_secs(30);

fn record_trace_id() {
    let trace_id = telemetry::get_trace_id();
    if trace_id != TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
}

#[instrument(skip(ctx, nt), fields(trace_id, name = nt.name_any(), namespace = nt.namespace()))]
async fn reconcile_node_template(nt: Arc<NodeTemplate>, ctx: Arc<Context>) -> Result<Action> {
    record_trace_id();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.count_and_measure(NODE_TEMPLATE_CONTROLLER);

    let synced = ctx
        .bounded(async { Ok(ctx.node_templates.sync(&nt).await?) })
        .await;

    match synced {
        Ok(SyncOutcome::Synced {
            canonical,
            migrated: true,
        }) => {
            ctx.metrics.migrations.inc();
            ctx.publish(
                nt.as_ref(),
                Event {
                    type_: EventType::Normal,
                    reason: "Migrated".into(),
                    note: Some(format!(
                        "Migrated to `{}` in `{}`",
                        canonical.name_any(),
                        canonical.namespace().unwrap_or_default()
                    )),
                    action: "Migrating".into(),
                    secondary: Some(canonical.object_ref(&())),
                },
            )
            .await?;
            Ok(Action::requeue(ctx.settings.resync_period))
        }
        Ok(_) => Ok(Action::requeue(ctx.settings.resync_period)),
        Err(e @ Error::NodeTemplateSync(NodeTemplateSyncError::MissingCreator(_))) => {
            ctx.warn(nt.as_ref(), "MissingCreator", e.to_string()).await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

#[instrument(skip(ctx, cluster), fields(trace_id, name = cluster.name_any()))]
async fn reconcile_cluster(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    record_trace_id();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.count_and_measure(CLUSTER_CONTROLLER);

    let outcome = ctx
        .bounded(async { Ok(ctx.upgrades.sync(&cluster).await?) })
        .await?;
    ctx.metrics.plans_written(&outcome);

    match outcome {
        UpgradeOutcome::Converged {
            created, updated, ..
        } if created + updated > 0 => {
            ctx.publish(
                cluster.as_ref(),
                Event {
                    type_: EventType::Normal,
                    reason: "PlansUpdated".into(),
                    note: Some(format!("Created {created} and updated {updated} upgrade plans")),
                    action: "Upgrading".into(),
                    secondary: None,
                },
            )
            .await?;
            Ok(Action::requeue(APPLYING_REQUEUE))
        }
        UpgradeOutcome::Converged { applying: true, .. } => Ok(Action::requeue(APPLYING_REQUEUE)),
        _ => Ok(Action::requeue(ctx.settings.resync_period)),
    }
}

fn requeue_after(error: &Error) -> Duration {
    match error {
        Error::NodeTemplateSync(NodeTemplateSyncError::MissingCreator(_)) => PERMANENT_FAILURE_REQUEUE,
        _ => FAILURE_REQUEUE,
    }
}

fn node_template_error_policy(nt: Arc<NodeTemplate>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(name = nt.name_any(), namespace = nt.namespace(), "reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(NODE_TEMPLATE_CONTROLLER, error);
    Action::requeue(requeue_after(error))
}

fn cluster_error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(name = cluster.name_any(), "reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CLUSTER_CONTROLLER, error);
    Action::requeue(requeue_after(error))
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
    settings: Arc<Settings>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(settings: Settings) -> Result<Self> {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::new()?.register(&registry)?;

        Ok(Self {
            diagnostics: Default::default(),
            registry,
            metrics,
            settings: Arc::new(settings),
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context::new(
            client,
            self.settings.clone(),
            self.metrics.clone(),
            self.diagnostics.clone(),
        ))
    }
}

async fn ensure_queryable<K>(api: &Api<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("{} are not queryable; {e:?}. Is the CRD installed?", K::plural(&()));
        return Err(e.into());
    }
    Ok(())
}

/// Watches node templates in every namespace and migrates legacy ones.
pub async fn run_node_template_controller(ctx: Arc<Context>) -> Result<()> {
    let templates = Api::<NodeTemplate>::all(ctx.client.clone());
    ensure_queryable(&templates).await?;

    info!("Starting node template controller");
    Controller::new(templates, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_node_template, node_template_error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}

/// Watches management clusters and converges their downstream upgrade plans.
pub async fn run_cluster_controller(ctx: Arc<Context>) -> Result<()> {
    let clusters = Api::<Cluster>::all(ctx.client.clone());
    ensure_queryable(&clusters).await?;

    info!("Starting cluster controller");
    Controller::new(clusters, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_cluster, cluster_error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::{ResolveError, UpgradeSyncError};

    #[test]
    fn missing_creator_backs_off() {
        let missing = Error::from(NodeTemplateSyncError::MissingCreator("aws-template".into()));
        assert_eq!(requeue_after(&missing), PERMANENT_FAILURE_REQUEUE);

        let unreachable = Error::from(UpgradeSyncError::Resolve(ResolveError::ClusterNotFound(
            "c-abcde".into(),
        )));
        assert_eq!(requeue_after(&unreachable), FAILURE_REQUEUE);
        assert_eq!(requeue_after(&Error::Timeout(Duration::from_secs(60))), FAILURE_REQUEUE);
    }

    #[tokio::test]
    async fn state_registers_metrics_once() {
        use clap::Parser;

        let state = State::new(Settings::try_parse_from(["controller"]).unwrap()).unwrap();
        let other = state.clone();

        state.metrics.migrations.inc();
        let names: Vec<_> = other.metrics().iter().map(|m| m.get_name().to_string()).collect();
        assert!(names.contains(&"cattle_sync_migrations_total".to_string()));
        assert!(other.diagnostics().await.last_event <= Utc::now());
    }
}
