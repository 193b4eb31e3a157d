use std::{future::Future, sync::Arc};

use kube::{
    client::Client,
    runtime::events::{Event, EventType},
    Resource, ResourceExt,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Settings;
use crate::metrics::Diagnostics;
use crate::store::KubeStore;
use crate::{Error, Metrics};

use super::cluster_context::KubeconfigSecretResolver;
use super::node_template::NodeTemplateReconciler;
use super::upgrade::UpgradeOrchestrator;

// Context for the reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prom metrics
    pub metrics: Metrics,
    pub settings: Arc<Settings>,
    pub node_templates: Arc<NodeTemplateReconciler<KubeStore>>,
    pub upgrades: Arc<UpgradeOrchestrator<KubeStore, KubeconfigSecretResolver>>,
}

impl Context {
    pub fn new(
        client: Client,
        settings: Arc<Settings>,
        metrics: Metrics,
        diagnostics: Arc<RwLock<Diagnostics>>,
    ) -> Self {
        let store = KubeStore::new(client.clone());
        let resolver = KubeconfigSecretResolver::new(client.clone(), &settings.kubeconfig_namespace);

        Self {
            node_templates: Arc::new(NodeTemplateReconciler::new(
                store.clone(),
                &settings.global_namespace,
            )),
            upgrades: Arc::new(UpgradeOrchestrator::new(store, resolver, settings.upgrade())),
            client,
            diagnostics,
            metrics,
            settings,
        }
    }

    /// Runs one reconcile pass, giving up after the configured sync timeout.
    pub(crate) async fn bounded<T, F>(&self, pass: F) -> crate::Result<T>
    where
        F: Future<Output = crate::Result<T>>,
    {
        let limit = self.settings.sync_timeout;
        tokio::time::timeout(limit, pass)
            .await
            .map_err(|_| Error::Timeout(limit))?
    }

    pub(crate) async fn publish<K>(&self, obj: &K, event: Event) -> crate::Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        debug!(name = obj.name_any(), reason = %event.reason, "Publishing event");
        self.diagnostics
            .read()
            .await
            .recorder(self.client.clone())
            .publish(&event, &obj.object_ref(&()))
            .await?;
        Ok(())
    }

    pub(crate) async fn warn<K>(&self, obj: &K, reason: &str, note: String) -> crate::Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(
            obj,
            Event {
                type_: EventType::Warning,
                reason: reason.into(),
                note: Some(note),
                action: "Reconciling".into(),
                secondary: None,
            },
        )
        .await
    }
}
