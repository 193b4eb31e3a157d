use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config, ResourceExt,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{api::plan::Plan, store::{KubeStore, ObjectStore}};

use super::{ResolveError, ResolveResult};

/// Key holding the kubeconfig document in a cluster secret.
pub static KUBECONFIG_KEY: &str = "value";

/// Gives access to the objects of a downstream cluster.
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    type Store: ObjectStore<Plan>;

    async fn resolve(&self, cluster_id: &str) -> ResolveResult<Self::Store>;
}

/// Builds downstream clients from `<cluster>-kubeconfig` secrets.
///
/// Clients are reused until the secret's resource version changes.
#[derive(Clone)]
pub struct KubeconfigSecretResolver {
    client: Client,
    namespace: String,
    cache: Arc<RwLock<HashMap<String, (String, KubeStore)>>>,
}

impl KubeconfigSecretResolver {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            cache: Default::default(),
        }
    }

    fn secret_name(cluster_id: &str) -> String {
        format!("{cluster_id}-kubeconfig")
    }

    /// Picks the store for `cluster_id` given its current secret.
    ///
    /// A missing secret drops the cached client. A changed resource version
    /// rebuilds it.
    async fn store_for(&self, cluster_id: &str, secret: Option<Secret>) -> ResolveResult<KubeStore> {
        let Some(secret) = secret else {
            if self.cache.write().await.remove(cluster_id).is_some() {
                debug!(cluster_id, "Dropped downstream client");
            }
            return Err(ResolveError::ClusterNotFound(cluster_id.to_string()));
        };
        let version = secret.resource_version().unwrap_or_default();

        if let Some((cached, store)) = self.cache.read().await.get(cluster_id) {
            if *cached == version {
                debug!(cluster_id, "Reusing downstream client");
                return Ok(store.clone());
            }
        }

        let store = connect(cluster_id, &secret).await?;
        self.cache
            .write()
            .await
            .insert(cluster_id.to_string(), (version, store.clone()));
        Ok(store)
    }
}

/// Parses the kubeconfig stored under [`KUBECONFIG_KEY`].
pub(crate) fn kubeconfig_of(cluster_id: &str, secret: &Secret) -> ResolveResult<Kubeconfig> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_KEY))
        .ok_or_else(|| ResolveError::MissingKubeconfig(cluster_id.to_string()))?;

    Ok(Kubeconfig::from_yaml(&String::from_utf8_lossy(&raw.0))?)
}

async fn connect(cluster_id: &str, secret: &Secret) -> ResolveResult<KubeStore> {
    let kubeconfig = kubeconfig_of(cluster_id, secret)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    let client = Client::try_from(config).map_err(ResolveError::Client)?;

    info!(cluster_id, "Connected to downstream cluster");
    Ok(KubeStore::new(client))
}

#[async_trait]
impl ClusterResolver for KubeconfigSecretResolver {
    type Store = KubeStore;

    async fn resolve(&self, cluster_id: &str) -> ResolveResult<KubeStore> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = secrets
            .get_opt(&Self::secret_name(cluster_id))
            .await
            .map_err(ResolveError::SecretLookup)?;

        self.store_for(cluster_id, secret).await
    }
}
