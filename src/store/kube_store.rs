use async_trait::async_trait;
use kube::{
    api::{GetParams, ListParams, ObjectList, PostParams},
    core::Request,
    Client, ResourceExt,
};
use tracing::debug;

use super::{ObjectStore, StoreError, StoreObject, StoreResult};

/// [`ObjectStore`] backed by a Kubernetes API server.
///
/// Requests are built from the resource URL path, so the same store serves
/// namespaced and cluster scoped kinds.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn send<K, T>(
        &self,
        name: &str,
        request: Result<http::Request<Vec<u8>>, kube::core::request::Error>,
    ) -> StoreResult<T>
    where
        K: StoreObject,
        T: serde::de::DeserializeOwned,
    {
        let request = request
            .map_err(kube::Error::BuildRequest)
            .map_err(StoreError::Request)?;

        self.client
            .request::<T>(request)
            .await
            .map_err(|e| StoreError::classify(&K::kind(&()), name, e))
    }
}

fn request<K: StoreObject>(namespace: Option<&str>) -> Request {
    Request::new(K::url_path(&(), namespace))
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for KubeStore {
    async fn get(&self, namespace: Option<&str>, name: &str) -> StoreResult<K> {
        let req = request::<K>(namespace).get(name, &GetParams::default());
        self.send::<K, K>(name, req).await
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> StoreResult<Vec<K>> {
        let params = ListParams {
            label_selector: label_selector.map(String::from),
            ..Default::default()
        };
        let req = request::<K>(namespace).list(&params);
        let list: ObjectList<K> = self.send::<K, _>("*", req).await?;

        debug!(kind = %K::kind(&()), count = list.items.len(), "Listed objects");
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let name = obj.name_any();
        let req = request::<K>(obj.namespace().as_deref())
            .create(&PostParams::default(), serde_json::to_vec(obj)?);
        self.send::<K, K>(&name, req).await
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let name = obj.name_any();
        let req = request::<K>(obj.namespace().as_deref()).replace(
            &name,
            &PostParams::default(),
            serde_json::to_vec(obj)?,
        );
        self.send::<K, K>(&name, req).await
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let name = obj.name_any();
        let req = request::<K>(obj.namespace().as_deref()).replace_subresource(
            "status",
            &name,
            &PostParams::default(),
            serde_json::to_vec(obj)?,
        );
        self.send::<K, K>(&name, req).await
    }
}
