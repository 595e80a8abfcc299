use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, PostParams};
use kube::discovery::ApiResource;
use kube::Client;

use crate::resource::Resource;

/// Thin seam over the dynamic client so the executor can be exercised
/// without a cluster. One method per verb the executor needs.
#[async_trait]
pub trait DynamicApi: Send + Sync {
    async fn create(
        &self,
        namespace: &str,
        resource: &Resource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    async fn replace(
        &self,
        namespace: &str,
        resource: &Resource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    async fn get(
        &self,
        namespace: &str,
        resource: &Resource,
        name: &str,
    ) -> Result<DynamicObject, kube::Error>;

    async fn delete(
        &self,
        namespace: &str,
        resource: &Resource,
        name: &str,
    ) -> Result<(), kube::Error>;
}

/// Production implementation over `kube::Client`
pub struct KubeDynamicApi {
    client: Client,
}

impl KubeDynamicApi {
    pub fn new(client: Client) -> Self {
        KubeDynamicApi { client }
    }

    fn api(&self, namespace: &str, resource: &Resource) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(
            &resource.identifier.group,
            &resource.identifier.version,
            &resource.identifier.kind,
        );
        let ar = ApiResource::from_gvk_with_plural(&gvk, &resource.resource_name);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

#[async_trait]
impl DynamicApi for KubeDynamicApi {
    async fn create(
        &self,
        namespace: &str,
        resource: &Resource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(namespace, resource)
            .create(&PostParams::default(), obj)
            .await
    }

    async fn replace(
        &self,
        namespace: &str,
        resource: &Resource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(namespace, resource)
            .replace(&name, &PostParams::default(), obj)
            .await
    }

    async fn get(
        &self,
        namespace: &str,
        resource: &Resource,
        name: &str,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(namespace, resource).get(name).await
    }

    async fn delete(
        &self,
        namespace: &str,
        resource: &Resource,
        name: &str,
    ) -> Result<(), kube::Error> {
        self.api(namespace, resource)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}
