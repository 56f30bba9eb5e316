use crate::crd::{ProviderConfig, ProviderConfigUsage, ProviderConfigUsageSpec, Release};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, Resource};
use kube::client::Client;
use kube::Api;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

const PATCH_OWNER: &str = "helm-release-controller";

/// Reads and writes against the control plane cluster the controller runs in.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalClient: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error>;
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, kube::Error>;
    async fn get_provider_config(&self, name: &str) -> Result<ProviderConfig, kube::Error>;
    async fn patch_release_spec(
        &self,
        namespace: &str,
        name: &str,
        patch: &Patch<Value>,
    ) -> Result<(), kube::Error>;
    async fn patch_release_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Patch<Value>,
    ) -> Result<(), kube::Error>;
    async fn apply_usage(
        &self,
        name: &str,
        spec: &ProviderConfigUsageSpec,
    ) -> Result<(), kube::Error>;
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &HashMap<String, Vec<u8>>,
    ) -> Result<(), kube::Error>;
}

/// Reads and writes against the external cluster a release is deployed to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetClient: Send + Sync {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), kube::Error>;
    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, kube::Error>;
}

#[derive(Clone)]
pub struct LocalClientImpl {
    client: Client,
}

impl LocalClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LocalClient for LocalClientImpl {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, kube::Error> {
        let api = Api::<ConfigMap>::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }

    async fn get_provider_config(&self, name: &str) -> Result<ProviderConfig, kube::Error> {
        let api = Api::<ProviderConfig>::all(self.client.clone());
        api.get(name).await
    }

    async fn patch_release_spec(
        &self,
        namespace: &str,
        name: &str,
        patch: &Patch<Value>,
    ) -> Result<(), kube::Error> {
        let api = Api::<Release>::namespaced(self.client.clone(), namespace);
        let ps = PatchParams::default();
        api.patch(name, &ps, patch).await?;
        Ok(())
    }

    async fn patch_release_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Patch<Value>,
    ) -> Result<(), kube::Error> {
        let api = Api::<Release>::namespaced(self.client.clone(), namespace);
        let ps = PatchParams::apply(PATCH_OWNER).force();
        api.patch_status(name, &ps, patch).await?;
        Ok(())
    }

    async fn apply_usage(
        &self,
        name: &str,
        spec: &ProviderConfigUsageSpec,
    ) -> Result<(), kube::Error> {
        let api = Api::<ProviderConfigUsage>::all(self.client.clone());
        let ps = PatchParams::apply(PATCH_OWNER).force();
        let usage = Patch::Apply(json!({
            "apiVersion": ProviderConfigUsage::api_version(&()),
            "kind": ProviderConfigUsage::kind(&()),
            "metadata": {
                "name": name,
                "labels": {
                    "helm.controlplane.dev/provider-config": spec.provider_config_ref.name,
                },
            },
            "spec": spec,
        }));
        api.patch(name, &ps, &usage).await?;
        Ok(())
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &HashMap<String, Vec<u8>>,
    ) -> Result<(), kube::Error> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let ps = PatchParams::apply(PATCH_OWNER).force();
        let encoded: BTreeMap<&str, k8s_openapi::ByteString> = data
            .iter()
            .map(|(k, v)| (k.as_str(), k8s_openapi::ByteString(v.clone())))
            .collect();
        let secret = Patch::Apply(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": name},
            "data": encoded,
        }));
        api.patch(name, &ps, &secret).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct TargetClientImpl {
    client: Client,
}

impl TargetClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetClient for TargetClientImpl {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), kube::Error> {
        let api = Api::<Namespace>::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, kube::Error> {
        let gvk = match api_version.split_once('/') {
            Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
            None => GroupVersionKind::gvk("", api_version, kind),
        };
        let resource = ApiResource::from_gvk(&gvk);
        let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, &resource);
        api.get(name).await
    }
}
