use crate::crd::{ProviderConfigUsageSpec, Release, ReleaseReference};
use crate::k8sclient::LocalClient;
use crate::reconciler::control_namespace;
use kube::ResourceExt;

/// Records the Release -> ProviderConfig edge. The edges form an append-only
/// set consulted before a ProviderConfig is garbage collected; failures to
/// write one never fail the reconcile.
pub async fn track(local: &impl LocalClient, cr: &Release) {
    let namespace = control_namespace(cr);
    let name = cr.name_any();
    let spec = ProviderConfigUsageSpec {
        provider_config_ref: cr.spec.provider_config_ref.clone(),
        release_ref: ReleaseReference {
            namespace: namespace.clone(),
            name: name.clone(),
        },
    };

    let usage_name = usage_name(&namespace, &name);
    if let Err(e) = local.apply_usage(&usage_name, &spec).await {
        tracing::warn!("could not track provider config usage for {namespace}/{name}: {e}");
    }
}

fn usage_name(namespace: &str, name: &str) -> String {
    format!("{namespace}.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ProviderConfigReference, ReleaseSpec};
    use crate::data::tests::not_found;
    use crate::k8sclient::MockLocalClient;

    fn release() -> Release {
        let mut cr = Release::new(
            "wordpress",
            ReleaseSpec {
                provider_config_ref: ProviderConfigReference {
                    name: "cluster-a".to_owned(),
                },
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("default".to_owned());
        cr
    }

    #[tokio::test]
    async fn test_track_applies_usage_edge() {
        let mut local = MockLocalClient::new();
        local
            .expect_apply_usage()
            .withf(|name, spec| {
                name == "default.wordpress"
                    && spec.provider_config_ref.name == "cluster-a"
                    && spec.release_ref.name == "wordpress"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        track(&local, &release()).await;
    }

    #[tokio::test]
    async fn test_track_swallows_write_failures() {
        let mut local = MockLocalClient::new();
        local
            .expect_apply_usage()
            .returning(|_, _| Err(not_found()));
        track(&local, &release()).await;
    }
}
