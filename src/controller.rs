use crate::config::Config;
use crate::crd::{Condition, Release, DEFAULT_WAIT_TIMEOUT};
use crate::error::{Error, Result};
use crate::helm::{HelmArgs, HelmCli};
use crate::k8sclient::{LocalClient, LocalClientImpl, TargetClientImpl};
use crate::metrics::{
    l, NUM_CLEANUPS_FAILED, NUM_CLEANUPS_STARTED, NUM_RECONCILES_FAILED, NUM_RECONCILES_STARTED,
};
use crate::patches::KustomizePatcher;
use crate::reconciler::{self, Observation, TargetCredentials, NS};
use crate::store::{backoff_for, FailureStoreRef, NamespacedName};
use crate::tracker;
use crate::util::map_finalizer_error;
use futures::StreamExt;
use kube::api::Patch;
use kube::config::KubeConfigOptions;
use kube::runtime::finalizer::Event as Finalizer;
use kube::runtime::{
    controller::{self, Action, Controller},
    finalizer, watcher,
};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tokio::time;
use tokio_stream::wrappers::IntervalStream;

static FINALIZER: &str = "helm.controlplane.dev/release-protection";

pub async fn run(client: Client, config: Config, failures: FailureStoreRef) {
    let context = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
        failures,
    });
    let api = Api::<Release>::all(client);

    let resync = IntervalStream::new(time::interval(config.sync)).map(|_| ());

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.max_reconcile_rate))
        .reconcile_all_on(resync)
        .shutdown_on_signal()
        .run(reconcile_with_finalizer, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok(_) => (),
                Err(e) => tracing::warn!("reconcile failed: {:?}", e),
            }
        })
        .await;
}

// Context for the reconciler
pub struct Context {
    pub client: Client,
    pub config: Config,
    pub failures: FailureStoreRef,
}

async fn reconcile_with_finalizer(obj: Arc<Release>, ctx: Arc<Context>) -> Result<Action> {
    let ns = obj.namespace().unwrap_or_else(|| NS.to_owned());
    let api: Api<Release> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, FINALIZER, obj, |event| async {
        match event {
            Finalizer::Apply(obj) => {
                let labels = l(&obj);
                NUM_RECONCILES_STARTED.get_or_create(&labels).inc();
                let result = match time::timeout(ctx.config.timeout, reconcile(&obj, ctx.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::ReconcileTimeout),
                };
                if result.is_err() {
                    NUM_RECONCILES_FAILED.get_or_create(&labels).inc();
                }
                result
            }
            Finalizer::Cleanup(obj) => {
                let labels = l(&obj);
                NUM_CLEANUPS_STARTED.get_or_create(&labels).inc();
                let result =
                    match time::timeout(ctx.config.timeout, cleanup(&obj, ctx.clone())).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::ReconcileTimeout),
                    };
                if result.is_err() {
                    NUM_CLEANUPS_FAILED.get_or_create(&labels).inc();
                }
                result
            }
        }
    })
    .await
    .map_err(map_finalizer_error)
}

/// Builds the target cluster client and the Helm gateway out of resolved
/// provider credentials. The gateway is bound to the release's target
/// namespace and deployment options.
async fn connect_target(
    creds: &TargetCredentials,
    cr: &Release,
    config: &Config,
) -> Result<(TargetClientImpl, HelmCli)> {
    let (kube_config, kubeconfig_bytes) = match creds {
        TargetCredentials::Kubeconfig(bytes) => {
            let parsed = kube::config::Kubeconfig::from_yaml(&String::from_utf8_lossy(bytes))
                .map_err(|e| Error::InvalidKubeconfig(e.to_string()))?;
            let kube_config =
                kube::Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::InvalidKubeconfig(e.to_string()))?;
            (kube_config, Some(bytes.as_slice()))
        }
        TargetCredentials::InjectedIdentity => {
            let kube_config =
                kube::Config::incluster().map_err(|e| Error::KubeClientBuild(e.to_string()))?;
            (kube_config, None)
        }
    };

    let target_client =
        Client::try_from(kube_config).map_err(|e| Error::KubeClientBuild(e.to_string()))?;

    let wait_timeout_raw = cr
        .spec
        .wait_timeout
        .clone()
        .unwrap_or_else(|| DEFAULT_WAIT_TIMEOUT.to_owned());
    let wait_timeout = parse_duration::parse(&wait_timeout_raw)
        .map_err(|_| Error::InvalidDuration(wait_timeout_raw))?;

    let helm = HelmCli::new(
        target_client.clone(),
        kubeconfig_bytes,
        HelmArgs {
            namespace: cr.spec.namespace.clone(),
            wait: cr.spec.wait,
            wait_timeout,
            skip_crds: cr.spec.skip_crds,
            insecure_skip_tls_verify: cr.spec.insecure_skip_tls_verify,
            command_timeout: config.timeout,
        },
    )
    .map_err(|e| Error::HelmClientBuild(e.to_string()))?;

    Ok((TargetClientImpl::new(target_client), helm))
}

async fn reconcile(obj: &Arc<Release>, ctx: Arc<Context>) -> Result<Action> {
    let name = obj.name_any();
    let ns = obj.namespace().unwrap_or_else(|| NS.to_owned());
    tracing::info!("Starting reconcile of release {name} in namespace {ns}");

    let mut cr = (**obj).clone();
    let local = LocalClientImpl::new(ctx.client.clone());
    let patcher = KustomizePatcher;

    let result = converge(&local, &patcher, &mut cr, &ctx).await;

    // the verdict of this cycle is recorded even when it failed
    let mut status = cr.status.clone().unwrap_or_default();
    match &result {
        Ok(_) => status.set_condition(Condition::synced()),
        Err(e) => status.set_condition(Condition::sync_failed(e.to_string())),
    }
    cr.status = Some(status);
    update_status(&local, &cr).await?;

    let details = result?;
    if !details.is_empty() {
        let secret_name = format!("{name}-connection-details");
        local.apply_secret(&ns, &secret_name, &details).await?;
    }

    ctx.failures.reset(&NamespacedName::from(&cr));
    tracing::info!("Finished reconcile of release {name} in namespace {ns}");
    Ok(Action::requeue(ctx.config.poll))
}

/// Observe once, then create or converge. Returns the connection details of
/// an up-to-date release.
async fn converge(
    local: &LocalClientImpl,
    patcher: &KustomizePatcher,
    cr: &mut Release,
    ctx: &Context,
) -> Result<crate::details::ConnectionDetails> {
    let creds = reconciler::resolve_provider_credentials(local, cr).await?;
    tracker::track(local, cr).await;
    let (target, helm) = connect_target(&creds, cr, &ctx.config).await?;

    let Observation {
        resource_exists,
        resource_up_to_date,
        connection_details,
    } = reconciler::observe(
        local,
        &target,
        &helm,
        patcher,
        cr,
        ctx.config.enable_management_policies,
    )
    .await?;

    if !resource_exists {
        record_change(ctx, cr, "create");
        crate::metrics::NUM_DEPLOYS.get_or_create(&l(cr)).inc();
        reconciler::create(local, &target, &helm, patcher, cr).await?;
        return Ok(Default::default());
    }

    if !resource_up_to_date {
        record_change(ctx, cr, "update");
        let status = cr.status.clone().unwrap_or_default();
        if reconciler::should_roll_back(&cr.spec, &status) {
            crate::metrics::NUM_ROLLBACKS.get_or_create(&l(cr)).inc();
        } else {
            crate::metrics::NUM_DEPLOYS.get_or_create(&l(cr)).inc();
        }
        reconciler::update(local, &helm, patcher, cr).await?;
        return Ok(Default::default());
    }

    Ok(connection_details)
}

async fn cleanup(obj: &Arc<Release>, ctx: Arc<Context>) -> Result<Action> {
    let name = obj.name_any();
    let ns = obj.namespace().unwrap_or_else(|| NS.to_owned());
    tracing::info!("Starting cleanup of release {name} in namespace {ns}");

    let mut cr = (**obj).clone();
    let local = LocalClientImpl::new(ctx.client.clone());

    let creds = match reconciler::resolve_provider_credentials(&local, &cr).await {
        Ok(creds) => creds,
        Err(Error::ProviderConfigNotRetrieved(e)) if Error::is_not_found(&e) => {
            // the credentials are already gone, nothing left to uninstall with
            tracing::warn!("Could not cleanup release {name} because its provider config is missing");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    let (_, helm) = connect_target(&creds, &mut cr, &ctx.config).await?;

    record_change(&ctx, &cr, "delete");
    reconciler::delete(&helm, &cr).await?;

    ctx.failures.reset(&NamespacedName::from(&cr));
    tracing::info!("Finished cleanup of release {name} in namespace {ns}");
    Ok(Action::await_change())
}

async fn update_status(local: &impl LocalClient, cr: &Release) -> Result<()> {
    let Some(status) = &cr.status else {
        return Ok(());
    };
    let patch = Patch::Apply(json!({
        "apiVersion": Release::api_version(&()),
        "kind": Release::kind(&()),
        "status": status,
    }));
    let name = cr.name_any();
    let ns = cr.namespace().unwrap_or_else(|| NS.to_owned());
    local.patch_release_status(&ns, &name, &patch).await?;
    Ok(())
}

fn record_change(ctx: &Context, cr: &Release, verb: &str) {
    if !ctx.config.enable_changelogs {
        return;
    }
    tracing::info!(
        target: "changelog",
        socket = %ctx.config.changelogs_socket_path,
        release = %cr.name_any(),
        namespace = %cr.namespace().unwrap_or_else(|| NS.to_owned()),
        chart = %cr.spec.chart.name.as_deref().unwrap_or_default(),
        version = %cr.spec.chart.version.as_deref().unwrap_or_default(),
        "{verb}"
    );
}

fn error_policy(obj: Arc<Release>, error: &Error, ctx: Arc<Context>) -> Action {
    let attempts = ctx.failures.bump(&NamespacedName::from(&obj));
    let delay = backoff_for(attempts);
    tracing::warn!(
        "Reconcile of release {} failed (attempt {attempts}, next in {delay:?}): {error}",
        obj.name_any()
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_requeue_backoff_sequence() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(3), Duration::from_secs(4));
        assert!(backoff_for(20) <= Duration::from_secs(300));
    }
}
