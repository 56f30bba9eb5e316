use crate::crd::{
    updates_allowed, Condition, Release, ReleaseObservation, ReleaseSpec, ReleaseState,
    ReleaseStatus, SecretReference, DEVEL_VERSION,
};
use crate::data::get_secret_data;
use crate::details::{connection_details, ConnectionDetails};
use crate::error::{Error, Result};
use crate::helm::{HelmClient, HelmRelease, RepoCreds};
use crate::k8sclient::{LocalClient, TargetClient};
use crate::patches::Patcher;
use crate::values::compose_values;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Patch;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::{json, Map, Value};

const HELM_NAMESPACE_LABEL: &str = "app.kubernetes.io/managed-by";
const HELM_PROVIDER_NAME: &str = "provider-helm";

const KEY_REPO_USERNAME: &str = "username";
const KEY_REPO_PASSWORD: &str = "password";

pub static NS: &str = "default";

/// What a reconcile observed about the external release. The controller
/// turns this into a create, update or no-op decision.
#[derive(Debug, Default)]
pub struct Observation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
    pub connection_details: ConnectionDetails,
}

/// Credentials for the target cluster, resolved from a ProviderConfig.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetCredentials {
    /// kubeconfig bytes read from the referenced secret
    Kubeconfig(Vec<u8>),
    /// the controller's own in-cluster identity
    InjectedIdentity,
}

pub fn control_namespace(cr: &Release) -> String {
    cr.namespace().unwrap_or_else(|| NS.to_owned())
}

/// Resolves the ProviderConfig referenced by a release into target cluster
/// credentials.
pub async fn resolve_provider_credentials(
    local: &impl LocalClient,
    cr: &Release,
) -> Result<TargetCredentials> {
    let config_ref = &cr.spec.provider_config_ref;
    if config_ref.name.is_empty() {
        return Err(Error::ProviderConfigNotSet);
    }

    let pc = local
        .get_provider_config(&config_ref.name)
        .await
        .map_err(Error::ProviderConfigNotRetrieved)?;

    match pc.spec.credentials.source {
        crate::crd::CredentialsSource::InjectedIdentity => Ok(TargetCredentials::InjectedIdentity),
        crate::crd::CredentialsSource::Secret => {
            let secret_ref = pc
                .spec
                .credentials
                .secret_ref
                .ok_or(Error::CredentialsSecretNotSet)?;
            let data = get_secret_data(local, &secret_ref.namespace, &secret_ref.name).await?;
            let kubeconfig = data
                .get(&secret_ref.key)
                .ok_or_else(|| Error::CredentialsKeyNotFound(secret_ref.key.clone()))?;
            Ok(TargetCredentials::Kubeconfig(kubeconfig.0.clone()))
        }
    }
}

fn generate_observation(rel: &HelmRelease) -> ReleaseObservation {
    match &rel.info {
        Some(info) => ReleaseObservation {
            state: info.status,
            release_description: info.description.clone(),
            revision: rel.version,
        },
        None => ReleaseObservation::default(),
    }
}

pub fn rollback_enabled(spec: &ReleaseSpec) -> bool {
    spec.rollback_retries_limit.is_some()
}

pub fn rollback_limit_reached(spec: &ReleaseSpec, status: &ReleaseStatus) -> bool {
    spec.rollback_retries_limit
        .map(|limit| status.failed >= limit)
        .unwrap_or(false)
}

pub fn should_roll_back(spec: &ReleaseSpec, status: &ReleaseStatus) -> bool {
    rollback_enabled(spec)
        && ((status.synced && status.at_provider.state == ReleaseState::Failed)
            || status.at_provider.state == ReleaseState::PendingInstall
            || status.at_provider.state == ReleaseState::PendingUpgrade)
}

/// Checks the desired spec against the observed release.
///
/// A pending release is never up to date and never an error. Corrupted
/// history (missing info, chart or chart metadata) surfaces as an error
/// instead of triggering a deploy.
pub async fn is_up_to_date(
    local: &impl LocalClient,
    patcher: &impl Patcher,
    spec: &ReleaseSpec,
    observed: &HelmRelease,
    status: &ReleaseStatus,
    source_namespace: &str,
    management_policies_enabled: bool,
) -> Result<bool> {
    let info = observed.info.as_ref().ok_or(Error::ReleaseInfoNil)?;
    if info.status.is_pending() {
        return Ok(false);
    }

    let observed_chart = observed
        .chart
        .as_ref()
        .ok_or(Error::ChartNilInObservedRelease)?;
    let observed_meta = observed_chart
        .metadata
        .as_ref()
        .ok_or(Error::ChartMetaNilInObservedRelease)?;

    if management_policies_enabled && !updates_allowed(&spec.management_policies) {
        // updates are disabled, whatever is deployed counts as current
        return Ok(true);
    }

    if spec.chart.name.as_deref().unwrap_or_default() != observed_meta.name {
        return Ok(false);
    }
    let desired_version = spec.chart.version.as_deref().unwrap_or_default();
    if desired_version != observed_meta.version && desired_version != DEVEL_VERSION {
        return Ok(false);
    }

    let desired_config = compose_values(local, spec, source_namespace).await?;
    let desired = serde_yaml::to_string(&desired_config)
        .map_err(|e| Error::UnmarshalValues(e.to_string()))?;

    // nil and empty config are the same deployed state
    let observed_config = observed
        .config
        .clone()
        .unwrap_or_else(|| Value::Object(Map::new()));
    let observed_rendered = serde_yaml::to_string(&observed_config)
        .map_err(|e| Error::UnmarshalValues(e.to_string()))?;

    if desired != observed_rendered {
        return Ok(false);
    }

    if patcher
        .has_updates(local, &spec.patches_from, status, source_namespace)
        .await?
    {
        return Ok(false);
    }

    Ok(true)
}

/// Observes the last Helm release and decides whether the external state
/// exists and matches the spec. Mutates the release status in place, the
/// caller persists it.
pub async fn observe(
    local: &impl LocalClient,
    target: &impl TargetClient,
    helm: &impl HelmClient,
    patcher: &impl Patcher,
    cr: &mut Release,
    management_policies_enabled: bool,
) -> Result<Observation> {
    let name = cr.name_any();

    let rel = match helm.get_last_release(&name).await {
        Err(Error::ReleaseNotFound) => {
            return Ok(Observation {
                resource_exists: false,
                ..Default::default()
            })
        }
        Err(e) => return Err(e),
        Ok(rel) => rel,
    };

    let mut status = cr.status.clone().unwrap_or_default();
    status.at_provider = generate_observation(&rel);
    status.observed_generation = cr.meta().generation;

    // Computing drift may read values from secrets and configmaps that are
    // already gone when the release is being deleted. Deletion does not need
    // the verdict, so skip it.
    if cr.meta().deletion_timestamp.is_some() {
        cr.status = Some(status);
        return Ok(Observation {
            resource_exists: true,
            ..Default::default()
        });
    }

    let source_namespace = control_namespace(cr);
    let synced = is_up_to_date(
        local,
        patcher,
        &cr.spec,
        &rel,
        &status,
        &source_namespace,
        management_policies_enabled,
    )
    .await?;
    status.synced = synced;

    let mut details = ConnectionDetails::new();
    if status.at_provider.state == ReleaseState::Deployed && synced {
        status.failed = 0;
        details = connection_details(target, &cr.spec.connection_details, &rel.name, &rel.namespace)
            .await?;
        status.set_condition(Condition::available());
    } else {
        status.set_condition(Condition::unavailable());
    }

    let resource_up_to_date =
        synced && !(should_roll_back(&cr.spec, &status) && !rollback_limit_reached(&cr.spec, &status));
    cr.status = Some(status);

    Ok(Observation {
        resource_exists: true,
        resource_up_to_date,
        connection_details: details,
    })
}

/// Reads chart pull credentials from the configured secret. The secret must
/// carry both the username and the password key when referenced.
pub async fn repo_creds_from_secret(
    local: &impl LocalClient,
    secret_ref: &Option<SecretReference>,
    release_namespace: &str,
) -> Result<RepoCreds> {
    let Some(secret_ref) = secret_ref.as_ref().filter(|r| !r.name.is_empty()) else {
        return Ok(RepoCreds::anonymous());
    };

    let namespace = secret_ref.namespace.as_deref().unwrap_or(release_namespace);
    let data = get_secret_data(local, namespace, &secret_ref.name)
        .await
        .map_err(|e| Error::GetPullSecret(Box::new(e)))?;

    let username = data
        .get(KEY_REPO_USERNAME)
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .filter(|v| !v.is_empty())
        .ok_or(Error::PullSecretMissingUsername)?;
    let password = data
        .get(KEY_REPO_PASSWORD)
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .filter(|v| !v.is_empty())
        .ok_or(Error::PullSecretMissingPassword)?;

    Ok(RepoCreds { username, password })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeployAction {
    Install,
    Upgrade,
}

async fn late_init_chart(
    local: &impl LocalClient,
    cr: &mut Release,
    resolved_name: &str,
    resolved_version: &str,
) -> Result<()> {
    let namespace = control_namespace(cr);
    let name = cr.name_any();

    if cr.spec.chart.name.as_deref().unwrap_or_default().is_empty() {
        cr.spec.chart.name = Some(resolved_name.to_owned());
        let patch = Patch::Merge(json!({"spec": {"chart": {"name": resolved_name}}}));
        local
            .patch_release_spec(&namespace, &name, &patch)
            .await
            .map_err(Error::FailedToSetName)?;
    }
    if cr.spec.chart.version.as_deref().unwrap_or_default().is_empty() {
        cr.spec.chart.version = Some(resolved_version.to_owned());
        let patch = Patch::Merge(json!({"spec": {"chart": {"version": resolved_version}}}));
        local
            .patch_release_spec(&namespace, &name, &patch)
            .await
            .map_err(Error::FailedToSetVersion)?;
    }
    Ok(())
}

/// Runs one deploy: compose values, load patches, pull the chart, late
/// initialize the chart spec, then install or upgrade.
pub async fn deploy(
    local: &impl LocalClient,
    helm: &impl HelmClient,
    patcher: &impl Patcher,
    cr: &mut Release,
    action: DeployAction,
) -> Result<()> {
    let source_namespace = control_namespace(cr);

    let values = compose_values(local, &cr.spec, &source_namespace).await?;
    let creds =
        repo_creds_from_secret(local, &cr.spec.chart.pull_secret_ref, &source_namespace).await?;
    let patches = patcher
        .get_from_spec(local, &cr.spec.patches_from, &source_namespace)
        .await?;

    let chart = helm.pull_and_load_chart(&cr.spec.chart, &creds).await?;
    late_init_chart(local, cr, &chart.metadata.name, &chart.metadata.version).await?;

    let name = cr.name_any();
    let rel = match action {
        DeployAction::Install => helm.install(&name, &chart, &values, &patches).await?,
        DeployAction::Upgrade => helm.upgrade(&name, &chart, &values, &patches).await?,
    };

    let mut status = cr.status.clone().unwrap_or_default();
    status.patches_sha = patcher.sha_of(&patches)?;
    status.at_provider = generate_observation(&rel);
    cr.status = Some(status);

    Ok(())
}

/// Creates the external release, ensuring the target namespace first unless
/// the spec opts out.
pub async fn create(
    local: &impl LocalClient,
    target: &impl TargetClient,
    helm: &impl HelmClient,
    patcher: &impl Patcher,
    cr: &mut Release,
) -> Result<()> {
    if !cr.spec.skip_create_namespace {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(cr.spec.namespace.clone()),
                labels: Some(
                    [(HELM_NAMESPACE_LABEL.to_owned(), HELM_PROVIDER_NAME.to_owned())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Err(e) = target.create_namespace(&namespace).await {
            if !Error::is_already_exists(&e) {
                return Err(Error::CreateNamespace(e));
            }
        }
    }

    deploy(local, helm, patcher, cr, DeployAction::Install).await
}

/// Converges a drifted release: either the rollback retry path for a failed
/// deploy, or a regular upgrade.
pub async fn update(
    local: &impl LocalClient,
    helm: &impl HelmClient,
    patcher: &impl Patcher,
    cr: &mut Release,
) -> Result<()> {
    let mut status = cr.status.clone().unwrap_or_default();

    if should_roll_back(&cr.spec, &status) {
        tracing::debug!("last deploy failed");
        if rollback_limit_reached(&cr.spec, &status) {
            tracing::debug!("reached max rollback retries, will not retry");
            return Ok(());
        }

        status.failed += 1;
        let revision = status.at_provider.revision;
        cr.status = Some(status);
        let name = cr.name_any();
        // the first revision has nothing to roll back to, uninstall instead
        if revision == 1 {
            tracing::debug!("uninstalling first revision to retry");
            return helm.uninstall(&name).await;
        }
        tracing::debug!("rolling back to previous revision to retry");
        return helm.rollback(&name).await;
    }

    deploy(local, helm, patcher, cr, DeployAction::Upgrade).await
}

/// Uninstalls the external release. A release that is already gone makes the
/// second delete a no-op.
pub async fn delete(helm: &impl HelmClient, cr: &Release) -> Result<()> {
    match helm.uninstall(&cr.name_any()).await {
        Err(Error::ReleaseNotFound) => Ok(()),
        other => other,
    }
}
