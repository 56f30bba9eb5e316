use chrono::prelude::*;
use kube::CustomResource;
use schemars::JsonSchema;
use serde_derive::{Deserialize, Serialize};

/// Version constraint that pins a chart to whatever the repository currently
/// serves, including pre-releases. Drift detection must not flag a version
/// mismatch for releases pinned to it.
pub const DEVEL_VERSION: &str = ">0.0.0-0";

/// Default duration Helm waits for a release to become ready.
pub const DEFAULT_WAIT_TIMEOUT: &str = "5m";

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[kube(
    group = "helm.controlplane.dev",
    version = "v1beta1",
    kind = "Release",
    namespaced
)]
#[kube(status = "ReleaseStatus")]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"name":"Chart", "type":"string", "jsonPath":".spec.chart.name"}"#)]
#[kube(printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.chart.version"}"#)]
#[kube(printcolumn = r#"{"name":"Synced", "type":"boolean", "jsonPath":".status.synced"}"#)]
#[kube(printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.atProvider.state"}"#)]
#[kube(printcolumn = r#"{"name":"Revision", "type":"integer", "jsonPath":".status.atProvider.revision"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    /// chart to deploy
    pub chart: ChartSpec,
    /// namespace on the target cluster to install the release into
    pub namespace: String,
    /// do not create the target namespace, it must already exist
    #[serde(default)]
    pub skip_create_namespace: bool,
    /// skip installation of CRDs bundled with the chart
    #[serde(default)]
    pub skip_crds: bool,
    /// skip tls certificate checks for the chart download
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// wait for the release to become ready
    #[serde(default)]
    pub wait: bool,
    /// how long Helm waits for the release to become ready, defaults to 5m
    pub wait_timeout: Option<String>,
    /// inline Helm values
    pub values: Option<serde_json::Value>,
    /// Helm values read from secrets or configmaps, merged in order
    #[serde(default)]
    pub values_from: Vec<ValueFromSource>,
    /// scalar overrides applied with Helm --set path syntax, in order
    #[serde(default)]
    pub set: Vec<SetVal>,
    /// kustomize-style patches applied to the rendered manifests
    #[serde(default)]
    pub patches_from: Vec<ValueFromSource>,
    /// values to extract from target cluster objects after a deploy
    #[serde(default)]
    pub connection_details: Vec<ConnectionDetail>,
    /// when set, a failed deploy is retried by rolling back, at most this many times
    pub rollback_retries_limit: Option<i32>,
    /// reference to the ProviderConfig carrying target cluster credentials
    pub provider_config_ref: ProviderConfigReference,
    /// which operations the controller may perform on this release
    #[serde(default = "default_management_policies")]
    pub management_policies: Vec<ManagementPolicy>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Helm repository URL, required if url is not set
    pub repository: Option<String>,
    /// chart name, required if url is not set
    pub name: Option<String>,
    /// chart version, late initialized with the resolved version if not set
    pub version: Option<String>,
    /// direct URL to a chart package, overrides repository and name
    pub url: Option<String>,
    /// reference to a secret with credentials for the chart repository
    pub pull_secret_ref: Option<SecretReference>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataKeySelector {
    pub name: String,
    /// defaults to the namespace of the Release
    pub namespace: Option<String>,
    /// defaults to a source specific key
    pub key: Option<String>,
    /// a missing object or key yields an empty value instead of an error
    #[serde(default)]
    pub optional: bool,
}

/// Source of a value, exactly one of the refs must be set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValueFromSource {
    pub config_map_key_ref: Option<DataKeySelector>,
    pub secret_key_ref: Option<DataKeySelector>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SetVal {
    /// Helm --set path, e.g. a.b[0].c
    pub name: String,
    pub value: Option<String>,
    pub value_from: Option<ValueFromSource>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetail {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    /// path into the object's JSON representation, e.g. data.password
    pub field_path: String,
    pub to_connection_secret_key: String,
    /// skip the check for the meta.helm.sh/release-name annotation
    #[serde(default)]
    pub skip_part_of_release_check: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigReference {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum ManagementPolicy {
    #[serde(rename = "*")]
    All,
    Observe,
    Create,
    Update,
    Delete,
    LateInitialize,
}

fn default_management_policies() -> Vec<ManagementPolicy> {
    vec![ManagementPolicy::All]
}

/// True when the given policies permit updating the external release.
pub fn updates_allowed(policies: &[ManagementPolicy]) -> bool {
    policies
        .iter()
        .any(|p| matches!(p, ManagementPolicy::All | ManagementPolicy::Update))
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStatus {
    #[serde(default)]
    pub at_provider: ReleaseObservation,
    /// hex digest of the last successfully applied patch set
    #[serde(default)]
    pub patches_sha: String,
    /// number of rollback attempts since the last successful deploy
    #[serde(default)]
    pub failed: i32,
    /// verdict of the last drift check
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseObservation {
    #[serde(default)]
    pub state: ReleaseState,
    #[serde(default)]
    pub release_description: String,
    #[serde(default)]
    pub revision: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseState {
    Deployed,
    Failed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Superseded,
    Uninstalled,
    Uninstalling,
    #[default]
    Unknown,
}

impl ReleaseState {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseState::PendingInstall | ReleaseState::PendingUpgrade | ReleaseState::PendingRollback
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    pub message: Option<String>,
    pub last_transition_time: String,
}

impl Condition {
    fn new(r#type: &str, status: bool, reason: &str, message: Option<String>) -> Self {
        Condition {
            r#type: r#type.to_owned(),
            status: if status { "True" } else { "False" }.to_owned(),
            reason: reason.to_owned(),
            message,
            last_transition_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn available() -> Self {
        Condition::new("Ready", true, "Available", None)
    }

    pub fn unavailable() -> Self {
        Condition::new("Ready", false, "Unavailable", None)
    }

    pub fn synced() -> Self {
        Condition::new("Synced", true, "ReconcileSuccess", None)
    }

    pub fn sync_failed(message: String) -> Self {
        Condition::new("Synced", false, "ReconcileError", Some(message))
    }
}

impl ReleaseStatus {
    /// Replaces the condition of the same type, keeping the previous
    /// transition time when nothing changed.
    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
            if existing.status == condition.status && existing.reason == condition.reason {
                existing.message = condition.message;
                return;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[kube(
    group = "helm.controlplane.dev",
    version = "v1beta1",
    kind = "ProviderConfig"
)]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    pub credentials: ProviderCredentials,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    pub source: CredentialsSource,
    /// secret holding a kubeconfig for the target cluster
    pub secret_ref: Option<CredentialsSecretRef>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
pub enum CredentialsSource {
    /// kubeconfig read from a secret on the control plane
    #[default]
    Secret,
    /// service account the controller itself runs with
    InjectedIdentity,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSecretRef {
    pub name: String,
    pub namespace: String,
    #[serde(default = "default_kubeconfig_key")]
    pub key: String,
}

fn default_kubeconfig_key() -> String {
    "kubeconfig".to_owned()
}

/// Records that a Release consumes a ProviderConfig. The edges are consulted
/// before a ProviderConfig is garbage collected.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[kube(
    group = "helm.controlplane.dev",
    version = "v1beta1",
    kind = "ProviderConfigUsage"
)]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigUsageSpec {
    pub provider_config_ref: ProviderConfigReference,
    pub release_ref: ReleaseReference,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReference {
    pub namespace: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&ReleaseState::PendingInstall).unwrap(),
            "\"pending-install\""
        );
        let s: ReleaseState = serde_json::from_str("\"deployed\"").unwrap();
        assert_eq!(s, ReleaseState::Deployed);
        assert!(ReleaseState::PendingRollback.is_pending());
        assert!(!ReleaseState::Failed.is_pending());
    }

    #[test]
    fn test_management_policy_wire_format() {
        assert_eq!(serde_json::to_string(&ManagementPolicy::All).unwrap(), "\"*\"");
        assert!(updates_allowed(&[ManagementPolicy::All]));
        assert!(updates_allowed(&[ManagementPolicy::Observe, ManagementPolicy::Update]));
        assert!(!updates_allowed(&[ManagementPolicy::Observe]));
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut status = ReleaseStatus::default();
        status.set_condition(Condition::unavailable());
        status.set_condition(Condition::synced());
        status.set_condition(Condition::available());
        assert_eq!(status.conditions.len(), 2);
        let ready = status.conditions.iter().find(|c| c.r#type == "Ready").unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "Available");
    }

    #[test]
    fn test_release_spec_deserializes_camel_case() {
        let spec: ReleaseSpec = serde_yaml::from_str(
            r#"
chart:
  repository: https://charts.bitnami.com/bitnami
  name: wordpress
  version: 15.2.5
namespace: wordpress
skipCreateNamespace: true
values:
  replicaCount: 2
providerConfigRef:
  name: cluster-a
"#,
        )
        .unwrap();
        assert_eq!(spec.chart.name.as_deref(), Some("wordpress"));
        assert!(spec.skip_create_namespace);
        assert_eq!(spec.management_policies, vec![ManagementPolicy::All]);
        assert_eq!(spec.values.unwrap()["replicaCount"], 2);
    }
}
