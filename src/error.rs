use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("KubernetesClientError: {0}")]
    KubernetesClient(#[from] kube::Error),
    #[error("InvalidKubernetesObject: {0}")]
    InvalidKubernetesObject(String),

    // connect
    #[error("provider config is not set")]
    ProviderConfigNotSet,
    #[error("provider config could not be retrieved: {0}")]
    ProviderConfigNotRetrieved(#[source] kube::Error),
    #[error("provider credentials secret is not set")]
    CredentialsSecretNotSet,
    #[error("unsupported credentials source \"{0}\"")]
    UnsupportedCredentialsSource(String),
    #[error("cannot build kubeconfig for target cluster: {0}")]
    InvalidKubeconfig(String),
    #[error("cannot create new Kubernetes client: {0}")]
    KubeClientBuild(String),
    #[error("cannot create new Helm client: {0}")]
    HelmClientBuild(String),
    #[error("value for key \"{0}\" not found in provider credentials secret")]
    CredentialsKeyNotFound(String),
    #[error("failed to create namespace for release")]
    CreateNamespace(#[source] kube::Error),

    // data sources
    #[error("source not set for value from")]
    SourceUnset,
    #[error("failed to get secret from namespace \"{0}\"")]
    GetSecret(String, #[source] kube::Error),
    #[error("secret data is nil")]
    SecretDataIsNil,
    #[error("failed to get configmap from namespace \"{0}\"")]
    GetConfigMap(String, #[source] kube::Error),
    #[error("configmap data is nil")]
    ConfigMapDataIsNil,
    #[error("missing key \"{0}\" in values from source")]
    MissingKeyForValuesFrom(String),

    // value composition
    #[error("failed to unmarshal desired values: {0}")]
    UnmarshalValues(String),
    #[error("missing value for --set")]
    MissingSetValue,
    #[error("failed parsing --set data: {0}")]
    ParseSetData(String),

    // patches
    #[error("failed to unmarshal patch: {0}")]
    UnmarshalPatch(String),
    #[error("failed to serialize patches: {0}")]
    SerializePatches(#[source] serde_json::Error),
    #[error("kustomize build failed: {0}")]
    KustomizeBuild(String),

    // helm gateway
    #[error("helm release not found")]
    ReleaseNotFound,
    #[error("failed to decode helm release from storage: {0}")]
    DecodeRelease(String),
    #[error("helm command failed: {0}")]
    HelmCommand(String),
    #[error("helm command timed out")]
    HelmCommandTimeout,
    #[error("last helm release is nil")]
    LastReleaseIsNil,

    // chart resolution
    #[error("failed to pull chart: {0}")]
    ChartPull(String),
    #[error("failed to load chart: {0}")]
    ChartLoad(String),
    #[error("expected 1 chart file, got [{0}]")]
    UnexpectedDirContent(String),
    #[error("failed to parse URL")]
    UrlParse(#[from] url::ParseError),
    #[error("invalid OCI reference: {0}")]
    OciReference(String),
    #[error("chart \"{0}\" version \"{1}\" not found in repository index")]
    ChartVersionNotFound(String, String),
    #[error("chart spec does not identify a chart")]
    ChartSpecIncomplete,
    #[error("failed to get repo pull secret")]
    GetPullSecret(#[source] Box<Error>),
    #[error("username missing in chart pull secret")]
    PullSecretMissingUsername,
    #[error("password missing in chart pull secret")]
    PullSecretMissingPassword,

    // drift detection
    #[error("release info is nil in observed helm release")]
    ReleaseInfoNil,
    #[error("chart field is nil in observed helm release")]
    ChartNilInObservedRelease,
    #[error("chart metadata field is nil in observed helm release")]
    ChartMetaNilInObservedRelease,

    // connection details
    #[error("object is not part of release: {0}")]
    ObjectNotPartOfRelease(String),
    #[error("failed to get value at fieldPath: {0}")]
    FieldPathNotFound(String),
    #[error("failed to decode secret data: {0}")]
    DecodeSecretData(#[from] base64::DecodeError),

    // late initialization
    #[error("failed to update chart spec with the name from chart metadata")]
    FailedToSetName(#[source] kube::Error),
    #[error("failed to update chart spec with the resolved version")]
    FailedToSetVersion(#[source] kube::Error),

    #[error("invalid duration \"{0}\"")]
    InvalidDuration(String),
    #[error("reconcile deadline exceeded")]
    ReconcileTimeout,
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True for kube API errors carrying a 404.
    pub fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(e) if e.code == 404)
    }

    /// True for kube API errors carrying a 409.
    pub fn is_already_exists(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(e) if e.code == 409)
    }
}
