use crate::crd::ChartSpec;
use crate::error::{Error, Result};
use crate::helm::{storage, Chart, ChartResolver, HelmClient, HelmRelease, RepoCreds};
use crate::patches::{write_post_render_exec, Patch};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, Client};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::time;

/// Filename-addressed chart cache shared by all reconciles.
pub const CHART_CACHE: &str = "/tmp/charts";

/// Revisions Helm keeps per release before pruning history.
const RELEASE_MAX_HISTORY: u32 = 20;

/// Options a Helm gateway is bound to at construction time.
#[derive(Debug, Clone)]
pub struct HelmArgs {
    /// namespace on the target cluster the release and its history live in
    pub namespace: String,
    /// wait for the release to become ready
    pub wait: bool,
    /// how long Helm waits for resources to become ready
    pub wait_timeout: Duration,
    /// skip CRDs bundled with the chart
    pub skip_crds: bool,
    /// skip tls certificate checks for the chart download
    pub insecure_skip_tls_verify: bool,
    /// hard bound for a single helm invocation
    pub command_timeout: Duration,
}

/// Gateway to Helm: deploy actions go through the helm binary, release state
/// is read back from Helm's secret storage driver in the target namespace.
pub struct HelmCli {
    target: Client,
    kubeconfig: Option<NamedTempFile>,
    args: HelmArgs,
    resolver: ChartResolver,
}

impl HelmCli {
    /// `kubeconfig` carries the target cluster credentials; `None` leaves
    /// helm on the in-cluster service account.
    pub fn new(target: Client, kubeconfig: Option<&[u8]>, args: HelmArgs) -> Result<Self> {
        let kubeconfig = match kubeconfig {
            Some(bytes) => {
                let mut file = NamedTempFile::new()?;
                file.write_all(bytes)?;
                Some(file)
            }
            None => None,
        };
        let resolver = ChartResolver::new(CHART_CACHE, args.insecure_skip_tls_verify)?;
        Ok(Self {
            target,
            kubeconfig,
            args,
            resolver,
        })
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new("helm");
        cmd.kill_on_drop(true); // make sure we can cancel helm if it takes too long
        cmd.args(args);
        cmd.arg("--namespace").arg(&self.args.namespace);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig.path());
        }
        cmd.env("HELM_CACHE_HOME", "/tmp/helm/cache");
        cmd.env("HELM_CONFIG_HOME", "/tmp/helm/config");
        cmd.env("HELM_DATA_HOME", "/tmp/helm/data");
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<Vec<u8>> {
        match time::timeout(self.args.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    Ok(output.stdout)
                } else {
                    Err(Error::HelmCommand(
                        String::from_utf8_lossy(&output.stderr).into_owned(),
                    ))
                }
            }
            Ok(Err(err)) => Err(Error::HelmCommand(err.to_string())),
            Err(_) => Err(Error::HelmCommandTimeout),
        }
    }

    fn write_values_file(values: &Map<String, Value>) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        let rendered = serde_yaml::to_string(values)
            .map_err(|e| Error::UnmarshalValues(e.to_string()))?;
        file.write_all(rendered.as_bytes())?;
        Ok(file)
    }

    async fn deploy(
        &self,
        action: DeployVerb,
        release: &str,
        chart: &Chart,
        values: &Map<String, Value>,
        patches: &[Patch],
    ) -> Result<HelmRelease> {
        let values_file = Self::write_values_file(values)?;

        // The workspace owns the post-render script and must outlive helm.
        let workspace = tempfile::tempdir()?;
        let post_renderer = if patches.is_empty() {
            None
        } else {
            Some(write_post_render_exec(workspace.path(), patches)?)
        };

        let args = deploy_args(
            action,
            release,
            &chart.path,
            values_file.path(),
            &self.args,
            post_renderer.as_deref(),
        );
        self.run(self.command(&args)).await?;

        match self.get_last_release(release).await {
            Err(Error::ReleaseNotFound) => Err(Error::LastReleaseIsNil),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DeployVerb {
    Install,
    Upgrade,
}

fn wait_args(args: &HelmArgs, out: &mut Vec<String>) {
    if args.wait {
        out.push("--wait".to_owned());
        out.push("--timeout".to_owned());
        out.push(format!("{}s", args.wait_timeout.as_secs()));
    }
}

fn deploy_args(
    action: DeployVerb,
    release: &str,
    chart_path: &Path,
    values_path: &Path,
    args: &HelmArgs,
    post_renderer: Option<&Path>,
) -> Vec<String> {
    let mut out = vec![
        match action {
            DeployVerb::Install => "install",
            DeployVerb::Upgrade => "upgrade",
        }
        .to_owned(),
        release.to_owned(),
        chart_path.display().to_string(),
        "--values".to_owned(),
        values_path.display().to_string(),
    ];
    if action == DeployVerb::Upgrade {
        // the spec is the source of truth, previous revision values never leak
        out.push("--reset-values".to_owned());
        out.push("--history-max".to_owned());
        out.push(RELEASE_MAX_HISTORY.to_string());
    }
    if args.skip_crds {
        out.push("--skip-crds".to_owned());
    }
    if args.insecure_skip_tls_verify {
        out.push("--insecure-skip-tls-verify".to_owned());
    }
    wait_args(args, &mut out);
    if let Some(script) = post_renderer {
        out.push("--post-renderer".to_owned());
        out.push(script.display().to_string());
    }
    out
}

fn rollback_args(release: &str, args: &HelmArgs) -> Vec<String> {
    let mut out = vec!["rollback".to_owned(), release.to_owned()];
    wait_args(args, &mut out);
    out
}

fn uninstall_args(release: &str) -> Vec<String> {
    vec!["uninstall".to_owned(), release.to_owned()]
}

#[async_trait]
impl HelmClient for HelmCli {
    async fn get_last_release(&self, release: &str) -> Result<HelmRelease> {
        let api = Api::<Secret>::namespaced(self.target.clone(), &self.args.namespace);
        let params = ListParams::default().labels(&storage::release_secret_selector(release));
        let secrets = api.list(&params).await?;
        match storage::latest_release_secret(secrets.items) {
            Some(secret) => storage::decode_release_secret(&secret),
            None => Err(Error::ReleaseNotFound),
        }
    }

    async fn install(
        &self,
        release: &str,
        chart: &Chart,
        values: &Map<String, Value>,
        patches: &[Patch],
    ) -> Result<HelmRelease> {
        self.deploy(DeployVerb::Install, release, chart, values, patches)
            .await
    }

    async fn upgrade(
        &self,
        release: &str,
        chart: &Chart,
        values: &Map<String, Value>,
        patches: &[Patch],
    ) -> Result<HelmRelease> {
        self.deploy(DeployVerb::Upgrade, release, chart, values, patches)
            .await
    }

    async fn rollback(&self, release: &str) -> Result<()> {
        self.run(self.command(&rollback_args(release, &self.args)))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, release: &str) -> Result<()> {
        match self.run(self.command(&uninstall_args(release))).await {
            Ok(_) => Ok(()),
            Err(Error::HelmCommand(stderr)) if stderr.contains("not found") => {
                Err(Error::ReleaseNotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn pull_and_load_chart(&self, spec: &ChartSpec, creds: &RepoCreds) -> Result<Chart> {
        self.resolver.pull_and_load(spec, creds).await
    }
}
