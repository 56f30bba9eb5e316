use crate::crd::{ReleaseStatus, ValueFromSource};
use crate::data::get_data_value_from_source;
use crate::error::{Error, Result};
use crate::k8sclient::LocalClient;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

pub const KEY_DEFAULT_PATCH_FROM: &str = "patch.yaml";

const KUSTOMIZATION_FILE_NAME: &str = "kustomization.yaml";
const HELM_OUTPUT_FILE_NAME: &str = "helm-output.yaml";

/// A kustomize patch: a JSON or strategic merge patch body with a target
/// selector restricting the resources it applies to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub patch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PatchTarget>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatchTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<String>,
}

#[derive(Deserialize)]
struct PatchesDocument {
    #[serde(default)]
    patches: Vec<Patch>,
}

/// Loads patches, digests them and detects patch set drift between
/// reconciles.
#[async_trait]
pub trait Patcher: Send + Sync {
    /// Reads all sources in declaration order and concatenates the patches
    /// they yield. Empty sources are skipped.
    async fn get_from_spec<L: LocalClient>(
        &self,
        kube: &L,
        sources: &[ValueFromSource],
        source_namespace: &str,
    ) -> Result<Vec<Patch>>;

    /// Stable hex digest over the canonical JSON of the patch sequence, empty
    /// string for an empty sequence.
    fn sha_of(&self, patches: &[Patch]) -> Result<String>;

    /// Whether the current patch set differs from the one recorded on the
    /// release status.
    async fn has_updates<L: LocalClient>(
        &self,
        kube: &L,
        sources: &[ValueFromSource],
        status: &ReleaseStatus,
        source_namespace: &str,
    ) -> Result<bool>;
}

#[derive(Clone, Copy, Default)]
pub struct KustomizePatcher;

#[async_trait]
impl Patcher for KustomizePatcher {
    async fn get_from_spec<L: LocalClient>(
        &self,
        kube: &L,
        sources: &[ValueFromSource],
        source_namespace: &str,
    ) -> Result<Vec<Patch>> {
        let mut base = Vec::new();
        for source in sources {
            let raw =
                get_data_value_from_source(kube, source, KEY_DEFAULT_PATCH_FROM, source_namespace)
                    .await?;
            if raw.is_empty() {
                continue;
            }
            let doc: PatchesDocument =
                serde_yaml::from_str(&raw).map_err(|e| Error::UnmarshalPatch(e.to_string()))?;
            base.extend(doc.patches);
        }
        Ok(base)
    }

    fn sha_of(&self, patches: &[Patch]) -> Result<String> {
        if patches.is_empty() {
            return Ok(String::new());
        }
        let canonical = serde_json::to_vec(patches).map_err(Error::SerializePatches)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    async fn has_updates<L: LocalClient>(
        &self,
        kube: &L,
        sources: &[ValueFromSource],
        status: &ReleaseStatus,
        source_namespace: &str,
    ) -> Result<bool> {
        let patches = self.get_from_spec(kube, sources, source_namespace).await?;
        let sum = self.sha_of(&patches)?;
        Ok(!sum.eq_ignore_ascii_case(&status.patches_sha))
    }
}

#[derive(Serialize)]
struct Kustomization<'a> {
    resources: Vec<&'a str>,
    patches: &'a [Patch],
}

/// Writes the kustomization descriptor that applies `patches` on top of the
/// rendered manifests file inside `dir`.
pub fn write_kustomization(dir: &Path, patches: &[Patch]) -> Result<()> {
    let kustomization = Kustomization {
        resources: vec![HELM_OUTPUT_FILE_NAME],
        patches,
    };
    let data = serde_yaml::to_string(&kustomization)
        .map_err(|e| Error::UnmarshalPatch(e.to_string()))?;
    std::fs::write(dir.join(KUSTOMIZATION_FILE_NAME), data)?;
    Ok(())
}

/// Applies the patches to rendered manifests through a kustomize overlay in a
/// temporary workspace. An empty patch list returns the input untouched.
pub async fn post_render(rendered: &[u8], patches: &[Patch]) -> Result<Vec<u8>> {
    if patches.is_empty() {
        return Ok(rendered.to_vec());
    }

    let workspace = tempfile::tempdir()?;
    write_kustomization(workspace.path(), patches)?;
    std::fs::write(workspace.path().join(HELM_OUTPUT_FILE_NAME), rendered)?;
    run_kustomize_build(workspace.path()).await
}

/// Runs `kustomize build` on the workspace and returns the transformed
/// manifests. Load restrictions stay at their root-only default and no
/// plugins are enabled.
pub async fn run_kustomize_build(dir: &Path) -> Result<Vec<u8>> {
    let mut cmd = Command::new("kustomize");
    cmd.kill_on_drop(true);
    cmd.arg("build").arg(dir);
    cmd.stdin(Stdio::null());

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::KustomizeBuild(e.to_string()))?;
    if !output.status.success() {
        return Err(Error::KustomizeBuild(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(output.stdout)
}

/// Shell wrapper installed as Helm's post-renderer: collects the rendered
/// manifests from stdin into the workspace and emits the kustomize output.
pub fn write_post_render_exec(dir: &Path, patches: &[Patch]) -> Result<std::path::PathBuf> {
    write_kustomization(dir, patches)?;
    let script_path = dir.join("post-render.sh");
    let script = format!(
        "#!/bin/sh\nset -e\ncd \"{dir}\"\ncat > \"{output}\"\nexec kustomize build .\n",
        dir = dir.display(),
        output = HELM_OUTPUT_FILE_NAME,
    );
    std::fs::write(&script_path, script)?;
    let mut perms = std::fs::metadata(&script_path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
    }
    std::fs::set_permissions(&script_path, perms)?;
    Ok(script_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DataKeySelector;
    use crate::data::tests::config_map_with;
    use crate::k8sclient::MockLocalClient;

    fn config_map_source(name: &str) -> ValueFromSource {
        ValueFromSource {
            config_map_key_ref: Some(DataKeySelector {
                name: name.to_owned(),
                ..Default::default()
            }),
            secret_key_ref: None,
        }
    }

    fn node_selector_patch() -> &'static str {
        r#"
patches:
  - patch: |
      apiVersion: apps/v1
      kind: Deployment
      metadata:
        name: any
      spec:
        template:
          spec:
            nodeSelector:
              disktype: ssd
    target:
      kind: Deployment
"#
    }

    #[test]
    fn test_sha_of_empty_is_empty_string() {
        let patcher = KustomizePatcher;
        assert_eq!(patcher.sha_of(&[]).unwrap(), "");
    }

    #[test]
    fn test_sha_is_deterministic_and_whitespace_independent() {
        let patcher = KustomizePatcher;
        let a: PatchesDocument = serde_yaml::from_str(
            "patches:\n  - patch: \"spec: {}\"\n    target: {kind: Deployment}\n",
        )
        .unwrap();
        let b: PatchesDocument = serde_yaml::from_str(
            "patches:\n- target:\n    kind: Deployment\n  patch: 'spec: {}'\n",
        )
        .unwrap();
        let sha_a = patcher.sha_of(&a.patches).unwrap();
        let sha_b = patcher.sha_of(&b.patches).unwrap();
        assert_eq!(sha_a, sha_b);
        assert_eq!(sha_a.len(), 64);
    }

    #[test]
    fn test_sha_changes_with_patch_content() {
        let patcher = KustomizePatcher;
        let a = vec![Patch {
            patch: "spec: {replicas: 1}".to_owned(),
            target: None,
        }];
        let b = vec![Patch {
            patch: "spec: {replicas: 2}".to_owned(),
            target: None,
        }];
        assert_ne!(patcher.sha_of(&a).unwrap(), patcher.sha_of(&b).unwrap());
    }

    #[tokio::test]
    async fn test_get_from_spec_concatenates_and_skips_empty() {
        let mut kube = MockLocalClient::new();
        let mut sequence = mockall::Sequence::new();
        kube.expect_get_config_map()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(config_map_with("patch.yaml", node_selector_patch())));
        kube.expect_get_config_map()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(config_map_with("patch.yaml", "")));
        kube.expect_get_config_map()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| {
                Ok(config_map_with(
                    "patch.yaml",
                    "patches:\n- patch: 'metadata: {}'\n",
                ))
            });

        let patcher = KustomizePatcher;
        let sources = vec![
            config_map_source("first"),
            config_map_source("empty"),
            config_map_source("second"),
        ];
        let patches = patcher
            .get_from_spec(&kube, &sources, "default")
            .await
            .unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(
            patches[0].target.as_ref().unwrap().kind.as_deref(),
            Some("Deployment")
        );
        assert_eq!(patches[1].patch, "metadata: {}");
    }

    #[tokio::test]
    async fn test_get_from_spec_invalid_document() {
        let mut kube = MockLocalClient::new();
        kube.expect_get_config_map()
            .returning(|_, _| Ok(config_map_with("patch.yaml", "patches: {not: a list}")));
        let patcher = KustomizePatcher;
        let result = patcher
            .get_from_spec(&kube, &[config_map_source("bad")], "default")
            .await;
        assert!(matches!(result, Err(Error::UnmarshalPatch(_))));
    }

    #[tokio::test]
    async fn test_has_updates_detects_digest_change() {
        let mut kube = MockLocalClient::new();
        kube.expect_get_config_map()
            .returning(|_, _| Ok(config_map_with("patch.yaml", node_selector_patch())));

        let patcher = KustomizePatcher;
        let sources = vec![config_map_source("patches")];

        let current = patcher
            .get_from_spec(&kube, &sources, "default")
            .await
            .unwrap();
        let sha = patcher.sha_of(&current).unwrap();

        let mut status = ReleaseStatus {
            patches_sha: sha.to_uppercase(),
            ..Default::default()
        };
        // digest comparison is case insensitive
        assert!(!patcher
            .has_updates(&kube, &sources, &status, "default")
            .await
            .unwrap());

        status.patches_sha = "0000".to_owned();
        assert!(patcher
            .has_updates(&kube, &sources, &status, "default")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_post_render_without_patches_is_identity() {
        let rendered = b"kind: Deployment\n";
        let out = post_render(rendered, &[]).await.unwrap();
        assert_eq!(out, rendered);
    }

    #[test]
    fn test_write_kustomization_references_rendered_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let patches = vec![Patch {
            patch: "spec: {}".to_owned(),
            target: Some(PatchTarget {
                kind: Some("Deployment".to_owned()),
                ..Default::default()
            }),
        }];
        write_kustomization(dir.path(), &patches).unwrap();
        let written = std::fs::read_to_string(dir.path().join("kustomization.yaml")).unwrap();
        assert!(written.contains("helm-output.yaml"));
        assert!(written.contains("kind: Deployment"));
    }

    #[test]
    fn test_write_post_render_exec_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_post_render_exec(dir.path(), &[Patch::default()]).unwrap();
        let metadata = std::fs::metadata(&script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(metadata.permissions().mode() & 0o111, 0o111);
        }
        assert!(dir.path().join("kustomization.yaml").exists());
    }
}
