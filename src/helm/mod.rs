pub mod chart;
pub mod client;
pub mod storage;

use crate::crd::{ChartSpec, ReleaseState};
use crate::error::Result;
use crate::patches::Patch;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use chart::{Chart, ChartResolver, RepoCreds};
pub use client::{HelmArgs, HelmCli};

/// Helm release as stored by Helm's own storage driver. The engine never
/// writes these, it only reads the last revision back.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct HelmRelease {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// revision number
    #[serde(default)]
    pub version: i32,
    pub chart: Option<ObservedChart>,
    /// merged values used for the last deploy
    pub config: Option<Value>,
    pub info: Option<ReleaseInfo>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ObservedChart {
    pub metadata: Option<ChartMetadata>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ChartMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "appVersion")]
    pub app_version: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub status: ReleaseState,
    #[serde(default)]
    pub description: String,
}

/// Contract over the embedded Helm tooling, bound to one target cluster and
/// namespace at construction time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HelmClient: Send + Sync {
    async fn get_last_release(&self, release: &str) -> Result<HelmRelease>;
    async fn install(
        &self,
        release: &str,
        chart: &Chart,
        values: &Map<String, Value>,
        patches: &[Patch],
    ) -> Result<HelmRelease>;
    async fn upgrade(
        &self,
        release: &str,
        chart: &Chart,
        values: &Map<String, Value>,
        patches: &[Patch],
    ) -> Result<HelmRelease>;
    async fn rollback(&self, release: &str) -> Result<()>;
    async fn uninstall(&self, release: &str) -> Result<()>;
    async fn pull_and_load_chart(&self, spec: &ChartSpec, creds: &RepoCreds) -> Result<Chart>;
}
