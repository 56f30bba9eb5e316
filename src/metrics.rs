use crate::crd::Release;
use crate::reconciler::NS;
use kube::ResourceExt;
use lazy_static::lazy_static;
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tokio::sync::Mutex;

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(<Registry>::default());
    pub static ref NUM_RECONCILES_STARTED: Family<ReleaseLabels, Counter> =
        Family::<ReleaseLabels, Counter>::default();
    pub static ref NUM_RECONCILES_FAILED: Family<ReleaseLabels, Counter> =
        Family::<ReleaseLabels, Counter>::default();
    pub static ref NUM_DEPLOYS: Family<ReleaseLabels, Counter> =
        Family::<ReleaseLabels, Counter>::default();
    pub static ref NUM_ROLLBACKS: Family<ReleaseLabels, Counter> =
        Family::<ReleaseLabels, Counter>::default();
    pub static ref NUM_CLEANUPS_STARTED: Family<ReleaseLabels, Counter> =
        Family::<ReleaseLabels, Counter>::default();
    pub static ref NUM_CLEANUPS_FAILED: Family<ReleaseLabels, Counter> =
        Family::<ReleaseLabels, Counter>::default();
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct ReleaseLabels {
    pub namespace: String,
    pub name: String,
}

pub fn l(obj: &Release) -> ReleaseLabels {
    ReleaseLabels {
        namespace: obj.namespace().unwrap_or_else(|| NS.to_owned()),
        name: obj.name_any(),
    }
}

pub async fn init_metrics() {
    let base = "helm_release";
    let mut registry = REGISTRY.lock().await;
    registry.register(
        format!("{base}_reconciles_started_count"),
        "Number of reconciles started",
        NUM_RECONCILES_STARTED.clone(),
    );
    registry.register(
        format!("{base}_reconciles_failed_count"),
        "Number of reconciles failed",
        NUM_RECONCILES_FAILED.clone(),
    );
    registry.register(
        format!("{base}_deploys_count"),
        "Number of helm install or upgrade actions",
        NUM_DEPLOYS.clone(),
    );
    registry.register(
        format!("{base}_rollbacks_count"),
        "Number of helm rollback or uninstall retries",
        NUM_ROLLBACKS.clone(),
    );
    registry.register(
        format!("{base}_cleanups_started_count"),
        "Number of cleanups started",
        NUM_CLEANUPS_STARTED.clone(),
    );
    registry.register(
        format!("{base}_cleanups_failed_count"),
        "Number of cleanups failed",
        NUM_CLEANUPS_FAILED.clone(),
    );
}

pub async fn metrics() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    let registry = REGISTRY.lock().await;
    encode(&mut buffer, &registry)?;
    Ok(buffer)
}
