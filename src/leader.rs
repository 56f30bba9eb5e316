use crate::error::{Error, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::PostParams;
use kube::core::ObjectMeta;
use kube::{Api, Client};
use std::time::Duration;

const LEASE_NAME: &str = "helm-release-controller";
const LEASE_DURATION_SECONDS: i32 = 60;
const RENEW_INTERVAL: Duration = Duration::from_secs(20);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

fn identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("pid-{}", std::process::id()))
}

fn lease_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_owned())
}

fn lease_expired(lease: &Lease) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let Some(renewed) = &spec.renew_time else {
        return true;
    };
    let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS);
    Utc::now() - renewed.0 > chrono::Duration::seconds(duration.into())
}

fn held_by(lease: &Lease, who: &str) -> bool {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        == Some(who)
}

fn desired_lease(identity: &str, transitions: i32) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_owned()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_owned()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(MicroTime(Utc::now())),
            renew_time: Some(MicroTime(Utc::now())),
            lease_transitions: Some(transitions),
            ..Default::default()
        }),
    }
}

/// Blocks until this instance holds the controller Lease, then keeps
/// renewing it in the background. Losing the lease terminates the process,
/// the next start re-contends.
pub async fn acquire_and_hold(client: Client) -> Result<()> {
    let api = Api::<Lease>::namespaced(client, &lease_namespace());
    let who = identity();

    loop {
        match api.get_opt(LEASE_NAME).await? {
            None => {
                match api.create(&PostParams::default(), &desired_lease(&who, 1)).await {
                    Ok(_) => break,
                    Err(e) if Error::is_already_exists(&e) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Some(current) => {
                if held_by(&current, &who) || lease_expired(&current) {
                    let transitions = current
                        .spec
                        .as_ref()
                        .and_then(|s| s.lease_transitions)
                        .unwrap_or(0);
                    let mut desired = desired_lease(&who, transitions + 1);
                    desired.metadata.resource_version = current.metadata.resource_version.clone();
                    // replace is the compare-and-swap, a conflict means we lost the race
                    match api.replace(LEASE_NAME, &PostParams::default(), &desired).await {
                        Ok(_) => break,
                        Err(e) if matches!(&e, kube::Error::Api(r) if r.code == 409) => {
                            tokio::time::sleep(RETRY_INTERVAL).await;
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                tracing::info!(
                    "Waiting for lease {LEASE_NAME}, currently held by {:?}",
                    current.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
                );
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }

    tracing::info!("Acquired leader lease {LEASE_NAME} as {who}");
    tokio::spawn(renew_loop(api, who));
    Ok(())
}

async fn renew_loop(api: Api<Lease>, who: String) {
    loop {
        tokio::time::sleep(RENEW_INTERVAL).await;
        let result = async {
            let mut current = api.get(LEASE_NAME).await?;
            if !held_by(&current, &who) {
                return Ok::<bool, kube::Error>(false);
            }
            if let Some(spec) = current.spec.as_mut() {
                spec.renew_time = Some(MicroTime(Utc::now()));
            }
            api.replace(LEASE_NAME, &PostParams::default(), &current).await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!("Lost leader lease {LEASE_NAME}, shutting down");
                std::process::exit(1);
            }
            Err(e) => {
                tracing::warn!("Could not renew leader lease {LEASE_NAME}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let mut lease = desired_lease("me", 1);
        assert!(!lease_expired(&lease));
        assert!(held_by(&lease, "me"));
        assert!(!held_by(&lease, "other"));

        lease.spec.as_mut().unwrap().renew_time =
            Some(MicroTime(Utc::now() - chrono::Duration::seconds(120)));
        assert!(lease_expired(&lease));

        lease.spec = None;
        assert!(lease_expired(&lease));
    }
}
