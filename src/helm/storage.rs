use crate::error::{Error, Result};
use crate::helm::HelmRelease;
use base64::Engine;
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use std::io::Read;

/// Label selector matching the history secrets of one release.
pub fn release_secret_selector(release: &str) -> String {
    format!("owner=helm,name={release}")
}

/// Picks the secret holding the highest revision, by the `version` label
/// Helm's secret driver maintains.
pub fn latest_release_secret(secrets: Vec<Secret>) -> Option<Secret> {
    secrets
        .into_iter()
        .filter_map(|s| {
            let version = s
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("version"))
                .and_then(|v| v.parse::<i32>().ok())?;
            Some((version, s))
        })
        .max_by_key(|(version, _)| *version)
        .map(|(_, s)| s)
}

/// Decodes the release payload of a Helm storage secret. The driver stores
/// the release as base64 over gzip over JSON under the `release` data key.
pub fn decode_release_secret(secret: &Secret) -> Result<HelmRelease> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get("release"))
        .ok_or_else(|| Error::DecodeRelease("missing release key".to_owned()))?;

    let compressed = base64::engine::general_purpose::STANDARD
        .decode(&data.0)
        .map_err(|e| Error::DecodeRelease(e.to_string()))?;

    // the driver gzips the payload, but old revisions may be plain JSON
    let payload = if compressed.starts_with(&[0x1f, 0x8b, 0x08]) {
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| Error::DecodeRelease(e.to_string()))?;
        decompressed
    } else {
        compressed
    };

    serde_json::from_slice(&payload).map_err(|e| Error::DecodeRelease(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ReleaseState;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use k8s_openapi::ByteString;
    use kube::core::ObjectMeta;
    use std::io::Write;

    fn release_secret(name: &str, version: i32, payload: &serde_json::Value) -> Secret {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload.to_string().as_bytes())
            .unwrap();
        let compressed = encoder.finish().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(compressed);

        Secret {
            metadata: ObjectMeta {
                name: Some(format!("sh.helm.release.v1.{name}.v{version}")),
                labels: Some(
                    [
                        ("owner".to_owned(), "helm".to_owned()),
                        ("name".to_owned(), name.to_owned()),
                        ("version".to_owned(), version.to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            data: Some(
                [(
                    "release".to_owned(),
                    ByteString(encoded.into_bytes()),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        }
    }

    fn sample_payload() -> serde_json::Value {
        serde_json::json!({
            "name": "wordpress",
            "namespace": "wordpress",
            "version": 2,
            "chart": {"metadata": {"name": "wordpress", "version": "15.2.5"}},
            "config": {"replicaCount": 2},
            "info": {"status": "deployed", "description": "Upgrade complete"},
        })
    }

    #[test]
    fn test_decode_release_secret() {
        let secret = release_secret("wordpress", 2, &sample_payload());
        let release = decode_release_secret(&secret).unwrap();
        assert_eq!(release.name, "wordpress");
        assert_eq!(release.version, 2);
        let info = release.info.unwrap();
        assert_eq!(info.status, ReleaseState::Deployed);
        assert_eq!(
            release.chart.unwrap().metadata.unwrap().version,
            "15.2.5"
        );
        assert_eq!(release.config.unwrap()["replicaCount"], 2);
    }

    #[test]
    fn test_decode_release_secret_missing_payload() {
        let secret = Secret::default();
        assert!(matches!(
            decode_release_secret(&secret),
            Err(Error::DecodeRelease(_))
        ));
    }

    #[test]
    fn test_latest_release_secret_picks_highest_revision() {
        let payload = sample_payload();
        let secrets = vec![
            release_secret("wordpress", 1, &payload),
            release_secret("wordpress", 3, &payload),
            release_secret("wordpress", 2, &payload),
        ];
        let latest = latest_release_secret(secrets).unwrap();
        assert_eq!(
            latest.metadata.name.as_deref(),
            Some("sh.helm.release.v1.wordpress.v3")
        );
    }

    #[test]
    fn test_latest_release_secret_empty() {
        assert!(latest_release_secret(Vec::new()).is_none());
    }
}
