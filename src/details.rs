use crate::crd::ConnectionDetail;
use crate::error::{Error, Result};
use crate::k8sclient::TargetClient;
use crate::values::{parse_path, PathSegment};
use base64::Engine;
use kube::core::DynamicObject;
use serde_json::Value;
use std::collections::HashMap;

const HELM_RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";
const HELM_RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";

/// Connection values extracted from the target cluster, keyed by the secret
/// key they surface under.
pub type ConnectionDetails = HashMap<String, Vec<u8>>;

/// Collects the configured connection details from objects on the target
/// cluster after a successful deploy.
pub async fn connection_details(
    target: &impl TargetClient,
    details: &[ConnectionDetail],
    release_name: &str,
    release_namespace: &str,
) -> Result<ConnectionDetails> {
    let mut out = ConnectionDetails::new();

    for detail in details {
        let object = target
            .get_object(&detail.api_version, &detail.kind, &detail.namespace, &detail.name)
            .await?;

        if !detail.skip_part_of_release_check
            && !part_of_release(&object, release_name, release_namespace)
        {
            return Err(Error::ObjectNotPartOfRelease(format!(
                "{}/{}/{}",
                detail.kind, detail.namespace, detail.name
            )));
        }

        let value = serde_json::to_value(&object)
            .map_err(|_| Error::FieldPathNotFound(detail.field_path.clone()))?;
        let found = value_at_path(&value, &detail.field_path)?;
        let rendered = stringify(found);

        // prevent secret data being encoded twice
        let bytes = if detail.kind == "Secret"
            && detail.api_version == "v1"
            && detail.field_path.starts_with("data")
        {
            base64::engine::general_purpose::STANDARD.decode(rendered.as_bytes())?
        } else {
            rendered.into_bytes()
        };

        out.insert(detail.to_connection_secret_key.clone(), bytes);
    }

    Ok(out)
}

fn part_of_release(object: &DynamicObject, release_name: &str, release_namespace: &str) -> bool {
    let Some(annotations) = object.metadata.annotations.as_ref() else {
        return false;
    };
    annotations.get(HELM_RELEASE_NAME_ANNOTATION).map(String::as_str) == Some(release_name)
        && annotations
            .get(HELM_RELEASE_NAMESPACE_ANNOTATION)
            .map(String::as_str)
            == Some(release_namespace)
}

fn value_at_path<'a>(root: &'a Value, path: &str) -> Result<&'a Value> {
    let segments =
        parse_path(path).map_err(|_| Error::FieldPathNotFound(path.to_owned()))?;
    let mut current = root;
    for segment in &segments {
        current = match segment {
            PathSegment::Key(key) => current.get(key),
            PathSegment::Index(index) => current.get(index),
        }
        .ok_or_else(|| Error::FieldPathNotFound(path.to_owned()))?;
    }
    Ok(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
