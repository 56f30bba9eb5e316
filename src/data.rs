use crate::crd::ValueFromSource;
use crate::error::{Error, Result};
use crate::k8sclient::LocalClient;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

/// Reads the data of a secret on the control plane. A secret without data is
/// an error, a missing secret surfaces the underlying API error.
pub async fn get_secret_data(
    kube: &impl LocalClient,
    namespace: &str,
    name: &str,
) -> Result<BTreeMap<String, ByteString>> {
    match kube.get_secret(namespace, name).await {
        Ok(secret) => secret.data.ok_or(Error::SecretDataIsNil),
        Err(e) => Err(Error::GetSecret(namespace.to_owned(), e)),
    }
}

/// Reads the data of a configmap on the control plane.
pub async fn get_config_map_data(
    kube: &impl LocalClient,
    namespace: &str,
    name: &str,
) -> Result<BTreeMap<String, String>> {
    match kube.get_config_map(namespace, name).await {
        Ok(cm) => cm.data.ok_or(Error::ConfigMapDataIsNil),
        Err(e) => Err(Error::GetConfigMap(namespace.to_owned(), e)),
    }
}

fn absent_tolerated(err: &Error, optional: bool) -> bool {
    if !optional {
        return false;
    }
    match err {
        Error::GetSecret(_, e) | Error::GetConfigMap(_, e) => Error::is_not_found(e),
        _ => false,
    }
}

/// Resolves a value from a secret or configmap key.
///
/// The ref's namespace defaults to the release's control plane namespace and
/// its key to `default_key`. An optional source yields an empty string when
/// the object or the key is absent.
pub async fn get_data_value_from_source(
    kube: &impl LocalClient,
    source: &ValueFromSource,
    default_key: &str,
    release_namespace: &str,
) -> Result<String> {
    if let Some(r) = &source.secret_key_ref {
        let namespace = r.namespace.as_deref().unwrap_or(release_namespace);
        let data = match get_secret_data(kube, namespace, &r.name).await {
            Ok(data) => data,
            Err(e) if absent_tolerated(&e, r.optional) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        let key = r.key.as_deref().unwrap_or(default_key);
        return match data.get(key) {
            Some(ByteString(bytes)) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            None if r.optional => Ok(String::new()),
            None => Err(Error::MissingKeyForValuesFrom(key.to_owned())),
        };
    }

    if let Some(r) = &source.config_map_key_ref {
        let namespace = r.namespace.as_deref().unwrap_or(release_namespace);
        let data = match get_config_map_data(kube, namespace, &r.name).await {
            Ok(data) => data,
            Err(e) if absent_tolerated(&e, r.optional) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        let key = r.key.as_deref().unwrap_or(default_key);
        return match data.get(key) {
            Some(value) => Ok(value.clone()),
            None if r.optional => Ok(String::new()),
            None => Err(Error::MissingKeyForValuesFrom(key.to_owned())),
        };
    }

    Err(Error::SourceUnset)
}
