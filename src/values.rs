use crate::crd::ReleaseSpec;
use crate::data::get_data_value_from_source;
use crate::error::{Error, Result};
use crate::k8sclient::LocalClient;
use serde_json::{Map, Value};

pub const KEY_DEFAULT_VALUES_FROM: &str = "values.yaml";
pub const KEY_DEFAULT_SET: &str = "value";

/// Builds the desired Helm values for a release.
///
/// Layers are applied in order, later layers win: external sources in
/// declaration order, then the inline values, then the --set overrides.
/// `source_namespace` is the release's control plane namespace, used as the
/// default namespace of the external sources.
pub async fn compose_values(
    kube: &impl LocalClient,
    spec: &ReleaseSpec,
    source_namespace: &str,
) -> Result<Map<String, Value>> {
    let mut base = Map::new();

    for source in &spec.values_from {
        let raw = get_data_value_from_source(kube, source, KEY_DEFAULT_VALUES_FROM, source_namespace)
            .await?;
        if let Some(layer) = parse_values_document(&raw)? {
            base = merge_maps(base, layer);
        }
    }

    if let Some(values) = &spec.values {
        match values {
            Value::Object(inline) => base = merge_maps(base, inline.clone()),
            Value::Null => {}
            other => {
                return Err(Error::UnmarshalValues(format!(
                    "expected a mapping, got {other}"
                )))
            }
        }
    }

    for set in &spec.set {
        let mut value = set.value.clone().unwrap_or_default();
        if let Some(source) = &set.value_from {
            value = get_data_value_from_source(kube, source, KEY_DEFAULT_SET, source_namespace)
                .await?;
        }
        if value.is_empty() {
            return Err(Error::MissingSetValue);
        }
        parse_set_into(&mut base, &set.name, &value)?;
    }

    Ok(base)
}

fn parse_values_document(raw: &str) -> Result<Option<Map<String, Value>>> {
    let parsed: Value =
        serde_yaml::from_str(raw).map_err(|e| Error::UnmarshalValues(e.to_string()))?;
    match parsed {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(Error::UnmarshalValues(format!(
            "expected a mapping, got {other}"
        ))),
    }
}

/// Deep merges `overlay` into `base`. Mappings merge recursively, any other
/// value from the overlay replaces the one underneath.
pub fn merge_maps(mut base: Map<String, Value>, overlay: Map<String, Value>) -> Map<String, Value> {
    for (key, overlay_value) in overlay {
        match (base.remove(&key), overlay_value) {
            (Some(Value::Object(a)), Value::Object(b)) => {
                base.insert(key, Value::Object(merge_maps(a, b)));
            }
            (_, v) => {
                base.insert(key, v);
            }
        }
    }
    base
}

#[derive(Debug, PartialEq)]
pub(crate) enum PathSegment {
    Key(String),
    Index(usize),
}

pub(crate) fn parse_path(name: &str) -> Result<Vec<PathSegment>> {
    let mut segments = Vec::new();
    let mut chars = name.chars().peekable();
    let mut current = String::new();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut index = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => index.push(d),
                        None => {
                            return Err(Error::ParseSetData(format!(
                                "unterminated index in \"{name}\""
                            )))
                        }
                    }
                }
                let index = index
                    .parse::<usize>()
                    .map_err(|_| Error::ParseSetData(format!("invalid index in \"{name}\"")))?;
                segments.push(PathSegment::Index(index));
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    if segments.is_empty() {
        return Err(Error::ParseSetData(format!("empty path in \"{name}\"")));
    }
    Ok(segments)
}

fn coerce_scalar(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_owned())
}

/// Assigns `raw` into `base` at the Helm --set path `name` (e.g. `a.b[0].c`),
/// creating intermediate mappings and sequences as needed.
pub fn parse_set_into(base: &mut Map<String, Value>, name: &str, raw: &str) -> Result<()> {
    let segments = parse_path(name)?;
    let value = coerce_scalar(raw);

    let PathSegment::Key(first) = &segments[0] else {
        return Err(Error::ParseSetData(format!(
            "path \"{name}\" must start with a key"
        )));
    };
    let slot = base.entry(first.clone()).or_insert(Value::Null);
    assign(slot, &segments[1..], value, name)
}

fn assign(slot: &mut Value, rest: &[PathSegment], value: Value, name: &str) -> Result<()> {
    let Some(segment) = rest.first() else {
        *slot = value;
        return Ok(());
    };

    match segment {
        PathSegment::Key(key) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let map = slot
                .as_object_mut()
                .ok_or_else(|| Error::ParseSetData(format!("cannot descend into \"{name}\"")))?;
            let next = map.entry(key.clone()).or_insert(Value::Null);
            assign(next, &rest[1..], value, name)
        }
        PathSegment::Index(index) => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let list = slot
                .as_array_mut()
                .ok_or_else(|| Error::ParseSetData(format!("cannot index into \"{name}\"")))?;
            while list.len() <= *index {
                list.push(Value::Null);
            }
            assign(&mut list[*index], &rest[1..], value, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SetVal, ValueFromSource};
    use crate::data::tests::{config_map_with, secret_with};
    use crate::k8sclient::MockLocalClient;
    use serde_json::json;

    fn spec_with_values(values: Value) -> ReleaseSpec {
        ReleaseSpec {
            values: Some(values),
            ..Default::default()
        }
    }

    fn secret_source(name: &str) -> ValueFromSource {
        ValueFromSource {
            secret_key_ref: Some(crate::crd::DataKeySelector {
                name: name.to_owned(),
                ..Default::default()
            }),
            config_map_key_ref: None,
        }
    }

    fn config_map_source(name: &str) -> ValueFromSource {
        ValueFromSource {
            config_map_key_ref: Some(crate::crd::DataKeySelector {
                name: name.to_owned(),
                ..Default::default()
            }),
            secret_key_ref: None,
        }
    }

    #[test]
    fn test_merge_maps_later_layer_wins() {
        let base = json!({"image": {"repository": "nginx", "tag": "1.0"}, "replicas": 1});
        let overlay = json!({"image": {"tag": "2.0", "pullPolicy": "Always"}, "replicas": 3});
        let (Value::Object(base), Value::Object(overlay)) = (base, overlay) else {
            unreachable!()
        };
        let merged = Value::Object(merge_maps(base, overlay));
        assert_eq!(merged["image"]["repository"], "nginx");
        assert_eq!(merged["image"]["tag"], "2.0");
        assert_eq!(merged["image"]["pullPolicy"], "Always");
        assert_eq!(merged["replicas"], 3);
    }

    #[test]
    fn test_merge_maps_scalar_replaces_mapping() {
        let (Value::Object(base), Value::Object(overlay)) =
            (json!({"a": {"b": 1}}), json!({"a": "flat"}))
        else {
            unreachable!()
        };
        let merged = Value::Object(merge_maps(base, overlay));
        assert_eq!(merged["a"], "flat");
    }

    #[test]
    fn test_parse_set_into_nested_path() {
        let mut base = Map::new();
        parse_set_into(&mut base, "a.b[0].c", "v").unwrap();
        parse_set_into(&mut base, "a.b[2]", "7").unwrap();
        let result = Value::Object(base);
        assert_eq!(result["a"]["b"][0]["c"], "v");
        assert_eq!(result["a"]["b"][1], Value::Null);
        assert_eq!(result["a"]["b"][2], 7);
    }

    #[test]
    fn test_parse_set_into_coerces_scalars() {
        let mut base = Map::new();
        parse_set_into(&mut base, "enabled", "true").unwrap();
        parse_set_into(&mut base, "replicas", "3").unwrap();
        parse_set_into(&mut base, "tag", "1.25").unwrap();
        parse_set_into(&mut base, "label", "web").unwrap();
        let result = Value::Object(base);
        assert_eq!(result["enabled"], true);
        assert_eq!(result["replicas"], 3);
        assert_eq!(result["tag"], 1.25);
        assert_eq!(result["label"], "web");
    }

    #[test]
    fn test_parse_set_into_rejects_bad_paths() {
        let mut base = Map::new();
        assert!(parse_set_into(&mut base, "a[", "v").is_err());
        assert!(parse_set_into(&mut base, "a[x]", "v").is_err());
        assert!(parse_set_into(&mut base, "", "v").is_err());
    }

    #[tokio::test]
    async fn test_compose_inline_only() {
        let kube = MockLocalClient::new();
        let spec = spec_with_values(json!({"replicaCount": 2}));
        let values = compose_values(&kube, &spec, "default").await.unwrap();
        assert_eq!(Value::Object(values), json!({"replicaCount": 2}));
    }

    #[tokio::test]
    async fn test_compose_layering_order() {
        let mut kube = MockLocalClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(secret_with("values.yaml", "replicas: 1\nimage:\n  tag: \"1.0\"")));
        kube.expect_get_config_map()
            .returning(|_, _| Ok(config_map_with("values.yaml", "replicas: 2")));

        let spec = ReleaseSpec {
            values_from: vec![secret_source("first"), config_map_source("second")],
            values: Some(json!({"image": {"tag": "2.0"}})),
            set: vec![SetVal {
                name: "replicas".to_owned(),
                value: Some("5".to_owned()),
                value_from: None,
            }],
            ..Default::default()
        };

        let values = Value::Object(compose_values(&kube, &spec, "default").await.unwrap());
        // secret layered first, configmap second, inline third, set last
        assert_eq!(values["replicas"], 5);
        assert_eq!(values["image"]["tag"], "2.0");
    }

    #[tokio::test]
    async fn test_compose_set_value_from_source() {
        let mut kube = MockLocalClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(secret_with("value", "s3cr3t")));
        let spec = ReleaseSpec {
            set: vec![SetVal {
                name: "db.password".to_owned(),
                value: None,
                value_from: Some(secret_source("creds")),
            }],
            ..Default::default()
        };
        let values = Value::Object(compose_values(&kube, &spec, "default").await.unwrap());
        assert_eq!(values["db"]["password"], "s3cr3t");
    }

    #[tokio::test]
    async fn test_compose_missing_set_value() {
        let kube = MockLocalClient::new();
        let spec = ReleaseSpec {
            set: vec![SetVal {
                name: "a".to_owned(),
                value: None,
                value_from: None,
            }],
            ..Default::default()
        };
        let result = compose_values(&kube, &spec, "default").await;
        assert!(matches!(result, Err(Error::MissingSetValue)));
    }

    #[tokio::test]
    async fn test_compose_malformed_source_yaml() {
        let mut kube = MockLocalClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(secret_with("values.yaml", "a: [unclosed")));
        let spec = ReleaseSpec {
            values_from: vec![secret_source("bad")],
            ..Default::default()
        };
        let result = compose_values(&kube, &spec, "default").await;
        assert!(matches!(result, Err(Error::UnmarshalValues(_))));
    }

    #[tokio::test]
    async fn test_compose_empty_source_is_skipped() {
        let mut kube = MockLocalClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(secret_with("values.yaml", "")));
        let spec = ReleaseSpec {
            values_from: vec![secret_source("empty")],
            values: Some(json!({"a": 1})),
            ..Default::default()
        };
        let values = Value::Object(compose_values(&kube, &spec, "default").await.unwrap());
        assert_eq!(values["a"], 1);
    }
}
