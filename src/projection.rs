//! # Projection Engine
//!
//! Fetches an arbitrary cluster object by `(apiVersion, kind, namespace,
//! name)` and renders it into one or more `(path, bytes)` pairs under one
//! of three strategies (§4.5). Addressing an arbitrary group/version/kind
//! rules out a typed `kube::Api<T>`, so this goes through
//! `kube::core::DynamicObject` the way the teacher's source-management
//! code addresses FluxCD/ArgoCD objects it has no static type for.

use anyhow::{Context, Result};
use kube::api::ApiResource;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use thiserror::Error;

use crate::{ProjectionSpec, ProjectionStrategy, ResourceRef, WriteMode};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("resource {kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("resource {kind} {namespace}/{name} has no top-level 'data' map")]
    MissingData {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("field '{field}' missing from {kind} {namespace}/{name} data")]
    MissingField {
        kind: String,
        namespace: String,
        name: String,
        field: String,
    },
    #[error("singleField strategy requires fieldKey")]
    MissingFieldKey,
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// One rendered file produced by a projection.
#[derive(Debug, Clone)]
pub struct ProjectedFile {
    pub path: String,
    pub content: Vec<u8>,
    pub write_mode: WriteMode,
}

/// Fetches the referenced object and renders it per `spec.strategy`.
pub async fn project(
    client: &Client,
    default_namespace: &str,
    spec: &ProjectionSpec,
) -> Result<Vec<ProjectedFile>> {
    let object = fetch_object(client, default_namespace, &spec.resource_ref).await?;

    match spec.strategy {
        ProjectionStrategy::Dump => project_dump(&object, spec),
        ProjectionStrategy::Fields => project_fields(&object, spec, &spec.resource_ref),
        ProjectionStrategy::SingleField => project_single_field(&object, spec, &spec.resource_ref),
    }
}

async fn fetch_object(
    client: &Client,
    default_namespace: &str,
    resource_ref: &ResourceRef,
) -> Result<DynamicObject> {
    let (group, version) = split_api_version(&resource_ref.api_version);
    let gvk = GroupVersionKind {
        group,
        version,
        kind: resource_ref.kind.clone(),
    };
    let api_resource = ApiResource::from_gvk(&gvk);
    let namespace = resource_ref
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string());
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &namespace, &api_resource);

    api.get(&resource_ref.name)
        .await
        .map_err(|e| match e {
            kube::Error::Api(ref api_err) if api_err.code == 404 => anyhow::Error::new(
                ProjectionError::NotFound {
                    kind: resource_ref.kind.clone(),
                    namespace: namespace.clone(),
                    name: resource_ref.name.clone(),
                },
            ),
            other => anyhow::Error::new(ProjectionError::Kube(other)),
        })
        .with_context(|| {
            format!(
                "fetching {} {}/{}",
                resource_ref.kind, namespace, resource_ref.name
            )
        })
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn project_dump(object: &DynamicObject, spec: &ProjectionSpec) -> Result<Vec<ProjectedFile>> {
    let yaml = serde_yaml::to_string(object).map_err(ProjectionError::Yaml)?;
    Ok(vec![ProjectedFile {
        path: spec.strategy_path.clone(),
        content: yaml.into_bytes(),
        write_mode: spec.write_mode,
    }])
}

fn project_fields(
    object: &DynamicObject,
    spec: &ProjectionSpec,
    resource_ref: &ResourceRef,
) -> Result<Vec<ProjectedFile>> {
    let data = extract_data_map(object, resource_ref)?;
    let dir = spec.strategy_path.trim_end_matches('/');
    let mut files = Vec::with_capacity(data.len());
    for (key, value) in data {
        let content = string_field_value(value)?;
        files.push(ProjectedFile {
            path: format!("{dir}/{key}"),
            content: content.into_bytes(),
            write_mode: spec.write_mode,
        });
    }
    Ok(files)
}

fn project_single_field(
    object: &DynamicObject,
    spec: &ProjectionSpec,
    resource_ref: &ResourceRef,
) -> Result<Vec<ProjectedFile>> {
    let field_key = spec
        .field_key
        .as_deref()
        .ok_or(ProjectionError::MissingFieldKey)?;
    let data = extract_data_map(object, resource_ref)?;

    let value = lookup_nested(data, field_key).ok_or_else(|| ProjectionError::MissingField {
        kind: resource_ref.kind.clone(),
        namespace: resource_ref
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        name: resource_ref.name.clone(),
        field: field_key.to_string(),
    })?;
    let content = string_field_value(value)?;

    let path = if spec.write_mode == WriteMode::Append {
        spec.strategy_path.clone()
    } else {
        let dir = spec.strategy_path.trim_end_matches('/');
        let file_name = spec
            .field_file_name
            .clone()
            .unwrap_or_else(|| field_key.to_string());
        format!("{dir}/{file_name}")
    };

    Ok(vec![ProjectedFile {
        path,
        content: content.into_bytes(),
        write_mode: spec.write_mode,
    }])
}

fn extract_data_map<'a>(
    object: &'a DynamicObject,
    resource_ref: &ResourceRef,
) -> Result<&'a serde_json::Map<String, serde_json::Value>, ProjectionError> {
    object
        .data
        .get("data")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ProjectionError::MissingData {
            kind: resource_ref.kind.clone(),
            namespace: resource_ref
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: resource_ref.name.clone(),
        })
}

/// `fieldKey` may be a dotted path (`outer.inner`) addressing a nested
/// object inside `data`, not just a single top-level key.
fn lookup_nested<'a>(
    data: &'a serde_json::Map<String, serde_json::Value>,
    field_key: &str,
) -> Option<&'a serde_json::Value> {
    let mut parts = field_key.split('.');
    let first = parts.next()?;
    let mut current = data.get(first)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn string_field_value(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ObjectMeta, TypeMeta};
    use serde_json::json;

    fn configmap_like(data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("app-config".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data,
        }
    }

    fn resource_ref() -> ResourceRef {
        ResourceRef {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "app-config".to_string(),
            namespace: Some("default".to_string()),
        }
    }

    #[test]
    fn fields_strategy_emits_one_file_per_key() {
        let object = configmap_like(json!({"data": {"a": "1", "b": "2"}}));
        let spec = ProjectionSpec {
            resource_ref: resource_ref(),
            strategy: ProjectionStrategy::Fields,
            strategy_path: "configs/".to_string(),
            write_mode: WriteMode::Overwrite,
            field_key: None,
            field_file_name: None,
        };
        let files = project_fields(&object, &spec, &spec.resource_ref).unwrap();
        let mut paths: Vec<_> = files.iter().map(|f| f.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["configs/a", "configs/b"]);
    }

    #[test]
    fn single_field_append_targets_strategy_path_directly() {
        let object = configmap_like(json!({"data": {"log": "line2"}}));
        let spec = ProjectionSpec {
            resource_ref: resource_ref(),
            strategy: ProjectionStrategy::SingleField,
            strategy_path: "logs/all.log".to_string(),
            write_mode: WriteMode::Append,
            field_key: Some("log".to_string()),
            field_file_name: None,
        };
        let files = project_single_field(&object, &spec, &spec.resource_ref).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "logs/all.log");
        assert_eq!(files[0].content, b"line2");
    }

    #[test]
    fn single_field_overwrite_uses_directory_and_field_file_name() {
        let object = configmap_like(json!({"data": {"log": "hello"}}));
        let spec = ProjectionSpec {
            resource_ref: resource_ref(),
            strategy: ProjectionStrategy::SingleField,
            strategy_path: "logs".to_string(),
            write_mode: WriteMode::Overwrite,
            field_key: Some("log".to_string()),
            field_file_name: Some("app.log".to_string()),
        };
        let files = project_single_field(&object, &spec, &spec.resource_ref).unwrap();
        assert_eq!(files[0].path, "logs/app.log");
    }

    #[test]
    fn missing_data_map_is_an_error() {
        let object = configmap_like(json!({}));
        let spec = ProjectionSpec {
            resource_ref: resource_ref(),
            strategy: ProjectionStrategy::Fields,
            strategy_path: "configs/".to_string(),
            write_mode: WriteMode::Overwrite,
            field_key: None,
            field_file_name: None,
        };
        let err = project_fields(&object, &spec, &spec.resource_ref).unwrap_err();
        assert!(matches!(err, ProjectionError::MissingData { .. }));
    }

    #[test]
    fn nested_field_key_resolves_dotted_path() {
        let object = configmap_like(json!({"data": {"outer": {"inner": "value"}}}));
        let spec = ProjectionSpec {
            resource_ref: resource_ref(),
            strategy: ProjectionStrategy::SingleField,
            strategy_path: "out".to_string(),
            write_mode: WriteMode::Overwrite,
            field_key: Some("outer.inner".to_string()),
            field_file_name: None,
        };
        let files = project_single_field(&object, &spec, &spec.resource_ref).unwrap();
        assert_eq!(files[0].content, b"value");
    }
}
