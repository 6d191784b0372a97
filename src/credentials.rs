//! # Credential Resolution
//!
//! Resolves `SecretKeyRef`/`AuthRef` values against the cluster's Secret
//! API. Used both for Git/forge authentication and for encryption
//! recipient material that is stored out-of-line.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use thiserror::Error;

use crate::constants::DEFAULT_GIT_USERNAME;
use crate::AuthRef;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },
    #[error("key {key} missing from secret {namespace}/{name}")]
    KeyMissing {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("secret value for key {key} is not valid UTF-8")]
    NotUtf8 { key: String },
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub struct GitCredentials {
    pub username: String,
    pub token: String,
}

/// Resolve a `(username, token)` pair for HTTPS basic auth against a Git
/// remote or a bearer token for a forge/probe call.
pub async fn resolve_git_credentials(
    client: &Client,
    default_namespace: &str,
    auth_ref: &AuthRef,
) -> Result<GitCredentials> {
    let namespace = auth_ref
        .secret_ref
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = secrets
        .get(&auth_ref.secret_ref.name)
        .await
        .map_err(|e| match e {
            kube::Error::Api(ref api_err) if api_err.code == 404 => {
                anyhow::Error::new(CredentialError::SecretNotFound {
                    namespace: namespace.clone(),
                    name: auth_ref.secret_ref.name.clone(),
                })
            }
            other => anyhow::Error::new(CredentialError::Kube(other)),
        })
        .with_context(|| {
            format!(
                "resolving credential secret {}/{}",
                namespace, auth_ref.secret_ref.name
            )
        })?;

    let token_key = auth_ref
        .secret_ref
        .key
        .clone()
        .unwrap_or_else(|| "token".to_string());
    let token = read_secret_string(&secret, &namespace, &auth_ref.secret_ref.name, &token_key)?;
    let username = match read_secret_string(&secret, &namespace, &auth_ref.secret_ref.name, "username")
    {
        Ok(u) => u,
        Err(_) => DEFAULT_GIT_USERNAME.to_string(),
    };

    Ok(GitCredentials { username, token })
}

/// Resolve a bearer token for a probe call.
pub async fn resolve_bearer_token(
    client: &Client,
    default_namespace: &str,
    auth_ref: &AuthRef,
) -> Result<String> {
    let creds = resolve_git_credentials(client, default_namespace, auth_ref).await?;
    Ok(creds.token)
}

/// Resolve inline recipient material, dereferencing a `secretRef` first if
/// the recipient does not carry an inline `value`.
pub async fn resolve_recipient_material(
    client: &Client,
    default_namespace: &str,
    default_key: &str,
    value: Option<&str>,
    secret_ref: Option<&crate::SecretKeyRef>,
) -> Result<String> {
    if let Some(v) = value {
        return Ok(v.to_string());
    }
    let secret_ref = secret_ref
        .context("recipient has neither an inline value nor a secretRef")?;
    let namespace = secret_ref
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = secrets
        .get(&secret_ref.name)
        .await
        .with_context(|| format!("resolving recipient secret {}/{}", namespace, secret_ref.name))?;
    let key = secret_ref.key.clone().unwrap_or_else(|| default_key.to_string());
    read_secret_string(&secret, &namespace, &secret_ref.name, &key).map_err(anyhow::Error::new)
}

fn read_secret_string(
    secret: &Secret,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, CredentialError> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| CredentialError::KeyMissing {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        })?;
    String::from_utf8(data.0.clone()).map_err(|_| CredentialError::NotUtf8 {
        key: key.to_string(),
    })
}
