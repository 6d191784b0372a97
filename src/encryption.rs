//! # Encryption Layer
//!
//! Recipient-keyed envelope encryption over file byte streams (§4.6). An
//! encrypted file's payload can be opened by *any single* configured
//! recipient — disjunctive access, the same multi-recipient model `age`
//! itself implements natively: `Encryptor::with_recipients` wraps one
//! payload key per recipient stanza.

use age::secrecy::SecretString;
use anyhow::{Context, Result};
use std::io::Write;
use thiserror::Error;

use crate::credentials::resolve_recipient_material;
use crate::{EncryptionSpec, Recipient, RecipientType};

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption enabled with no recipients configured")]
    NoRecipients,
    #[error("failed to parse {kind} recipient: {source}")]
    InvalidRecipient {
        kind: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// `ShouldEncrypt(path, config)`: true iff encryption is enabled and the
/// path does not already carry the configured extension. Checked before
/// `EncryptedPath` so the two are idempotent together: calling
/// `EncryptedPath` on an already-encrypted path is a no-op because
/// `ShouldEncrypt` would have returned false for it.
#[must_use]
pub fn should_encrypt(path: &str, config: &EncryptionSpec) -> bool {
    config.enabled && !path.ends_with(config.file_extension.as_str())
}

/// `EncryptedPath(path)`: appends the configured extension. Idempotent by
/// construction — it never checks whether the suffix is already present,
/// callers gate that with `should_encrypt` first.
#[must_use]
pub fn encrypted_path(path: &str, config: &EncryptionSpec) -> String {
    format!("{path}{}", config.file_extension)
}

/// Resolve every configured `Recipient` into a concrete `age` recipient
/// object, dereferencing `secretRef` material first where present.
pub async fn resolve_recipients(
    client: &kube::Client,
    default_namespace: &str,
    recipients: &[Recipient],
) -> Result<Vec<Box<dyn age::Recipient + Send>>> {
    if recipients.is_empty() {
        return Err(EncryptionError::NoRecipients.into());
    }

    let mut resolved: Vec<Box<dyn age::Recipient + Send>> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let default_key = default_secret_key(recipient.recipient_type);
        let material = resolve_recipient_material(
            client,
            default_namespace,
            default_key,
            recipient.value.as_deref(),
            recipient.secret_ref.as_ref(),
        )
        .await
        .context("resolving recipient material")?;
        resolved.push(build_recipient(recipient.recipient_type, &material)?);
    }
    Ok(resolved)
}

fn default_secret_key(recipient_type: RecipientType) -> &'static str {
    match recipient_type {
        RecipientType::Age | RecipientType::Ssh | RecipientType::Yubikey => "publicKey",
        RecipientType::Passphrase => "passphrase",
    }
}

fn build_recipient(
    recipient_type: RecipientType,
    material: &str,
) -> Result<Box<dyn age::Recipient + Send>> {
    match recipient_type {
        RecipientType::Age => {
            let recipient: age::x25519::Recipient = material.parse().map_err(|e| {
                EncryptionError::InvalidRecipient {
                    kind: "age",
                    source: anyhow::anyhow!("{e}"),
                }
            })?;
            Ok(Box::new(recipient))
        }
        RecipientType::Ssh => {
            let recipient = age::ssh::Recipient::try_from(material.to_string()).map_err(|e| {
                EncryptionError::InvalidRecipient {
                    kind: "ssh",
                    source: anyhow::anyhow!("{e}"),
                }
            })?;
            Ok(Box::new(recipient))
        }
        RecipientType::Passphrase => {
            let recipient =
                age::scrypt::Recipient::new(SecretString::from(material.to_string()));
            Ok(Box::new(recipient))
        }
        RecipientType::Yubikey => {
            // Hardware-token recipients are shelled out to their plugin
            // binary (e.g. age-plugin-yubikey) via age's generic plugin
            // recipient format ("age1yubikey1...").
            let recipient: age::plugin::Recipient = material.parse().map_err(|e| {
                EncryptionError::InvalidRecipient {
                    kind: "yubikey",
                    source: anyhow::anyhow!("{e:?}"),
                }
            })?;
            Ok(Box::new(recipient))
        }
    }
}

/// Encrypt `plaintext` into an `age` envelope openable by any one of
/// `recipients`.
pub fn encrypt(
    plaintext: &[u8],
    recipients: Vec<Box<dyn age::Recipient + Send>>,
) -> Result<Vec<u8>> {
    if recipients.is_empty() {
        return Err(EncryptionError::NoRecipients.into());
    }
    let recipients_iter = recipients.iter().map(|r| r.as_ref() as &dyn age::Recipient);
    let encryptor = age::Encryptor::with_recipients(recipients_iter)
        .context("constructing age encryptor")?;

    let mut ciphertext = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut ciphertext)
        .context("wrapping age output stream")?;
    writer.write_all(plaintext).context("writing plaintext")?;
    writer.finish().context("finalizing age stream")?;
    Ok(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(extension: &str) -> EncryptionSpec {
        EncryptionSpec {
            enabled: true,
            file_extension: extension.to_string(),
            recipients: vec![],
        }
    }

    #[test]
    fn should_encrypt_false_when_disabled() {
        let mut config = spec(".age");
        config.enabled = false;
        assert!(!should_encrypt("config/a.txt", &config));
    }

    #[test]
    fn should_encrypt_false_when_already_suffixed() {
        let config = spec(".age");
        assert!(!should_encrypt("config/a.txt.age", &config));
    }

    #[test]
    fn should_encrypt_true_for_plain_path() {
        let config = spec(".age");
        assert!(should_encrypt("config/a.txt", &config));
    }

    #[test]
    fn encrypted_path_appends_extension_once() {
        let config = spec(".age");
        let once = encrypted_path("config/a.txt", &config);
        assert_eq!(once, "config/a.txt.age");
        // Calling it again without the should_encrypt gate would double the
        // suffix; the gate is what keeps the pair idempotent in practice.
        assert!(!should_encrypt(&once, &config));
    }

    #[test]
    fn age_recipient_round_trip_can_be_decrypted() {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        let ciphertext = encrypt(b"hello\n", vec![Box::new(recipient)]).expect("encrypt");

        let decryptor = age::Decryptor::new(&ciphertext[..]).expect("parse envelope");
        let identities: Vec<Box<dyn age::Identity>> = vec![Box::new(identity)];
        let mut reader = decryptor
            .decrypt(identities.iter().map(|i| i.as_ref() as &dyn age::Identity))
            .expect("decrypt with matching identity");
        let mut plaintext = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut plaintext).expect("read plaintext");
        assert_eq!(plaintext, b"hello\n");
    }

    #[test]
    fn empty_recipients_is_an_error() {
        let err = encrypt(b"data", vec![]).unwrap_err();
        assert!(err.downcast_ref::<EncryptionError>().is_some());
    }
}
