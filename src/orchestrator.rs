//! C6 Orchestrator: the top-level `encrypt`/`decrypt` operations wiring
//! C3 (resolver) → C5 (cipher engines) → C4 (envelope codec), plus the
//! decrypt fallback chain and error enrichment (spec §4.6).

use crate::cipher::{hybrid, openpgp as pgp_cipher};
use crate::config::Config;
use crate::envelope::{
    Envelope, HybridMetadata, HybridRecipientMeta, PgpMetadata, PgpRecipientMeta, RecipientType,
};
use crate::error::{DedpasteError, Result};
use crate::fetch::Fetchers;
use crate::resolver::{self, RecipientSpec, ResolvedRecipient};
use crate::store::{self, Backend, KeyKind, KeyStore};
use chrono::Utc;

/// Result of a successful decrypt: the plaintext and, where the envelope
/// carried one, the sender label from its metadata.
#[derive(Debug)]
pub struct DecryptedMessage {
    pub plaintext: Vec<u8>,
    pub sender: Option<String>,
}

/// Inputs to `decrypt` beyond the envelope bytes themselves (spec §4.6).
#[derive(Default)]
pub struct DecryptOpts {
    pub private_key_armored: Option<String>,
    pub passphrase: Option<String>,
}

fn recipient_type_for(backend: Backend) -> RecipientType {
    match backend {
        Backend::SelfBackend => RecipientType::SelfType,
        Backend::Friend => RecipientType::Friend,
        Backend::Pgp => RecipientType::Pgp,
        Backend::Keybase => RecipientType::Keybase,
        Backend::Github => RecipientType::Github,
        // The resolver never produces a `ResolvedRecipient` backed by a
        // host-agent record; `search(.., include_host_agent: true)` is the
        // only place `Backend::HostAgent` is ever constructed.
        Backend::HostAgent => unreachable!("host agent records are never resolved recipients"),
    }
}

/// A v4 OpenPGP key-ID is the low 64 bits (16 hex chars) of the fingerprint.
fn key_id_from_fingerprint(fingerprint: &str) -> String {
    let hex: String = fingerprint.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() >= 16 {
        hex[hex.len() - 16..].to_string()
    } else {
        hex
    }
}

/// Encrypts `plaintext` for `spec`, choosing the hybrid or OpenPGP path and
/// wrapping the result in a V2 or V3 envelope (spec §4.6 `encrypt`).
pub fn encrypt(
    store: &KeyStore,
    fetchers: &Fetchers,
    config: &Config,
    plaintext: &[u8],
    spec: &RecipientSpec,
    force_pgp: bool,
) -> Result<Vec<u8>> {
    let resolved = resolver::resolve(store, fetchers, config, spec)?;

    if resolved.is_empty() {
        if force_pgp {
            return Err(DedpasteError::SelfPgpNotSupported);
        }
        return encrypt_self(store, plaintext);
    }

    let use_pgp = force_pgp || resolved.iter().any(|r| r.is_openpgp_natured());

    let envelope = if use_pgp {
        if resolved.len() > 1 {
            tracing::warn!(
                count = resolved.len(),
                "multi-recipient OpenPGP is not supported; truncating to the first recipient"
            );
        }
        encrypt_pgp(plaintext, &resolved[0])?
    } else {
        encrypt_hybrid(plaintext, &resolved[0])?
    };

    for recipient in &resolved {
        store.update_last_used(recipient.backend, &recipient.record.id)?;
    }

    crate::envelope::encode(&envelope)
}

fn encrypt_self(store: &KeyStore, plaintext: &[u8]) -> Result<Vec<u8>> {
    let self_record = store
        .get_self()?
        .ok_or_else(|| DedpasteError::RecipientNotFound("self".to_string()))?;
    let public_key = store::load_rsa_public_key(&self_record.public_path)?;
    let ciphertext = hybrid::encrypt(plaintext, &public_key)?;

    let envelope = Envelope::V2 {
        metadata: HybridMetadata {
            sender: "self".to_string(),
            recipient: HybridRecipientMeta {
                kind: RecipientType::SelfType,
                name: "self".to_string(),
                fingerprint: self_record.fingerprint,
                username: None,
                email: None,
            },
            timestamp: Utc::now(),
        },
        encrypted_key: ciphertext.encrypted_key,
        iv: ciphertext.iv,
        auth_tag: ciphertext.auth_tag,
        encrypted_content: ciphertext.encrypted_content,
    };
    crate::envelope::encode(&envelope)
}

fn encrypt_hybrid(plaintext: &[u8], recipient: &ResolvedRecipient) -> Result<Envelope> {
    let public_key = store::load_rsa_public_key(&recipient.record.public_path)?;
    let ciphertext = hybrid::encrypt(plaintext, &public_key)?;

    Ok(Envelope::V2 {
        metadata: HybridMetadata {
            sender: "self".to_string(),
            recipient: HybridRecipientMeta {
                kind: recipient_type_for(recipient.backend),
                name: recipient.record.id.clone(),
                fingerprint: recipient.record.fingerprint.clone(),
                username: recipient.record.username.clone(),
                email: recipient.record.email.clone(),
            },
            timestamp: Utc::now(),
        },
        encrypted_key: ciphertext.encrypted_key,
        iv: ciphertext.iv,
        auth_tag: ciphertext.auth_tag,
        encrypted_content: ciphertext.encrypted_content,
    })
}

fn encrypt_pgp(plaintext: &[u8], recipient: &ResolvedRecipient) -> Result<Envelope> {
    let armored_public = std::fs::read_to_string(&recipient.record.public_path)?;
    let pgp_encrypted = pgp_cipher::encrypt(plaintext, &armored_public, &recipient.identifier)?;

    Ok(Envelope::V3 {
        metadata: PgpMetadata {
            sender: "self".to_string(),
            recipient: PgpRecipientMeta {
                kind: "pgp".to_string(),
                name: recipient.record.id.clone(),
                email: recipient.record.email.clone(),
                key_id: key_id_from_fingerprint(&recipient.record.fingerprint),
                fingerprint: recipient.record.fingerprint.clone(),
            },
            pgp: true,
            timestamp: Utc::now(),
        },
        pgp_encrypted,
    })
}

/// Decrypts an envelope, routing by version and running the V3 host-agent →
/// provided-private-key → self-store fallback chain (spec §4.6).
pub fn decrypt(
    store: &KeyStore,
    config: &Config,
    envelope_bytes: &[u8],
    opts: &DecryptOpts,
) -> Result<DecryptedMessage> {
    match crate::envelope::decode(envelope_bytes)? {
        Envelope::V1 { encrypted_key, iv, auth_tag, encrypted_content } => {
            let self_record = store
                .get_self()?
                .ok_or_else(|| DedpasteError::RecipientNotFound("self".to_string()))?;
            let private_key = load_self_rsa_private_key(&self_record)?;
            let plaintext = hybrid::decrypt(&private_key, &encrypted_key, &iv, &auth_tag, &encrypted_content)?;
            Ok(DecryptedMessage { plaintext, sender: None })
        }
        Envelope::V2 { metadata, encrypted_key, iv, auth_tag, encrypted_content } => {
            let self_record = store
                .get_self()?
                .ok_or_else(|| DedpasteError::RecipientNotFound("self".to_string()))?;

            let addressed_to_us = metadata.recipient.kind == RecipientType::SelfType
                || metadata.recipient.name == "self"
                || metadata.recipient.fingerprint == self_record.fingerprint;
            if !addressed_to_us {
                return Err(DedpasteError::NotForYou(metadata.recipient.name));
            }

            let private_key = load_self_rsa_private_key(&self_record)?;
            let plaintext = hybrid::decrypt(&private_key, &encrypted_key, &iv, &auth_tag, &encrypted_content)?;
            Ok(DecryptedMessage { plaintext, sender: Some(metadata.sender) })
        }
        Envelope::V3 { metadata, pgp_encrypted } => {
            decrypt_pgp_with_fallback(store, config, &pgp_encrypted, opts)
                .map(|plaintext| DecryptedMessage { plaintext, sender: Some(metadata.sender) })
        }
    }
}

fn load_self_rsa_private_key(self_record: &crate::store::KeyRecord) -> Result<rsa::RsaPrivateKey> {
    let private_path = self_record
        .private_path
        .as_ref()
        .ok_or(DedpasteError::BadPrivateKey)?;
    store::load_rsa_private_key(private_path)
}

fn decrypt_pgp_with_fallback(
    store: &KeyStore,
    config: &Config,
    pgp_encrypted: &[u8],
    opts: &DecryptOpts,
) -> Result<Vec<u8>> {
    let mut first_error = None;

    if config.use_host_agent {
        match pgp_cipher::decrypt_via_host_agent(pgp_encrypted, &config.gpg_binary, config.crypto_timeout) {
            Ok(plaintext) => return Ok(plaintext),
            Err(e) => first_error = Some(e),
        }
    }

    let fallback_private_key = opts
        .private_key_armored
        .clone()
        .or_else(|| self_store_pgp_private_key(store));

    match fallback_private_key {
        Some(armored) => match pgp_cipher::decrypt_with_provided_private_key(
            pgp_encrypted,
            &armored,
            opts.passphrase.as_deref(),
            config.crypto_timeout,
        ) {
            Ok(plaintext) => Ok(plaintext),
            Err(second_error) => match first_error {
                Some(first) => Err(enrich_both_failed(first, second_error)),
                None => Err(second_error),
            },
        },
        None => Err(first_error.unwrap_or(DedpasteError::HostAgentUnavailable)),
    }
}

/// A `self` record whose key material happens to be OpenPGP-armored (rather
/// than the RSA pair `put_self` normally generates) is usable as the
/// last-resort V3 decrypt key, per spec §4.6.
fn self_store_pgp_private_key(store: &KeyStore) -> Option<String> {
    let record = store.get_self().ok().flatten()?;
    if record.key_kind != KeyKind::OpenpgpArmored {
        return None;
    }
    let private_path = record.private_path?;
    std::fs::read_to_string(private_path).ok()
}

/// When both the host-agent and provided-key attempts fail, the first
/// attempt's diagnostic wins but absorbs any additional key-IDs the second
/// attempt surfaced (spec §4.5.2 "enriched with key-IDs").
fn enrich_both_failed(first: DedpasteError, second: DedpasteError) -> DedpasteError {
    match (&first, &second) {
        (DedpasteError::NoMatchingKey(_), DedpasteError::NoMatchingKey(_)) => {
            let (DedpasteError::NoMatchingKey(mut ids), DedpasteError::NoMatchingKey(more)) =
                (first, second)
            else {
                unreachable!()
            };
            for id in more {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            DedpasteError::NoMatchingKey(ids)
        }
        _ => first,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config as CoreConfig;
    use crate::envelope;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    fn test_store() -> (KeyStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.home = dir.path().to_path_buf();
        (KeyStore::new(config), dir)
    }

    fn rsa_pair(bits: usize) -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn hybrid_self_encrypt_then_decrypt_roundtrips() {
        let (store, _dir) = test_store();
        let (private, public) = rsa_pair(1024);
        let private_pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&private, LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = public.to_public_key_pem(LineEnding::LF).unwrap();
        store.put_self(&private_pem, &public_pem).unwrap();

        let config = store.config().clone();
        let fetchers = Fetchers::new();
        let envelope_bytes = encrypt(
            &store,
            &fetchers,
            &config,
            b"hello",
            &RecipientSpec::SelfRecipient,
            false,
        )
        .unwrap();

        let decoded = envelope::decode(&envelope_bytes).unwrap();
        assert_eq!(decoded.version(), 2);

        let message = decrypt(&store, &config, &envelope_bytes, &DecryptOpts::default()).unwrap();
        assert_eq!(message.plaintext, b"hello");
    }

    #[test]
    fn hybrid_friend_encrypt_produces_version_2() {
        let (store, _dir) = test_store();
        let (_private, public) = rsa_pair(1024);
        let public_pem = public.to_public_key_pem(LineEnding::LF).unwrap();
        store.put_friend("alice", &public_pem).unwrap();

        let config = store.config().clone();
        let fetchers = Fetchers::new();
        let spec = RecipientSpec::One("alice".to_string());
        let envelope_bytes = encrypt(&store, &fetchers, &config, b"hi alice", &spec, false).unwrap();

        let decoded = envelope::decode(&envelope_bytes).unwrap();
        assert_eq!(decoded.version(), 2);
    }

    #[test]
    fn v2_wrong_recipient_fingerprint_is_not_for_you() {
        let (store, _dir) = test_store();
        let (private, public) = rsa_pair(1024);
        let private_pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&private, LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = public.to_public_key_pem(LineEnding::LF).unwrap();
        store.put_self(&private_pem, &public_pem).unwrap();

        let config = store.config().clone();
        let envelope = Envelope::V2 {
            metadata: HybridMetadata {
                sender: "mallory".to_string(),
                recipient: HybridRecipientMeta {
                    kind: RecipientType::Friend,
                    name: "somebody-else".to_string(),
                    fingerprint: "00:00:00".to_string(),
                    username: None,
                    email: None,
                },
                timestamp: Utc::now(),
            },
            encrypted_key: vec![1, 2, 3],
            iv: vec![0; 12],
            auth_tag: vec![0; 16],
            encrypted_content: vec![0; 4],
        };
        let bytes = envelope::encode(&envelope).unwrap();

        let err = decrypt(&store, &config, &bytes, &DecryptOpts::default()).unwrap_err();
        assert!(matches!(err, DedpasteError::NotForYou(name) if name == "somebody-else"));
    }

    #[test]
    fn v2_matching_fingerprint_accepted_even_with_wrong_name() {
        let (store, _dir) = test_store();
        let (private, public) = rsa_pair(1024);
        let private_pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&private, LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = public.to_public_key_pem(LineEnding::LF).unwrap();
        let self_record = store.put_self(&private_pem, &public_pem).unwrap();

        let ciphertext = hybrid::encrypt(b"for me", &public).unwrap();
        let envelope = Envelope::V2 {
            metadata: HybridMetadata {
                sender: "alice".to_string(),
                recipient: HybridRecipientMeta {
                    kind: RecipientType::Friend,
                    name: "not-self".to_string(),
                    fingerprint: self_record.fingerprint.clone(),
                    username: None,
                    email: None,
                },
                timestamp: Utc::now(),
            },
            encrypted_key: ciphertext.encrypted_key,
            iv: ciphertext.iv,
            auth_tag: ciphertext.auth_tag,
            encrypted_content: ciphertext.encrypted_content,
        };
        let bytes = envelope::encode(&envelope).unwrap();
        let config = store.config().clone();

        let message = decrypt(&store, &config, &bytes, &DecryptOpts::default()).unwrap();
        assert_eq!(message.plaintext, b"for me");
    }

    #[test]
    fn key_id_is_low_64_bits_of_fingerprint() {
        let fingerprint = "ABCD1234ABCD1234ABCD1234ABCD1234ABCD1234";
        assert_eq!(key_id_from_fingerprint(fingerprint), "ABCD1234ABCD1234");
    }

    #[test]
    fn self_encrypt_with_force_pgp_is_rejected() {
        let (store, _dir) = test_store();
        let config = store.config().clone();
        let fetchers = Fetchers::new();
        let err = encrypt(
            &store,
            &fetchers,
            &config,
            b"x",
            &RecipientSpec::SelfRecipient,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, DedpasteError::SelfPgpNotSupported));
    }
}
