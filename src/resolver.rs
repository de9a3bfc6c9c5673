//! C3 Recipient Resolver (spec §4.3).
//!
//! The source's duck-typed recipient argument (string, array, or null)
//! becomes a proper tagged union here rather than an overloaded type.

use crate::config::Config;
use crate::error::{DedpasteError, Result};
use crate::fetch::{hkp, Fetchers};
use crate::store::{Backend, KeyRecord, KeyStore};
use std::collections::HashSet;

/// Input to the resolver: `None` means self, `One` a single identifier,
/// `Many` an ordered list (spec §3 "RecipientSpec").
#[derive(Debug, Clone)]
pub enum RecipientSpec {
    SelfRecipient,
    One(String),
    Many(Vec<String>),
}

/// The triple of (identifier, backend, KeyRecord) returned by the resolver.
#[derive(Debug, Clone)]
pub struct ResolvedRecipient {
    pub identifier: String,
    pub backend: Backend,
    pub record: KeyRecord,
}

impl ResolvedRecipient {
    /// `true` iff backend is non-self or the key file is OpenPGP-armored
    /// (spec §4.3 "Classification").
    pub fn is_openpgp_natured(&self) -> bool {
        self.record.is_openpgp()
    }
}

enum PrefixHint {
    Github(String),
    Keybase(String),
    Email(String),
    HexId(String),
    Plain(String),
}

fn classify(identifier: &str) -> PrefixHint {
    if let Some(user) = identifier
        .strip_prefix("gh:")
        .or_else(|| identifier.strip_prefix("github:"))
    {
        return PrefixHint::Github(user.to_string());
    }
    if let Some(user) = identifier
        .strip_prefix("kb:")
        .or_else(|| identifier.strip_prefix("keybase:"))
    {
        return PrefixHint::Keybase(user.to_string());
    }
    if identifier.contains('@') {
        return PrefixHint::Email(identifier.to_string());
    }
    if hkp::looks_like_hex_id(identifier) {
        return PrefixHint::HexId(identifier.to_string());
    }
    PrefixHint::Plain(identifier.to_string())
}

/// Resolves a full `RecipientSpec` into an ordered, fingerprint-deduplicated
/// list of `ResolvedRecipient`s, updating `last_used_at` for each one found.
pub fn resolve(
    store: &KeyStore,
    fetchers: &Fetchers,
    config: &Config,
    spec: &RecipientSpec,
) -> Result<Vec<ResolvedRecipient>> {
    let identifiers = match spec {
        RecipientSpec::SelfRecipient => return Ok(Vec::new()),
        RecipientSpec::One(id) => expand_if_group(store, id)?,
        RecipientSpec::Many(ids) => ids.clone(),
    };

    let mut seen_fingerprints = HashSet::new();
    let mut resolved = Vec::new();

    for identifier in identifiers {
        let candidate = resolve_one(store, fetchers, config, &identifier)?;
        if seen_fingerprints.insert(candidate.record.fingerprint.clone()) {
            resolved.push(candidate);
        }
    }

    Ok(resolved)
}

/// A single identifier that names a group (and only when the whole spec was
/// a single identifier) expands to its members, one level deep; groups may
/// never contain group names, enforced at creation (spec §4.3 step 1).
fn expand_if_group(store: &KeyStore, identifier: &str) -> Result<Vec<String>> {
    let groups = store.groups()?;
    match groups.get(identifier) {
        Some(members) => Ok(members.clone()),
        None => Ok(vec![identifier.to_string()]),
    }
}

fn resolve_one(
    store: &KeyStore,
    fetchers: &Fetchers,
    config: &Config,
    identifier: &str,
) -> Result<ResolvedRecipient> {
    let record = match classify(identifier) {
        PrefixHint::Github(user) => lookup_or_fetch_github(store, fetchers, config, &user)?,
        PrefixHint::Keybase(user) => lookup_or_fetch_keybase(store, fetchers, config, &user)?,
        PrefixHint::Email(email) => lookup_or_fetch_email(store, fetchers, config, &email)?,
        PrefixHint::HexId(hex_id) => lookup_or_fetch_hex(store, fetchers, config, &hex_id)?,
        PrefixHint::Plain(name) => lookup_plain(store, &name)?,
    };

    store.update_last_used(record.backend, &record.id)?;

    Ok(ResolvedRecipient {
        identifier: identifier.to_string(),
        backend: record.backend,
        record,
    })
}

fn lookup_or_fetch_github(
    store: &KeyStore,
    fetchers: &Fetchers,
    config: &Config,
    user: &str,
) -> Result<KeyRecord> {
    if !config.refresh_github_keys {
        if let Some(record) = store.get(Some(Backend::Github), user)? {
            return Ok(record);
        }
    }
    if !config.auto_fetch {
        return Err(DedpasteError::RecipientNotFound(format!("gh:{user}")));
    }
    let armored = fetchers.fetch_github(config, user)?;
    store.put_github(user, &armored)
}

fn lookup_or_fetch_keybase(
    store: &KeyStore,
    fetchers: &Fetchers,
    config: &Config,
    user: &str,
) -> Result<KeyRecord> {
    if let Some(record) = store.get(Some(Backend::Keybase), user)? {
        return Ok(record);
    }
    if !config.auto_fetch {
        return Err(DedpasteError::RecipientNotFound(format!("kb:{user}")));
    }
    let result = fetchers.fetch_keybase(config, user)?;
    store.put_keybase(user, &result.armored, None)
}

fn lookup_or_fetch_email(
    store: &KeyStore,
    fetchers: &Fetchers,
    config: &Config,
    email: &str,
) -> Result<KeyRecord> {
    if let Some(record) = store.get_by_email(None, email)? {
        return Ok(record);
    }
    if !config.auto_fetch {
        return Err(DedpasteError::RecipientNotFound(email.to_string()));
    }
    let result = fetchers.fetch_hkp(config, email)?;
    store.put_pgp(email, &result.armored, Some(email.to_string()), Some(result.server))
}

fn lookup_or_fetch_hex(
    store: &KeyStore,
    fetchers: &Fetchers,
    config: &Config,
    hex_id: &str,
) -> Result<KeyRecord> {
    if let Some(record) = store.get(Some(Backend::Pgp), hex_id)? {
        return Ok(record);
    }
    if !config.auto_fetch {
        return Err(DedpasteError::RecipientNotFound(hex_id.to_string()));
    }
    let result = fetchers.fetch_hkp(config, hex_id)?;
    store.put_pgp(hex_id, &result.armored, None, Some(result.server))
}

/// A bare name: search `friend`/`pgp`/`keybase`/`github` in that order
/// (spec §3 "RecipientSpec" and §4.3 step 3's store-lookup precedence).
fn lookup_plain(store: &KeyStore, name: &str) -> Result<KeyRecord> {
    for backend in [Backend::Friend, Backend::Pgp, Backend::Keybase, Backend::Github] {
        if let Some(record) = store.get(Some(backend), name)? {
            return Ok(record);
        }
    }
    Err(DedpasteError::RecipientNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_github_prefix() {
        assert!(matches!(classify("gh:octocat"), PrefixHint::Github(u) if u == "octocat"));
        assert!(matches!(classify("github:octocat"), PrefixHint::Github(u) if u == "octocat"));
    }

    #[test]
    fn classify_recognizes_keybase_prefix() {
        assert!(matches!(classify("kb:max"), PrefixHint::Keybase(u) if u == "max"));
        assert!(matches!(classify("keybase:max"), PrefixHint::Keybase(u) if u == "max"));
    }

    #[test]
    fn classify_recognizes_email() {
        assert!(matches!(classify("alice@example.com"), PrefixHint::Email(_)));
    }

    #[test]
    fn classify_recognizes_hex_id() {
        assert!(matches!(classify("DEADBEEFDEADBEEF"), PrefixHint::HexId(_)));
    }

    #[test]
    fn classify_falls_back_to_plain_name() {
        assert!(matches!(classify("alice"), PrefixHint::Plain(u) if u == "alice"));
    }

    fn test_store() -> (KeyStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.home = dir.path().to_path_buf();
        (KeyStore::new(config), dir)
    }

    #[test]
    fn resolving_a_plain_identifier_twice_is_idempotent_and_bumps_last_used() {
        let (store, _dir) = test_store();
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_pem = rsa::pkcs8::EncodePublicKey::to_public_key_pem(
            &rsa::RsaPublicKey::from(&key),
            rsa::pkcs8::LineEnding::LF,
        )
        .unwrap();
        store.put_friend("alice", &public_pem).unwrap();

        let config = Config {
            auto_fetch: false,
            ..store.config().clone()
        };
        let fetchers = Fetchers::new();

        let first = resolve_one(&store, &fetchers, &config, "alice").unwrap();
        let second = resolve_one(&store, &fetchers, &config, "alice").unwrap();

        assert_eq!(first.record.fingerprint, second.record.fingerprint);
        assert_eq!(first.backend, Backend::Friend);
    }

    #[test]
    fn resolve_many_dedupes_by_fingerprint_preserving_order() {
        let (store, _dir) = test_store();
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_pem = rsa::pkcs8::EncodePublicKey::to_public_key_pem(
            &rsa::RsaPublicKey::from(&key),
            rsa::pkcs8::LineEnding::LF,
        )
        .unwrap();
        store.put_friend("alice", &public_pem).unwrap();

        let config = store.config().clone();
        let fetchers = Fetchers::new();
        let spec = RecipientSpec::Many(vec!["alice".to_string(), "alice".to_string()]);
        let resolved = resolve(&store, &fetchers, &config, &spec).unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn unknown_identifier_without_auto_fetch_is_not_found() {
        let (store, _dir) = test_store();
        let config = Config {
            auto_fetch: false,
            ..store.config().clone()
        };
        let fetchers = Fetchers::new();
        let err = resolve_one(&store, &fetchers, &config, "ghost").unwrap_err();
        assert!(matches!(err, DedpasteError::RecipientNotFound(_)));
    }
}
