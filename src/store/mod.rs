//! C1 Key Store: persistent mapping of named keys across five backends to
//! disk paths and metadata (spec §4.1).

mod groups;
mod record;

pub use groups::GroupFile;
pub use record::{Backend, KeyKind, KeyRecord};

use crate::error::{DedpasteError, Result};
use chrono::Utc;
use fs2::FileExt;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::Cert;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::Config;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DatabaseFile {
    records: Vec<KeyRecord>,
}

pub struct KeyStore {
    config: Config,
}

impl KeyStore {
    pub fn new(config: Config) -> Self {
        KeyStore { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reads the database under an exclusive advisory lock, held for the
    /// lifetime of the returned guard, so callers can read-modify-write
    /// safely across processes (spec §4.1, §5).
    fn lock_exclusive(&self) -> Result<File> {
        self.config.ensure_layout()?;
        let path = self.config.keydb_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn read_locked(&self, file: &File) -> Result<DatabaseFile> {
        let raw = fs::read_to_string(self.config.keydb_path())?;
        let _ = file; // lock is held by the caller; this reads the same path
        if raw.trim().is_empty() {
            return Ok(DatabaseFile::default());
        }
        match serde_json::from_str(&raw) {
            Ok(db) => Ok(db),
            Err(e) => {
                tracing::warn!(error = %e, "key database is corrupt, treating as empty");
                Ok(DatabaseFile::default())
            }
        }
    }

    fn write_locked(&self, db: &DatabaseFile) -> Result<()> {
        let serialized = serde_json::to_string_pretty(db)?;
        fs::write(self.config.keydb_path(), serialized)?;
        Ok(())
    }

    /// Loads the whole database without taking the write lock (read-only use).
    pub fn load(&self) -> Result<Vec<KeyRecord>> {
        self.config.ensure_layout()?;
        let path = self.config.keydb_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<DatabaseFile>(&raw) {
            Ok(db) => Ok(db.records),
            Err(e) => {
                tracing::warn!(error = %e, "key database is corrupt, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut Vec<KeyRecord>) -> Result<()>) -> Result<()> {
        let lock = self.lock_exclusive()?;
        let mut db = self.read_locked(&lock)?;
        f(&mut db.records)?;
        self.write_locked(&db)?;
        lock.unlock()?;
        Ok(())
    }

    /// `backend = None` searches all backends in the fixed precedence order.
    pub fn get(&self, backend: Option<Backend>, id: &str) -> Result<Option<KeyRecord>> {
        let records = self.load()?;
        match backend {
            Some(b) => Ok(records
                .into_iter()
                .find(|r| r.backend == b && r.id == id)),
            None => {
                for b in Backend::PRECEDENCE {
                    if let Some(found) = records.iter().find(|r| r.backend == b && r.id == id) {
                        return Ok(Some(found.clone()));
                    }
                }
                Ok(None)
            }
        }
    }

    pub fn get_by_email(&self, backend: Option<Backend>, email: &str) -> Result<Option<KeyRecord>> {
        let records = self.load()?;
        let email_lower = email.to_lowercase();
        let candidates = |r: &&KeyRecord| {
            backend.is_none_or(|b| r.backend == b)
                && r.email.as_deref().map(|e| e.to_lowercase()) == Some(email_lower.clone())
        };
        Ok(records.iter().find(candidates).cloned())
    }

    pub fn get_self(&self) -> Result<Option<KeyRecord>> {
        self.get(Some(Backend::SelfBackend), "self")
    }

    fn write_key_file(&self, path: &Path, contents: &str, owner_only: bool) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        if owner_only {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(path)?.permissions();
                perms.set_mode(0o600);
                fs::set_permissions(path, perms)?;
            }
        }
        Ok(())
    }

    /// Normalizes line endings to `\n` and validates the armor header.
    fn normalize_armored(armored: &str, expected_header: &str) -> Result<String> {
        let normalized = armored.replace("\r\n", "\n");
        let first_line = normalized.lines().next().unwrap_or_default();
        if first_line.trim() != expected_header {
            return Err(DedpasteError::WrongKeyKind {
                expected: "openpgp_armored",
                actual: "unrecognized",
            });
        }
        Ok(normalized)
    }

    fn fingerprint_rsa_public_pem(pem: &str) -> Result<String> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| DedpasteError::Pkcs8(e.to_string()))?;
        let der = rsa::pkcs8::EncodePublicKey::to_public_key_der(&key)
            .map_err(|e| DedpasteError::Pkcs8(e.to_string()))?;
        let digest = Sha256::digest(der.as_bytes());
        Ok(hex::encode(digest))
    }

    fn fingerprint_openpgp_armored(armored: &str) -> Result<String> {
        let cert = Cert::from_bytes(armored.as_bytes()).map_err(DedpasteError::OpenPgp)?;
        Ok(cert.fingerprint().to_hex())
    }

    /// Generates a 4096-bit RSA keypair for `self` and persists it (spec §4.1
    /// `put_self`). At most one `self` record may exist; an existing one is
    /// replaced.
    pub fn put_self(&self, private_pem: &str, public_pem: &str) -> Result<KeyRecord> {
        let fingerprint = Self::fingerprint_rsa_public_pem(public_pem)?;
        let public_path = self.config.backend_dir("self").join("self.pub");
        let private_path = self.config.backend_dir("self").join("self.key");

        self.write_key_file(&public_path, public_pem, false)?;
        self.write_key_file(&private_path, private_pem, true)?;

        let now = Utc::now();
        let record = KeyRecord {
            id: "self".to_string(),
            backend: Backend::SelfBackend,
            key_kind: KeyKind::RsaPem,
            fingerprint,
            public_path,
            private_path: Some(private_path.clone()),
            email: None,
            username: None,
            name: Some("self".to_string()),
            added_at: now,
            last_used_at: now,
            source_url_or_origin: None,
        };

        self.mutate(|records| {
            records.retain(|r| r.backend != Backend::SelfBackend);
            records.push(record.clone());
            Ok(())
        })?;

        Ok(record)
    }

    pub fn put_friend(&self, name: &str, pem_or_armored: &str) -> Result<KeyRecord> {
        self.put_public_key(Backend::Friend, name, pem_or_armored, None, None, None)
    }

    pub fn put_pgp(
        &self,
        name: &str,
        armored: &str,
        email: Option<String>,
        source: Option<String>,
    ) -> Result<KeyRecord> {
        self.put_public_key(Backend::Pgp, name, armored, email, None, source)
    }

    pub fn put_keybase(
        &self,
        username: &str,
        armored: &str,
        email: Option<String>,
    ) -> Result<KeyRecord> {
        let origin = format!("https://keybase.io/{username}");
        self.put_public_key(
            Backend::Keybase,
            username,
            armored,
            email,
            Some(username.to_string()),
            Some(origin),
        )
    }

    pub fn put_github(&self, username: &str, armored: &str) -> Result<KeyRecord> {
        let origin = format!("https://github.com/{username}.gpg");
        self.put_public_key(
            Backend::Github,
            username,
            armored,
            None,
            Some(username.to_string()),
            Some(origin),
        )
    }

    fn put_public_key(
        &self,
        backend: Backend,
        id: &str,
        pem_or_armored: &str,
        email: Option<String>,
        username: Option<String>,
        source_url_or_origin: Option<String>,
    ) -> Result<KeyRecord> {
        let is_pgp_armor = pem_or_armored
            .trim_start()
            .starts_with("-----BEGIN PGP PUBLIC KEY BLOCK-----");

        let (normalized, key_kind, fingerprint, extension) = if is_pgp_armor {
            let normalized =
                Self::normalize_armored(pem_or_armored, "-----BEGIN PGP PUBLIC KEY BLOCK-----")?;
            let fingerprint = Self::fingerprint_openpgp_armored(&normalized)?;
            (normalized, KeyKind::OpenpgpArmored, fingerprint, "asc")
        } else {
            let normalized = pem_or_armored.replace("\r\n", "\n");
            let first_line = normalized.lines().next().unwrap_or_default().trim();
            if first_line != "-----BEGIN PUBLIC KEY-----"
                && first_line != "-----BEGIN RSA PUBLIC KEY-----"
            {
                return Err(DedpasteError::WrongKeyKind {
                    expected: "rsa_pem or openpgp_armored",
                    actual: "unrecognized",
                });
            }
            let fingerprint = Self::fingerprint_rsa_public_pem(&normalized)?;
            (normalized, KeyKind::RsaPem, fingerprint, "pem")
        };

        let public_path = self
            .config
            .backend_dir(backend.as_str())
            .join(format!("{id}.{extension}"));
        self.write_key_file(&public_path, &normalized, false)?;

        let now = Utc::now();
        let record = KeyRecord {
            id: id.to_string(),
            backend,
            key_kind,
            fingerprint,
            public_path,
            private_path: None,
            email,
            username,
            name: Some(id.to_string()),
            added_at: now,
            last_used_at: now,
            source_url_or_origin,
        };

        self.mutate(|records| {
            records.retain(|r| !(r.backend == backend && r.id == id));
            records.push(record.clone());
            Ok(())
        })?;

        Ok(record)
    }

    /// Unlinks the key file(s) and removes the record. Idempotent: returns
    /// `false` if nothing matched, never errors on a missing entry.
    pub fn remove(&self, backend: Option<Backend>, id: &str) -> Result<bool> {
        let mut removed = false;
        self.mutate(|records| {
            let mut to_remove = Vec::new();
            records.retain(|r| {
                let matches = backend.is_none_or(|b| r.backend == b) && r.id == id;
                if matches {
                    to_remove.push(r.clone());
                }
                !matches
            });
            removed = !to_remove.is_empty();
            for record in to_remove {
                let _ = fs::remove_file(&record.public_path);
                if let Some(private_path) = &record.private_path {
                    let _ = fs::remove_file(private_path);
                }
            }
            Ok(())
        })?;
        Ok(removed)
    }

    pub fn update_last_used(&self, backend: Backend, id: &str) -> Result<()> {
        self.mutate(|records| {
            if let Some(record) = records
                .iter_mut()
                .find(|r| r.backend == backend && r.id == id)
            {
                record.last_used_at = Utc::now();
            }
            Ok(())
        })
    }

    /// Case-insensitive, any-order substring match over id/name/email/
    /// username/fingerprint (and, per SPEC_FULL.md, origin) across all
    /// backends. When `include_host_agent` is set, also enumerates the host
    /// OpenPGP agent's key list and folds matching keys in (spec §4.1).
    pub fn search(&self, query: &str, include_host_agent: bool) -> Result<Vec<KeyRecord>> {
        let query_lower = query.to_lowercase();
        let mut matches: Vec<KeyRecord> = self
            .load()?
            .into_iter()
            .filter(|r| r.matches_query(&query_lower))
            .collect();

        if include_host_agent {
            if let Ok(agent_keys) = crate::fetch::agent::list_keys(&self.config.gpg_binary) {
                matches.extend(
                    agent_keys
                        .into_iter()
                        .map(host_agent_record)
                        .filter(|r| r.matches_query(&query_lower)),
                );
            }
        }

        Ok(matches)
    }

    pub fn groups(&self) -> Result<GroupFile> {
        GroupFile::load(&self.config.groups_path())
    }

    pub fn save_groups(&self, groups: &GroupFile) -> Result<()> {
        groups.save(&self.config.groups_path())
    }
}

/// Wraps a host-agent-enumerated key as a transient, unpersisted `KeyRecord`
/// so it can flow through the same `matches_query` filter as stored records.
fn host_agent_record(key: crate::fetch::agent::HostAgentKey) -> KeyRecord {
    let email = key.uids.iter().find_map(|uid| {
        let rest = uid.split('<').nth(1)?;
        rest.split('>').next().map(|s| s.to_string())
    });
    let name = if key.uids.is_empty() {
        None
    } else {
        Some(key.uids.join(", "))
    };
    let added_at = key
        .created
        .parse::<i64>()
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    KeyRecord {
        id: key.key_id.clone(),
        backend: Backend::HostAgent,
        key_kind: KeyKind::OpenpgpArmored,
        fingerprint: key.key_id,
        public_path: PathBuf::new(),
        private_path: None,
        email,
        username: None,
        name,
        added_at,
        last_used_at: added_at,
        source_url_or_origin: Some("host-agent".to_string()),
    }
}

/// Generates a 4096-bit RSA keypair and returns (private_pem, public_pem),
/// PKCS8-encoded, for `KeyStore::put_self` (spec §4.1 `put_self`).
pub fn generate_self_keypair() -> Result<(String, String)> {
    use rsa::pkcs8::LineEnding;
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, 4096).map_err(|e| DedpasteError::Pkcs8(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| DedpasteError::Pkcs8(e.to_string()))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| DedpasteError::Pkcs8(e.to_string()))?;

    Ok((private_pem, public_pem))
}

/// Reads a PEM-encoded RSA private key from disk.
pub fn load_rsa_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| DedpasteError::Pkcs8(e.to_string()))
}

/// Reads a PEM-encoded RSA public key from disk.
pub fn load_rsa_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = fs::read_to_string(path)?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| DedpasteError::Pkcs8(e.to_string()))
}

/// Reads an ASCII-armored OpenPGP certificate from disk.
pub fn load_cert(path: &Path) -> Result<Cert> {
    let armored = fs::read_to_string(path)?;
    Cert::from_str(&armored).map_err(DedpasteError::OpenPgp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::LineEnding;

    fn test_store() -> (KeyStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.home = dir.path().to_path_buf();
        (KeyStore::new(config), dir)
    }

    // Small key size: fast to generate, fine for exercising the store logic.
    fn test_rsa_pem_pair() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        (
            private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        )
    }

    #[test]
    fn put_self_then_get_self_roundtrips() {
        let (store, _dir) = test_store();
        let (private_pem, public_pem) = test_rsa_pem_pair();
        let record = store.put_self(&private_pem, &public_pem).unwrap();

        let fetched = store.get_self().unwrap().expect("self record present");
        assert_eq!(fetched.fingerprint, record.fingerprint);
        assert!(fetched.private_path.is_some());
        assert!(fetched.public_path.exists());
    }

    #[test]
    fn put_self_replaces_previous_self() {
        let (store, _dir) = test_store();
        let (p1, pub1) = test_rsa_pem_pair();
        store.put_self(&p1, &pub1).unwrap();
        let (p2, pub2) = test_rsa_pem_pair();
        let second = store.put_self(&p2, &pub2).unwrap();

        let all = store.load().unwrap();
        let selfs: Vec<_> = all.iter().filter(|r| r.backend == Backend::SelfBackend).collect();
        assert_eq!(selfs.len(), 1);
        assert_eq!(selfs[0].fingerprint, second.fingerprint);
    }

    #[test]
    fn put_friend_rejects_pgp_armor() {
        let (store, _dir) = test_store();
        let err = store
            .put_friend("alice", "-----BEGIN PGP PUBLIC KEY BLOCK-----\nbogus")
            .unwrap_err();
        assert!(matches!(err, DedpasteError::WrongKeyKind { .. }));
    }

    #[test]
    fn remove_is_idempotent() {
        let (store, _dir) = test_store();
        let (_, pub1) = test_rsa_pem_pair();
        store
            .put_public_key(Backend::Friend, "bob", &pub1, None, None, None)
            .unwrap();

        assert!(store.remove(Some(Backend::Friend), "bob").unwrap());
        assert!(!store.remove(Some(Backend::Friend), "bob").unwrap());
    }

    #[test]
    fn update_last_used_is_idempotent_and_repeatable() {
        let (store, _dir) = test_store();
        let (_, pub1) = test_rsa_pem_pair();
        store
            .put_public_key(Backend::Friend, "carol", &pub1, None, None, None)
            .unwrap();

        store.update_last_used(Backend::Friend, "carol").unwrap();
        let first = store.get(Some(Backend::Friend), "carol").unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.update_last_used(Backend::Friend, "carol").unwrap();
        let second = store.get(Some(Backend::Friend), "carol").unwrap().unwrap();

        assert!(second.last_used_at >= first.last_used_at);
    }

    #[test]
    fn search_matches_case_insensitive_substring() {
        let (store, _dir) = test_store();
        let (_, pub1) = test_rsa_pem_pair();
        store
            .put_public_key(
                Backend::Friend,
                "dave",
                &pub1,
                Some("dave@example.com".into()),
                None,
                None,
            )
            .unwrap();

        let found = store.search("DAVE@EXAMPLE", false).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "dave");
    }

    #[test]
    fn search_without_host_agent_ignores_agent_keys() {
        let (store, _dir) = test_store();
        // `gpg` is very unlikely to be on the CI PATH and have no matching
        // key, but the point of this test is that a `false` flag never even
        // tries: stored-only results come back regardless.
        let found = store.search("nonexistent-query-xyz", false).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn corrupt_database_is_treated_as_empty() {
        let (store, _dir) = test_store();
        store.config.ensure_layout().unwrap();
        fs::write(store.config.keydb_path(), "{ not json").unwrap();

        let records = store.load().unwrap();
        assert!(records.is_empty());
    }
}
