//! The `KeyRecord` entity and its backend/kind enumerations (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[serde(rename = "self")]
    SelfBackend,
    Friend,
    Pgp,
    Keybase,
    Github,
    /// Not persisted: tags a `KeyRecord` synthesized from the host OpenPGP
    /// agent's key list for a `search(.., include_host_agent: true)` call.
    HostAgent,
}

impl Backend {
    /// Fixed search precedence used by `KeyStore::get(backend: "any", ..)`.
    pub const PRECEDENCE: [Backend; 5] = [
        Backend::SelfBackend,
        Backend::Friend,
        Backend::Pgp,
        Backend::Keybase,
        Backend::Github,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::SelfBackend => "self",
            Backend::Friend => "friend",
            Backend::Pgp => "pgp",
            Backend::Keybase => "keybase",
            Backend::Github => "github",
            Backend::HostAgent => "host_agent",
        }
    }

    pub fn is_openpgp(&self) -> bool {
        !matches!(self, Backend::SelfBackend)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    RsaPem,
    OpenpgpArmored,
}

/// One entry of the key database (spec §3 "KeyRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub backend: Backend,
    pub key_kind: KeyKind,
    pub fingerprint: String,
    pub public_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub added_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url_or_origin: Option<String>,
}

impl KeyRecord {
    /// `true` if the key should be treated as OpenPGP-natured for path selection.
    pub fn is_openpgp(&self) -> bool {
        matches!(self.key_kind, KeyKind::OpenpgpArmored)
    }

    /// Fuzzy-match helper used by `KeyStore::search`: case-insensitive,
    /// any-order substring match over every string attribute, including the
    /// origin URL (supplemented per SPEC_FULL.md — the spec's attribute list
    /// is the floor, not the ceiling, for a fuzzy search). "Any-order"
    /// means each whitespace-separated token of the query must appear
    /// somewhere in the record, independently — not all in the same field,
    /// and not contiguously as typed (spec §4.1): `"alice example"` matches
    /// an entry whose email is `alice@example.com`.
    pub fn matches_query(&self, query_lower: &str) -> bool {
        let fields: [Option<&str>; 6] = [
            Some(self.id.as_str()),
            self.name.as_deref(),
            self.email.as_deref(),
            self.username.as_deref(),
            Some(self.fingerprint.as_str()),
            self.source_url_or_origin.as_deref(),
        ];
        let lowered: Vec<String> = fields.into_iter().flatten().map(|f| f.to_lowercase()).collect();

        query_lower
            .split_whitespace()
            .all(|token| lowered.iter().any(|field| field.contains(token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> KeyRecord {
        KeyRecord {
            id: "dave".to_string(),
            backend: Backend::Friend,
            key_kind: KeyKind::RsaPem,
            fingerprint: "deadbeef".to_string(),
            public_path: PathBuf::from("/dev/null"),
            private_path: None,
            email: Some("alice@example.com".to_string()),
            username: None,
            name: Some("dave".to_string()),
            added_at: Utc::now(),
            last_used_at: Utc::now(),
            source_url_or_origin: None,
        }
    }

    #[test]
    fn matches_tokens_found_independently_in_any_order() {
        let record = record();
        assert!(record.matches_query("alice example"));
        assert!(record.matches_query("example alice"));
        assert!(!record.matches_query("alice nonexistent"));
    }

    #[test]
    fn matches_query_spanning_two_different_fields() {
        let record = record();
        assert!(record.matches_query("dave example"));
    }
}
