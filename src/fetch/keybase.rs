//! Keybase fetcher (spec §4.2, §6).

use crate::error::{DedpasteError, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;

const LOOKUP_URL: &str = "https://keybase.io/_/api/1.0/user/lookup.json";

#[derive(Deserialize)]
struct LookupResponse {
    status: Status,
    them: Vec<Option<UserEntry>>,
}

#[derive(Deserialize)]
struct Status {
    code: i64,
}

#[derive(Deserialize)]
struct UserEntry {
    public_keys: Option<PublicKeys>,
    proofs_summary: Option<ProofsSummary>,
}

#[derive(Deserialize)]
struct PublicKeys {
    primary: Option<PrimaryKey>,
}

#[derive(Deserialize)]
struct PrimaryKey {
    bundle: String,
}

#[derive(Deserialize)]
struct ProofsSummary {
    all: Vec<Proof>,
}

#[derive(Deserialize)]
struct Proof {
    state: i64,
}

pub struct KeybaseResult {
    pub armored: String,
}

/// Looks up `username` via the Keybase public API. With `verify = true`,
/// requires at least one proof with `state == 1` (spec §4.2), raising
/// `UnverifiedKeybaseUser` otherwise.
pub fn fetch(client: &Client, username: &str, verify: bool, timeout: Duration) -> Result<KeybaseResult> {
    let fields = if verify {
        "public_keys,proofs_summary"
    } else {
        "public_keys"
    };
    let response = client
        .get(LOOKUP_URL)
        .query(&[("username", username), ("fields", fields)])
        .timeout(timeout)
        .send()?;

    if !response.status().is_success() {
        return Err(DedpasteError::KeyserverUnavailable(format!(
            "keybase: HTTP {}",
            response.status()
        )));
    }

    let parsed: LookupResponse = response.json()?;
    if parsed.status.code != 0 {
        return Err(DedpasteError::KeyserverUnavailable(format!(
            "keybase: status code {}",
            parsed.status.code
        )));
    }

    let user = parsed
        .them
        .into_iter()
        .flatten()
        .next()
        .ok_or_else(|| DedpasteError::RecipientNotFound(username.to_string()))?;

    if verify {
        let has_verified_proof = user
            .proofs_summary
            .map(|summary| summary.all.iter().any(|p| p.state == 1))
            .unwrap_or(false);
        if !has_verified_proof {
            return Err(DedpasteError::UnverifiedKeybaseUser(username.to_string()));
        }
    }

    let bundle = user
        .public_keys
        .and_then(|keys| keys.primary)
        .map(|primary| primary.bundle)
        .ok_or_else(|| DedpasteError::RecipientNotFound(username.to_string()))?;

    Ok(KeybaseResult { armored: bundle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_lookup_response() {
        let json = r#"{
            "status": {"code": 0},
            "them": [{
                "public_keys": {"primary": {"bundle": "-----BEGIN PGP PUBLIC KEY BLOCK-----\nx\n-----END PGP PUBLIC KEY BLOCK-----"}},
                "proofs_summary": {"all": [{"state": 1}]}
            }]
        }"#;
        let parsed: LookupResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status.code, 0);
        assert_eq!(parsed.them.len(), 1);
    }

    #[test]
    fn parses_absent_user_as_null() {
        let json = r#"{"status": {"code": 0}, "them": [null]}"#;
        let parsed: LookupResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.them[0].is_none());
    }
}
