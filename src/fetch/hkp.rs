//! HKP keyserver fetcher (spec §4.2, §6 "Network endpoints consumed").
//!
//! Tries `keys.openpgp.org` (VKS API), `keyserver.ubuntu.com`, then
//! `pgp.mit.edu` in order; the first to return a valid armored key wins. A
//! single server's failure is recovered locally; only exhausting every
//! configured server raises `KeyserverUnavailable`.

use crate::error::{DedpasteError, Result};
use regex::Regex;
use reqwest::blocking::Client;
use std::sync::LazyLock;
use std::time::Duration;

static KEY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)-----BEGIN PGP PUBLIC KEY BLOCK-----.*?-----END PGP PUBLIC KEY BLOCK-----")
        .expect("valid regex")
});

/// The result of a successful HKP lookup.
pub struct HkpResult {
    pub armored: String,
    pub server: String,
}

fn extract_key_block(body: &str) -> Option<String> {
    KEY_BLOCK.find(body).map(|m| m.as_str().to_string())
}

fn strip_0x(identifier: &str) -> &str {
    identifier.strip_prefix("0x").unwrap_or(identifier)
}

fn is_hex_id(identifier: &str) -> bool {
    identifier.len() >= 8 && identifier.chars().all(|c| c.is_ascii_hexdigit())
}

fn request_url(server: &str, identifier: &str) -> String {
    let id = strip_0x(identifier);
    if server.contains("keys.openpgp.org") {
        if identifier.contains('@') {
            format!("{server}/vks/v1/by-email/{id}")
        } else {
            format!("{server}/vks/v1/by-fingerprint/{id}")
        }
    } else {
        format!("{server}/pks/lookup?op=get&options=mr&search={id}")
    }
}

/// Fetches a public key for `identifier` (email, key-ID, or fingerprint),
/// trying every configured server in order.
pub fn fetch(client: &Client, servers: &[String], identifier: &str, timeout: Duration) -> Result<HkpResult> {
    let mut errors = Vec::new();

    for server in servers {
        let url = request_url(server, identifier);
        let attempt = client.get(&url).timeout(timeout).send();
        match attempt {
            Ok(resp) if resp.status().is_success() => match resp.text() {
                Ok(body) => {
                    if let Some(armored) = extract_key_block(&body) {
                        return Ok(HkpResult {
                            armored,
                            server: server.clone(),
                        });
                    }
                    errors.push(format!("{server}: 200 OK but no key block in response"));
                }
                Err(e) => errors.push(format!("{server}: {e}")),
            },
            Ok(resp) => errors.push(format!("{server}: HTTP {}", resp.status())),
            Err(e) if e.is_timeout() => errors.push(format!("{server}: timed out")),
            Err(e) => errors.push(format!("{server}: {e}")),
        }
    }

    Err(DedpasteError::KeyserverUnavailable(errors.join("; ")))
}

/// `true` if `identifier` looks like a hex key-ID or fingerprint rather than
/// an email address or name (spec §4.3 step 2).
pub fn looks_like_hex_id(identifier: &str) -> bool {
    is_hex_id(strip_0x(identifier))
}
