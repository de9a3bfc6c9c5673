//! Host OpenPGP agent enumerator (spec §4.2 "Host agent enumerator", §6
//! "Host agent interface"). Invokes the configured executable (`gpg` by
//! default) and parses its colon-separated machine-readable output.

use crate::error::Result;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAgentKey {
    pub key_id: String,
    pub uids: Vec<String>,
    pub created: String,
    pub expires: Option<String>,
    pub trust: String,
}

/// `true` if the configured agent executable can be located and run at all;
/// absence is reported this way rather than as an error (spec §4.2).
pub fn is_available(gpg_binary: &str) -> bool {
    Command::new(gpg_binary)
        .arg("--version")
        .output()
        .is_ok()
}

/// Runs `<gpg_binary> --list-keys --with-colons` and parses `pub`/`uid`
/// records into `HostAgentKey`s.
pub fn list_keys(gpg_binary: &str) -> Result<Vec<HostAgentKey>> {
    let output = Command::new(gpg_binary)
        .args(["--list-keys", "--with-colons"])
        .output()?;
    Ok(parse_colon_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses gpg `--with-colons` output: a `pub` record (or `sub` for subkeys)
/// begins a key; record type is column 1, key-ID column 5, creation column
/// 6, expiry column 7, trust column 9. Following `uid` records (column 10)
/// attach to the most recent `pub` record (spec §6).
fn parse_colon_output(output: &str) -> Vec<HostAgentKey> {
    let mut keys: Vec<HostAgentKey> = Vec::new();

    for line in output.lines() {
        let cols: Vec<&str> = line.split(':').collect();
        if cols.is_empty() {
            continue;
        }
        match cols[0] {
            "pub" => {
                keys.push(HostAgentKey {
                    key_id: cols.get(4).unwrap_or(&"").to_string(),
                    uids: Vec::new(),
                    created: cols.get(5).unwrap_or(&"").to_string(),
                    expires: cols
                        .get(6)
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string()),
                    trust: cols.get(8).unwrap_or(&"").to_string(),
                });
            }
            "uid" => {
                if let Some(last) = keys.last_mut() {
                    if let Some(uid) = cols.get(9) {
                        last.uids.push(uid.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    keys
}

/// `<gpg_binary> --export --armor <id>`.
pub fn export_armored(gpg_binary: &str, key_id: &str) -> Result<String> {
    let output = Command::new(gpg_binary)
        .args(["--export", "--armor", key_id])
        .output()?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pub_and_uid_records() {
        let output = "\
tru::1:1700000000:0:3:1:5
pub:u:4096:1:DEADBEEFDEADBEEF:1600000000:1900000000::u:::scESC::::::23::0:
uid:u::::1600000001::ABCDEF1234567890ABCDEF1234567890ABCDEF12::Alice <alice@example.com>::::::::::0:
sub:u:4096:1:0123456789ABCDEF:1600000000:1900000000:::::e:::::23:
";
        let keys = parse_colon_output(output);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id, "DEADBEEFDEADBEEF");
        assert_eq!(keys[0].uids, vec!["Alice <alice@example.com>".to_string()]);
        assert_eq!(keys[0].created, "1600000000");
        assert_eq!(keys[0].expires.as_deref(), Some("1900000000"));
    }

    #[test]
    fn empty_output_yields_no_keys() {
        assert!(parse_colon_output("").is_empty());
    }

    #[test]
    fn missing_agent_reports_unavailable_not_error() {
        assert!(!is_available("definitely-not-a-real-binary-xyz"));
    }
}
