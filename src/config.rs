//! Process-wide configuration for the secure-messaging core.
//!
//! Values here correspond to the configuration surface named in the design's
//! external-interfaces section ("Configuration recognized by the core").
//! The CLI parser, environment, and config file are all owned by the caller;
//! this struct is the contract between them and the core.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default HKP keyservers, tried in order (§4.2).
pub const DEFAULT_KEYSERVERS: &[&str] = &[
    "https://keys.openpgp.org",
    "https://keyserver.ubuntu.com",
    "https://pgp.mit.edu",
];

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk layout, normally `~/.dedpaste`.
    pub home: PathBuf,

    /// HKP keyservers tried in order on fetch.
    pub keyservers: Vec<String>,

    /// Executable name (or path) used to invoke the host OpenPGP agent.
    pub gpg_binary: String,

    /// Use the host agent for OpenPGP decryption before falling back to an
    /// in-process private key.
    pub use_host_agent: bool,

    /// Allow the resolver to reach out to keyservers/Keybase/GitHub.
    pub auto_fetch: bool,

    /// Bypass the GitHub key fetch cache.
    pub refresh_github_keys: bool,

    /// Require at least one verified Keybase proof before trusting a fetched key.
    pub verify_keybase_proofs: bool,

    /// Prefer the OpenPGP path even for RSA-natured recipients.
    pub force_pgp: bool,

    /// Wall-clock timeout for key-listing network calls.
    pub fetch_timeout: Duration,

    /// Wall-clock timeout for key-export network calls.
    pub export_timeout: Duration,

    /// Wall-clock timeout for host-agent invocations and in-process OpenPGP decryption.
    pub crypto_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs2::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dedpaste");

        Config {
            home,
            keyservers: DEFAULT_KEYSERVERS.iter().map(|s| s.to_string()).collect(),
            gpg_binary: "gpg".to_string(),
            use_host_agent: false,
            auto_fetch: true,
            refresh_github_keys: false,
            verify_keybase_proofs: false,
            force_pgp: false,
            fetch_timeout: Duration::from_secs(8),
            export_timeout: Duration::from_secs(12),
            crypto_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Layers `DEDPASTE_HOME`, `DEDPASTE_KEYSERVERS` (comma-separated), and
    /// `DEDPASTE_GPG_BIN` over the defaults. Never touches argv; the CLI layer
    /// owns argument parsing and calls this for the parts it doesn't override.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Ok(home) = std::env::var("DEDPASTE_HOME") {
            cfg.home = PathBuf::from(home);
        }
        if let Ok(servers) = std::env::var("DEDPASTE_KEYSERVERS") {
            cfg.keyservers = servers.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(bin) = std::env::var("DEDPASTE_GPG_BIN") {
            cfg.gpg_binary = bin;
        }
        cfg
    }

    /// Layers `config.json` under `home`, then `from_env`'s environment
    /// variables, over the defaults — file first, then env so ad hoc shell
    /// overrides always win.
    pub fn from_env_and_file(home: &Path) -> Self {
        let mut cfg = Config {
            home: home.to_path_buf(),
            ..Config::default()
        };

        let config_path = home.join("config.json");
        if let Ok(raw) = std::fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<FileConfig>(&raw) {
                file_cfg.apply(&mut cfg);
            }
        }

        let env_cfg = Config::from_env();
        if std::env::var("DEDPASTE_HOME").is_ok() {
            cfg.home = env_cfg.home;
        }
        if std::env::var("DEDPASTE_KEYSERVERS").is_ok() {
            cfg.keyservers = env_cfg.keyservers;
        }
        if std::env::var("DEDPASTE_GPG_BIN").is_ok() {
            cfg.gpg_binary = env_cfg.gpg_binary;
        }

        cfg
    }

    pub fn keydb_path(&self) -> PathBuf {
        self.home.join("keydb.json")
    }

    pub fn groups_path(&self) -> PathBuf {
        self.home.join("groups.json")
    }

    pub fn backend_dir(&self, backend: &str) -> PathBuf {
        match backend {
            "self" => self.home.join("keys"),
            "friend" => self.home.join("friends"),
            other => self.home.join(other),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.home.clone(),
            self.backend_dir("self"),
            self.backend_dir("friend"),
            self.backend_dir("pgp"),
            self.backend_dir("keybase"),
            self.backend_dir("github"),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// The subset of `Config` a `config.json` file may override; every field is
/// optional so a partial file only overrides what it names.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    keyservers: Option<Vec<String>>,
    gpg_binary: Option<String>,
    use_host_agent: Option<bool>,
    auto_fetch: Option<bool>,
    refresh_github_keys: Option<bool>,
    verify_keybase_proofs: Option<bool>,
    force_pgp: Option<bool>,
}

impl FileConfig {
    fn apply(self, cfg: &mut Config) {
        if let Some(v) = self.keyservers {
            cfg.keyservers = v;
        }
        if let Some(v) = self.gpg_binary {
            cfg.gpg_binary = v;
        }
        if let Some(v) = self.use_host_agent {
            cfg.use_host_agent = v;
        }
        if let Some(v) = self.auto_fetch {
            cfg.auto_fetch = v;
        }
        if let Some(v) = self.refresh_github_keys {
            cfg.refresh_github_keys = v;
        }
        if let Some(v) = self.verify_keybase_proofs {
            cfg.verify_keybase_proofs = v;
        }
        if let Some(v) = self.force_pgp {
            cfg.force_pgp = v;
        }
    }
}

/// Returns `path` unchanged if absolute, else joins it under `base`.
pub fn resolve_under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_and_file_applies_partial_config_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"gpg_binary": "gpg2", "force_pgp": true}"#,
        )
        .unwrap();

        let cfg = Config::from_env_and_file(dir.path());
        assert_eq!(cfg.gpg_binary, "gpg2");
        assert!(cfg.force_pgp);
        assert_eq!(cfg.keyservers, Config::default().keyservers);
    }

    #[test]
    fn from_env_and_file_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_env_and_file(dir.path());
        assert_eq!(cfg.home, dir.path());
    }

    #[test]
    fn backend_dir_maps_known_and_unknown_names() {
        let cfg = Config::default();
        assert_eq!(cfg.backend_dir("self"), cfg.home.join("keys"));
        assert_eq!(cfg.backend_dir("pgp"), cfg.home.join("pgp"));
    }
}
