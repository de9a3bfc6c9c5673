//! C2 External Key Fetchers: HKP keyservers, Keybase, GitHub, and the host
//! OpenPGP agent (spec §4.2).

pub mod agent;
pub mod github;
pub mod hkp;
pub mod keybase;

use crate::config::Config;
use reqwest::blocking::Client;

/// Bundles the shared HTTP client and per-source fetchers that the resolver
/// (C3) reaches into.
pub struct Fetchers {
    pub client: Client,
    pub github: github::GithubFetcher,
}

impl Fetchers {
    pub fn new() -> Self {
        Fetchers {
            client: Client::new(),
            github: github::GithubFetcher::new(),
        }
    }

    pub fn fetch_hkp(&self, config: &Config, identifier: &str) -> crate::error::Result<hkp::HkpResult> {
        hkp::fetch(&self.client, &config.keyservers, identifier, config.fetch_timeout)
    }

    pub fn fetch_keybase(
        &self,
        config: &Config,
        username: &str,
    ) -> crate::error::Result<keybase::KeybaseResult> {
        keybase::fetch(
            &self.client,
            username,
            config.verify_keybase_proofs,
            config.fetch_timeout,
        )
    }

    pub fn fetch_github(&self, config: &Config, username: &str) -> crate::error::Result<String> {
        self.github
            .fetch(&self.client, username, config.refresh_github_keys, config.export_timeout)
    }
}

impl Default for Fetchers {
    fn default() -> Self {
        Self::new()
    }
}
