//! GitHub fetcher (spec §4.2, §6). Fetches the ASCII-armored public key
//! GitHub publishes for a user at `https://github.com/<user>.gpg`, with an
//! in-process cache keyed by username.

use crate::error::{DedpasteError, Result};
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Process-lifetime cache of fetched keys, keyed by GitHub username.
/// `force_refresh` bypasses a hit without evicting it, so a subsequent
/// non-forced call still benefits (spec §8 scenario 3).
pub struct GithubFetcher {
    cache: Mutex<HashMap<String, String>>,
}

impl Default for GithubFetcher {
    fn default() -> Self {
        GithubFetcher {
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl GithubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch(
        &self,
        client: &Client,
        username: &str,
        force_refresh: bool,
        timeout: Duration,
    ) -> Result<String> {
        if !force_refresh {
            if let Some(cached) = self.cache.lock().expect("cache lock poisoned").get(username) {
                return Ok(cached.clone());
            }
        }

        let url = format!("https://github.com/{username}.gpg");
        let response = client.get(&url).timeout(timeout).send()?;

        if !response.status().is_success() {
            return Err(DedpasteError::GithubKeyNotFound(username.to_string()));
        }

        let body = response.text()?;
        if !body.contains("-----BEGIN PGP PUBLIC KEY BLOCK-----") {
            return Err(DedpasteError::GithubKeyNotFound(username.to_string()));
        }

        self.cache
            .lock()
            .expect("cache lock poisoned")
            .insert(username.to_string(), body.clone());

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_starts_empty() {
        let fetcher = GithubFetcher::new();
        assert!(fetcher.cache.lock().unwrap().is_empty());
    }

    #[test]
    fn force_refresh_does_not_evict_existing_cache_entry() {
        let fetcher = GithubFetcher::new();
        fetcher
            .cache
            .lock()
            .unwrap()
            .insert("octocat".to_string(), "cached-key".to_string());
        // force_refresh only means "don't use this cached value now"; it
        // doesn't imply clearing the cache for other callers.
        assert_eq!(
            fetcher.cache.lock().unwrap().get("octocat").cloned(),
            Some("cached-key".to_string())
        );
    }
}
