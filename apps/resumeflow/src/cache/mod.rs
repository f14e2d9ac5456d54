//! Response cache: memoizes expensive deterministic external calls and
//! deduplicates concurrent identical requests.
//!
//! Single-flight protocol: `claim` atomically hands one caller a `ClaimToken`.
//! That caller must finish with exactly one `fulfil` (store the value) or
//! `release` (give up). Every other caller sees `Busy` and either waits for the
//! value to appear or falls through to an uncached call. A claim also carries
//! its own expiry so a crashed holder cannot block the key forever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{keys, KvStore, StoreError};

pub mod fingerprint;

pub use fingerprint::Fingerprint;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub llm_enabled: bool,
    pub scraper_enabled: bool,
    /// Generation results have a stable fingerprint and live longer.
    pub llm_ttl: Duration,
    /// Scraped content is volatile.
    pub scraper_ttl: Duration,
    pub claim_ttl: Duration,
    /// How long a `Busy` caller waits for the holder's value before computing itself.
    pub busy_wait: Duration,
    pub busy_poll_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            llm_enabled: true,
            scraper_enabled: true,
            llm_ttl: Duration::from_secs(86_400),
            scraper_ttl: Duration::from_secs(3_600),
            claim_ttl: Duration::from_secs(300),
            busy_wait: Duration::from_secs(30),
            busy_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Proof of holding the in-flight slot for one fingerprint.
#[derive(Debug)]
#[must_use = "a claim must be fulfilled or released"]
pub struct ClaimToken {
    fingerprint: Fingerprint,
    token: String,
}

impl ClaimToken {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

#[derive(Debug)]
pub enum Claim {
    Claimed(ClaimToken),
    Busy,
}

#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    settings: CacheSettings,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, settings: CacheSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<String>, StoreError> {
        self.store.get(&keys::cache(fingerprint.as_str())).await
    }

    pub async fn set(
        &self,
        fingerprint: &Fingerprint,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set(&keys::cache(fingerprint.as_str()), value, ttl)
            .await
    }

    pub async fn claim(&self, fingerprint: &Fingerprint) -> Result<Claim, StoreError> {
        let token = Uuid::new_v4().to_string();
        let won = self
            .store
            .set_nx(
                &keys::cache_claim(fingerprint.as_str()),
                &token,
                self.settings.claim_ttl,
            )
            .await?;
        if won {
            Ok(Claim::Claimed(ClaimToken {
                fingerprint: fingerprint.clone(),
                token,
            }))
        } else {
            Ok(Claim::Busy)
        }
    }

    /// Gives the slot back. Only removes the marker if it is still ours, so a
    /// holder whose claim already expired cannot clear a newer holder's claim.
    pub async fn release(&self, claim: ClaimToken) -> Result<(), StoreError> {
        self.store
            .delete_if_eq(&keys::cache_claim(claim.fingerprint.as_str()), &claim.token)
            .await?;
        Ok(())
    }

    /// Stores the value, then releases the claim.
    pub async fn fulfil(
        &self,
        claim: ClaimToken,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let stored = self.set(&claim.fingerprint, value, ttl).await;
        let released = self.release(claim).await;
        stored.and(released)
    }

    /// Returns the cached value for `fingerprint`, computing it at most once
    /// among concurrent callers. Store failures degrade to an uncached call.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.lookup::<T>(fingerprint).await {
            return Ok(hit);
        }

        match self.claim(fingerprint).await {
            Ok(Claim::Claimed(claim)) => {
                let outcome = compute().await;
                match &outcome {
                    Ok(value) => match serde_json::to_string(value) {
                        Ok(raw) => {
                            if let Err(e) = self.fulfil(claim, &raw, ttl).await {
                                warn!(%fingerprint, "cache write failed: {e}");
                            }
                        }
                        Err(e) => {
                            warn!(%fingerprint, "cache value not serializable: {e}");
                            self.release_quietly(claim).await;
                        }
                    },
                    Err(_) => self.release_quietly(claim).await,
                }
                outcome
            }
            Ok(Claim::Busy) => {
                debug!(%fingerprint, "cache key busy, waiting for holder");
                if let Some(value) = self.wait_for_holder::<T>(fingerprint).await {
                    return Ok(value);
                }
                debug!(%fingerprint, "holder did not finish in time, computing uncached");
                compute().await
            }
            Err(e) => {
                warn!(%fingerprint, "cache claim failed, computing uncached: {e}");
                compute().await
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, fingerprint: &Fingerprint) -> Option<T> {
        match self.get(fingerprint).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!(%fingerprint, "cache hit");
                    Some(value)
                }
                Err(e) => {
                    warn!(%fingerprint, "discarding undecodable cache entry: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(%fingerprint, "cache read failed: {e}");
                None
            }
        }
    }

    async fn wait_for_holder<T: DeserializeOwned>(&self, fingerprint: &Fingerprint) -> Option<T> {
        let deadline = tokio::time::Instant::now() + self.settings.busy_wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.settings.busy_poll_interval).await;
            if let Some(value) = self.lookup(fingerprint).await {
                return Some(value);
            }
        }
        None
    }

    async fn release_quietly(&self, claim: ClaimToken) {
        let fingerprint = claim.fingerprint.clone();
        if let Err(e) = self.release(claim).await {
            warn!(%fingerprint, "cache claim release failed, relying on claim expiry: {e}");
        }
    }
}
