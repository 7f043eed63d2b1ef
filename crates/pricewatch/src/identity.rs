//! Identity pool — reusable browsing identities with deterministic rotation.
//!
//! An identity bundles a browser fingerprint, optional proxy endpoint, and
//! cookie state so requests appear to originate from one consistent client.
//! Identities age out by use-count and wall-clock age, never randomly, so
//! rotation is reproducible under test.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::FetchStatus;

/// Lifecycle state of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    /// Synthesized but never used.
    Fresh,
    /// In rotation.
    Active,
    /// Observed a soft block; unavailable until the cool-down passes.
    Cooling,
    /// Burned or aged out. Never assigned again.
    Retired,
}

/// A realistic browser fingerprint used when synthesizing identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub language: String,
    pub platform: String,
}

impl BrowserProfile {
    /// Built-in profile set covering the common desktop platforms.
    pub fn builtin() -> Vec<BrowserProfile> {
        vec![
            BrowserProfile {
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                    .to_string(),
                viewport: (1920, 1080),
                language: "en-US,en;q=0.9".to_string(),
                platform: "Win32".to_string(),
            },
            BrowserProfile {
                user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                    .to_string(),
                viewport: (1440, 900),
                language: "en-US,en;q=0.9".to_string(),
                platform: "MacIntel".to_string(),
            },
            BrowserProfile {
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                    .to_string(),
                viewport: (1920, 1080),
                language: "en-US,en;q=0.9".to_string(),
                platform: "Linux x86_64".to_string(),
            },
            BrowserProfile {
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) \
                             Gecko/20100101 Firefox/133.0"
                    .to_string(),
                viewport: (1366, 768),
                language: "en-US,en;q=0.5".to_string(),
                platform: "Win32".to_string(),
            },
        ]
    }
}

/// One browsing identity, owned exclusively by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub profile: BrowserProfile,
    pub proxy: Option<String>,
    /// Session cookie jar. Discarded on retirement so a blocked fingerprint
    /// never carries its session forward.
    pub cookies: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub status: IdentityStatus,
}

/// Rotation and capacity knobs for the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityPoolConfig {
    /// Maximum identities per target.
    pub capacity: usize,
    /// Retire after this many releases.
    pub max_use_count: u32,
    /// Retire after this many minutes of age.
    pub max_age_minutes: i64,
    /// Cool-down applied on a soft block, in minutes.
    pub cooldown_minutes: i64,
    /// Proxy endpoints assigned round-robin at synthesis time.
    pub proxies: Vec<String>,
    /// Fingerprint profiles cycled at synthesis time.
    pub profiles: Vec<BrowserProfile>,
}

impl Default for IdentityPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            max_use_count: 100,
            max_age_minutes: 45,
            cooldown_minutes: 10,
            proxies: Vec::new(),
            profiles: BrowserProfile::builtin(),
        }
    }
}

/// Pool of identities, partitioned per target.
pub struct IdentityPool {
    config: IdentityPoolConfig,
    identities: HashMap<String, Vec<Identity>>,
    next_seq: u64,
    next_proxy: usize,
    next_profile: usize,
    retired_total: u64,
}

impl IdentityPool {
    pub fn new(config: IdentityPoolConfig) -> Self {
        Self {
            config,
            identities: HashMap::new(),
            next_seq: 0,
            next_proxy: 0,
            next_profile: 0,
            retired_total: 0,
        }
    }

    /// Select the least-recently-used usable identity for the target,
    /// synthesizing a fresh one if the pool is below capacity.
    ///
    /// Returns `CoreError::IdentityExhausted` when the pool is at capacity
    /// and every identity is cooling or retired.
    pub fn acquire(&mut self, target: &str, now: DateTime<Utc>) -> CoreResult<Identity> {
        self.expire(target, now);

        let entries = self.identities.entry(target.to_string()).or_default();

        let mut best: Option<usize> = None;
        for (i, identity) in entries.iter().enumerate() {
            if !matches!(
                identity.status,
                IdentityStatus::Fresh | IdentityStatus::Active
            ) {
                continue;
            }
            match best {
                Some(b) if entries[b].last_used <= identity.last_used => {}
                _ => best = Some(i),
            }
        }

        if let Some(i) = best {
            let identity = &mut entries[i];
            identity.status = IdentityStatus::Active;
            return Ok(identity.clone());
        }

        let live = entries
            .iter()
            .filter(|i| i.status != IdentityStatus::Retired)
            .count();
        if live >= self.config.capacity {
            tracing::warn!(target, "identity pool exhausted");
            return Err(CoreError::IdentityExhausted(target.to_string()));
        }

        let identity = self.synthesize(target, now);
        tracing::debug!(target, identity = %identity.id, "synthesized fresh identity");
        self.identities
            .entry(target.to_string())
            .or_default()
            .push(identity.clone());
        Ok(identity)
    }

    /// Record the outcome of a fetch made with this identity and return it
    /// to rotation, retiring it when burned or worn out.
    pub fn release(
        &mut self,
        target: &str,
        identity_id: &str,
        outcome: FetchStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let cooldown = Duration::minutes(self.config.cooldown_minutes);
        let max_uses = self.config.max_use_count;
        let max_age = Duration::minutes(self.config.max_age_minutes);

        let identity = self
            .find_mut(target, identity_id)
            .ok_or_else(|| CoreError::UnknownIdentity(identity_id.to_string()))?;

        identity.use_count += 1;
        identity.last_used = now;

        let aged_out = now - identity.created_at > max_age;
        if outcome == FetchStatus::HardBlock || identity.use_count > max_uses || aged_out {
            Self::retire_entry(identity);
            self.retired_total += 1;
            tracing::info!(target, identity = identity_id, %outcome, "identity retired");
            return Ok(());
        }

        if outcome == FetchStatus::SoftBlock {
            identity.status = IdentityStatus::Cooling;
            identity.cooldown_until = Some(now + cooldown);
            tracing::debug!(target, identity = identity_id, "identity cooling");
        } else {
            identity.status = IdentityStatus::Active;
        }
        Ok(())
    }

    /// Return an identity to rotation without recording an outcome; used
    /// when a run is cancelled before its fetch completed.
    pub fn release_unused(&mut self, target: &str, identity_id: &str) {
        if let Some(identity) = self.find_mut(target, identity_id) {
            if identity.status != IdentityStatus::Retired {
                identity.status = IdentityStatus::Active;
            }
        }
    }

    /// Force-retire an identity, discarding its session state.
    pub fn retire(&mut self, target: &str, identity_id: &str) -> CoreResult<()> {
        let identity = self
            .find_mut(target, identity_id)
            .ok_or_else(|| CoreError::UnknownIdentity(identity_id.to_string()))?;
        Self::retire_entry(identity);
        self.retired_total += 1;
        Ok(())
    }

    /// Merge cookies observed during a fetch back into the identity.
    pub fn update_cookies(
        &mut self,
        target: &str,
        identity_id: &str,
        cookies: HashMap<String, String>,
    ) {
        if let Some(identity) = self.find_mut(target, identity_id) {
            if identity.status != IdentityStatus::Retired {
                identity.cookies.extend(cookies);
            }
        }
    }

    /// Live (non-retired) identity count for a target.
    pub fn live_count(&self, target: &str) -> usize {
        self.identities
            .get(target)
            .map(|v| {
                v.iter()
                    .filter(|i| i.status != IdentityStatus::Retired)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Total identities retired since startup.
    pub fn retired_total(&self) -> u64 {
        self.retired_total
    }

    /// Drop retired identities; the scheduler's cleanup job calls this.
    pub fn sweep(&mut self) {
        for entries in self.identities.values_mut() {
            entries.retain(|i| i.status != IdentityStatus::Retired);
        }
    }

    fn retire_entry(identity: &mut Identity) {
        identity.status = IdentityStatus::Retired;
        identity.cookies.clear();
        identity.cooldown_until = None;
    }

    /// Revive cooled identities whose cool-down has passed.
    fn expire(&mut self, target: &str, now: DateTime<Utc>) {
        if let Some(entries) = self.identities.get_mut(target) {
            for identity in entries.iter_mut() {
                if identity.status == IdentityStatus::Cooling {
                    if let Some(until) = identity.cooldown_until {
                        if now >= until {
                            identity.status = IdentityStatus::Active;
                            identity.cooldown_until = None;
                        }
                    }
                }
            }
        }
    }

    fn synthesize(&mut self, target: &str, now: DateTime<Utc>) -> Identity {
        self.next_seq += 1;
        let profile = if self.config.profiles.is_empty() {
            BrowserProfile::builtin().remove(0)
        } else {
            let p = self.config.profiles[self.next_profile % self.config.profiles.len()].clone();
            self.next_profile += 1;
            p
        };
        let proxy = if self.config.proxies.is_empty() {
            None
        } else {
            let p = self.config.proxies[self.next_proxy % self.config.proxies.len()].clone();
            self.next_proxy += 1;
            Some(p)
        };
        Identity {
            id: format!("{target}-{}", self.next_seq),
            profile,
            proxy,
            cookies: HashMap::new(),
            created_at: now,
            last_used: now,
            use_count: 0,
            cooldown_until: None,
            status: IdentityStatus::Fresh,
        }
    }

    fn find_mut(&mut self, target: &str, identity_id: &str) -> Option<&mut Identity> {
        self.identities
            .get_mut(target)?
            .iter_mut()
            .find(|i| i.id == identity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(capacity: usize, max_uses: u32) -> IdentityPool {
        IdentityPool::new(IdentityPoolConfig {
            capacity,
            max_use_count: max_uses,
            max_age_minutes: 45,
            cooldown_minutes: 10,
            proxies: vec!["proxy-a:8080".to_string(), "proxy-b:8080".to_string()],
            profiles: BrowserProfile::builtin(),
        })
    }

    #[test]
    fn test_acquire_synthesizes_up_to_capacity() {
        let mut pool = pool_with(2, 100);
        let now = Utc::now();

        let a = pool.acquire("shop.example", now).unwrap();
        pool.release("shop.example", &a.id, FetchStatus::SoftBlock, now)
            .unwrap();
        let b = pool.acquire("shop.example", now).unwrap();
        pool.release("shop.example", &b.id, FetchStatus::SoftBlock, now)
            .unwrap();
        assert_ne!(a.id, b.id);

        // Both cooling and pool at capacity.
        let err = pool.acquire("shop.example", now).unwrap_err();
        assert!(matches!(err, CoreError::IdentityExhausted(_)));
    }

    #[test]
    fn test_proxies_assigned_round_robin() {
        let mut pool = pool_with(4, 100);
        let now = Utc::now();
        let a = pool.acquire("shop.example", now).unwrap();
        pool.release("shop.example", &a.id, FetchStatus::SoftBlock, now)
            .unwrap();
        let b = pool.acquire("shop.example", now).unwrap();
        assert_eq!(a.proxy.as_deref(), Some("proxy-a:8080"));
        assert_eq!(b.proxy.as_deref(), Some("proxy-b:8080"));
    }

    #[test]
    fn test_lru_selection_prefers_least_recently_used() {
        let mut pool = pool_with(4, 100);
        let t0 = Utc::now();
        let a = pool.acquire("shop.example", t0).unwrap();
        pool.release("shop.example", &a.id, FetchStatus::Success, t0)
            .unwrap();
        let b = pool.acquire("shop.example", t0).unwrap();
        let t1 = t0 + Duration::minutes(1);
        pool.release("shop.example", &b.id, FetchStatus::Success, t1)
            .unwrap();

        // `a` was used at t0, `b` at t1; LRU must pick `a`.
        let next = pool.acquire("shop.example", t1 + Duration::seconds(1)).unwrap();
        assert_eq!(next.id, a.id);
    }

    #[test]
    fn test_use_count_strictly_increases_and_retires_past_threshold() {
        let mut pool = pool_with(1, 3);
        let now = Utc::now();
        let id = pool.acquire("shop.example", now).unwrap().id;

        // Releases 1..=3 stay within max_use_count; each strictly increments.
        for expected in 1..=3u32 {
            pool.release("shop.example", &id, FetchStatus::Success, now)
                .unwrap();
            assert_eq!(pool.live_count("shop.example"), 1, "not retired early");
            let again = pool.acquire("shop.example", now).unwrap();
            assert_eq!(again.use_count, expected);
        }
        // The fourth release exceeds the maximum and retires the identity.
        pool.release("shop.example", &id, FetchStatus::Success, now)
            .unwrap();
        assert_eq!(pool.live_count("shop.example"), 0);
    }

    #[test]
    fn test_hard_block_retires_immediately_and_discards_cookies() {
        let mut pool = pool_with(2, 100);
        let now = Utc::now();
        let id = pool.acquire("shop.example", now).unwrap().id;
        pool.update_cookies(
            "shop.example",
            &id,
            HashMap::from([("session".to_string(), "abc".to_string())]),
        );

        pool.release("shop.example", &id, FetchStatus::HardBlock, now)
            .unwrap();
        assert_eq!(pool.live_count("shop.example"), 0);
        assert_eq!(pool.retired_total(), 1);

        // A new acquire must synthesize, never resurrect the burned session.
        let fresh = pool.acquire("shop.example", now).unwrap();
        assert_ne!(fresh.id, id);
        assert!(fresh.cookies.is_empty());
    }

    #[test]
    fn test_cooling_identity_revived_after_cooldown() {
        let mut pool = pool_with(1, 100);
        let t0 = Utc::now();
        let id = pool.acquire("shop.example", t0).unwrap().id;
        pool.release("shop.example", &id, FetchStatus::SoftBlock, t0)
            .unwrap();

        assert!(pool.acquire("shop.example", t0).is_err());
        let after = t0 + Duration::minutes(11);
        let revived = pool.acquire("shop.example", after).unwrap();
        assert_eq!(revived.id, id);
    }

    #[test]
    fn test_age_based_retirement() {
        let mut pool = pool_with(2, 100);
        let t0 = Utc::now();
        let id = pool.acquire("shop.example", t0).unwrap().id;
        let old = t0 + Duration::minutes(46);
        pool.release("shop.example", &id, FetchStatus::Success, old)
            .unwrap();
        assert_eq!(pool.live_count("shop.example"), 0);
    }

    #[test]
    fn test_sweep_drops_retired() {
        let mut pool = pool_with(2, 100);
        let now = Utc::now();
        let id = pool.acquire("shop.example", now).unwrap().id;
        pool.retire("shop.example", &id).unwrap();
        pool.sweep();
        assert_eq!(pool.live_count("shop.example"), 0);
        assert!(pool.acquire("shop.example", now).is_ok());
    }
}
