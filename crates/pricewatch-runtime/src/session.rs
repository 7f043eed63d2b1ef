//! Scoped identity checkout.
//!
//! A `SessionGuard` borrows one identity from the pool for the duration
//! of a fetch. Callers report the fetch outcome through `finish`; if a
//! worker unwinds or bails early the guard's `Drop` returns the
//! identity to rotation without recording an outcome, so a crashed run
//! never leaks or mis-scores an identity.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use pricewatch::{CoreResult, FetchStatus, Identity, IdentityPool};

pub type SharedPool = Arc<Mutex<IdentityPool>>;

pub struct SessionGuard {
    pool: SharedPool,
    target: String,
    identity: Identity,
    finished: bool,
}

impl SessionGuard {
    /// Check out the least-recently-used identity for the target.
    pub fn acquire(pool: &SharedPool, target: &str, now: DateTime<Utc>) -> CoreResult<Self> {
        let identity = lock(pool).acquire(target, now)?;
        Ok(Self {
            pool: Arc::clone(pool),
            target: target.to_string(),
            identity,
            finished: false,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Report the fetch outcome and return the identity to the pool.
    pub fn finish(mut self, outcome: FetchStatus, now: DateTime<Utc>) -> CoreResult<()> {
        self.finished = true;
        lock(&self.pool).release(&self.target, &self.identity.id, outcome, now)
    }

    /// Merge cookies observed during the fetch back into the identity.
    pub fn store_cookies(&self, cookies: std::collections::HashMap<String, String>) {
        lock(&self.pool).update_cookies(&self.target, &self.identity.id, cookies);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.pool).release_unused(&self.target, &self.identity.id);
        }
    }
}

fn lock(pool: &SharedPool) -> std::sync::MutexGuard<'_, IdentityPool> {
    match pool.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch::IdentityPoolConfig;

    fn shared_pool(capacity: usize) -> SharedPool {
        Arc::new(Mutex::new(IdentityPool::new(IdentityPoolConfig {
            capacity,
            ..Default::default()
        })))
    }

    #[test]
    fn test_finish_records_outcome() {
        let pool = shared_pool(2);
        let now = Utc::now();
        let guard = SessionGuard::acquire(&pool, "shop.example", now).unwrap();
        let id = guard.identity().id.clone();
        guard.finish(FetchStatus::HardBlock, now).unwrap();

        // Hard block retires the identity; a new acquire synthesizes.
        let next = SessionGuard::acquire(&pool, "shop.example", now).unwrap();
        assert_ne!(next.identity().id, id);
    }

    #[test]
    fn test_drop_without_finish_returns_identity() {
        let pool = shared_pool(1);
        let now = Utc::now();
        let id = {
            let guard = SessionGuard::acquire(&pool, "shop.example", now).unwrap();
            guard.identity().id.clone()
            // dropped here without finish
        };

        // Capacity is 1, so a successful re-acquire proves the guard
        // returned the identity instead of leaking it.
        let again = SessionGuard::acquire(&pool, "shop.example", now).unwrap();
        assert_eq!(again.identity().id, id);
        // use_count untouched by the abandoned session
        assert_eq!(again.identity().use_count, 0);
    }

    #[test]
    fn test_cookies_survive_successful_session() {
        let pool = shared_pool(1);
        let now = Utc::now();
        let guard = SessionGuard::acquire(&pool, "shop.example", now).unwrap();
        guard.store_cookies(std::collections::HashMap::from([(
            "session".to_string(),
            "abc".to_string(),
        )]));
        guard.finish(FetchStatus::Success, now).unwrap();

        let again = SessionGuard::acquire(&pool, "shop.example", now).unwrap();
        assert_eq!(again.identity().cookies.get("session").map(String::as_str), Some("abc"));
    }
}
