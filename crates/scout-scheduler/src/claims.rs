//! Profile claims.
//!
//! A profile is claimed while a dispatch that covers it is running, so the
//! loop, manual triggers, and other Scout processes sharing the database
//! never run the same profile twice at once. Claims live in the store and
//! are keyed by the scheduler instance that holds them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use scout_store::{ProfileId, Store, StoreError};

use crate::Clock;

/// Claims profiles on behalf of one scheduler instance.
#[derive(Clone)]
pub struct Claims {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    owner: Arc<str>,
    ttl: Duration,
}

impl Claims {
    /// `ttl` is how long a claim is honored before another instance may take
    /// it over. It must outlast the longest workflow run.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        owner: impl Into<Arc<str>>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            owner: owner.into(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Claims and jobs older than this are treated as abandoned.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Claim every free id in `ids`.
    ///
    /// Returns the guard holding the claimed ids and the ids that were
    /// already taken.
    pub fn claim(&self, ids: &[ProfileId]) -> Result<(ClaimGuard, Vec<ProfileId>), StoreError> {
        let now = self.clock.now();
        let won = self
            .store
            .claim_profiles(ids, &self.owner, now, self.stale_before(now))?;
        let busy = ids.iter().copied().filter(|id| !won.contains(id)).collect();

        Ok((
            ClaimGuard {
                store: Arc::clone(&self.store),
                owner: Arc::clone(&self.owner),
                ids: won,
            },
            busy,
        ))
    }

    /// Claim a single id, or `None` when it is already held.
    pub fn claim_one(&self, id: ProfileId) -> Result<Option<ClaimGuard>, StoreError> {
        let (guard, busy) = self.claim(&[id])?;
        Ok(busy.is_empty().then_some(guard))
    }
}

/// Releases its claims when dropped.
pub struct ClaimGuard {
    store: Arc<dyn Store>,
    owner: Arc<str>,
    ids: Vec<ProfileId>,
}

impl ClaimGuard {
    /// The ids this guard holds.
    pub fn ids(&self) -> &[ProfileId] {
        &self.ids
    }
}

impl fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("owner", &self.owner)
            .field("ids", &self.ids)
            .finish()
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        // A claim that cannot be released expires after the ttl.
        if let Err(e) = self.store.release_profiles(&self.ids, &self.owner) {
            warn!(owner = %self.owner, ids = ?self.ids, error = %e, "failed to release profile claims");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use pretty_assertions::assert_eq;
    use scout_store::{NewProfile, SqliteStore};

    const TTL: Duration = Duration::from_secs(30 * 60);

    fn setup(count: usize) -> (Arc<SqliteStore>, Arc<ManualClock>, Vec<ProfileId>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ids = (0..count)
            .map(|i| {
                store
                    .insert_profile(&NewProfile::new(format!("https://x/{i}"), "P"), clock.now())
                    .unwrap()
                    .id
            })
            .collect();
        (store, clock, ids)
    }

    fn claims(store: &Arc<SqliteStore>, clock: &Arc<ManualClock>, owner: &str) -> Claims {
        Claims::new(store.clone(), clock.clone(), owner, TTL)
    }

    #[test]
    fn test_claim_splits_busy_ids() {
        let (store, clock, ids) = setup(3);
        let claims = claims(&store, &clock, "a");
        let first = claims.claim(&ids[..2]).unwrap().0;
        assert_eq!(first.ids(), &ids[..2]);

        let (second, busy) = claims.claim(&ids[1..]).unwrap();
        assert_eq!(second.ids(), &ids[2..]);
        assert_eq!(busy, vec![ids[1]]);
        assert_eq!(store.claimed_profiles().unwrap(), ids);
    }

    #[test]
    fn test_drop_releases() {
        let (store, clock, ids) = setup(1);
        let claims = claims(&store, &clock, "a");
        {
            let _guard = claims.claim_one(ids[0]).unwrap().unwrap();
            assert!(claims.claim_one(ids[0]).unwrap().is_none());
        }
        assert!(store.claimed_profiles().unwrap().is_empty());
        assert!(claims.claim_one(ids[0]).unwrap().is_some());
    }

    #[test]
    fn test_busy_claim_does_not_release_holder() {
        let (store, clock, ids) = setup(1);
        let holder = claims(&store, &clock, "a");
        let other = claims(&store, &clock, "b");

        let _held = holder.claim_one(ids[0]).unwrap().unwrap();
        drop(other.claim(&ids).unwrap().0);
        assert!(other.claim_one(ids[0]).unwrap().is_none());
        assert_eq!(store.claimed_profiles().unwrap(), ids);
    }

    #[test]
    fn test_abandoned_claim_is_taken_over_after_ttl() {
        let (store, clock, ids) = setup(1);
        let crashed = claims(&store, &clock, "a");
        std::mem::forget(crashed.claim_one(ids[0]).unwrap().unwrap());

        let other = claims(&store, &clock, "b");
        assert!(other.claim_one(ids[0]).unwrap().is_none());

        clock.advance(chrono::Duration::minutes(31));
        let taken = other.claim_one(ids[0]).unwrap().unwrap();
        assert_eq!(taken.ids(), &ids[..]);
    }
}
