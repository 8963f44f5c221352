use tracing::{debug, warn};

use crate::client::{self, PgControlConnection};
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::link_error;

/// Seed every cooperating process folds into the same advisory key.
const LOCK_KEY_SEED: &str = "pglink-topology";

/// Derives the fixed advisory lock key from the constant seed.
///
/// Each character contributes one decimal digit (`ord(c) % 7`), so the key is
/// stable across processes and fits a Postgres bigint.
pub fn advisory_lock_key() -> i64 {
    LOCK_KEY_SEED
        .chars()
        .fold(0i64, |key, c| key * 10 + (c as i64 % 7))
}

/// Session-scoped, non-blocking mutual exclusion over a fixed key, acquired
/// independently on each connection. Guards only the rewind protocol;
/// ordinary lifecycle operations are not lock-protected.
#[derive(Debug, Clone, Copy)]
pub struct AdvisoryLock {
    key: i64,
}

impl AdvisoryLock {
    pub fn new() -> Self {
        Self {
            key: advisory_lock_key(),
        }
    }

    #[cfg(test)]
    pub fn with_key(key: i64) -> Self {
        Self { key }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Attempts to take the lock on one connection. Returns immediately;
    /// `false` means the key is already held elsewhere.
    pub async fn try_acquire(&self, conn: &PgControlConnection) -> LinkResult<bool> {
        let query = format!("SELECT pg_try_advisory_lock({})", self.key);
        let rows = conn.query(&query).await?;
        let row = rows.first().ok_or_else(|| {
            link_error!(ErrorKind::QueryFailed, "advisory lock query returned no row")
        })?;
        let acquired = client::row_bool(row, "pg_try_advisory_lock", "pg_locks")?;

        debug!(
            "advisory lock {} on {}: acquired={acquired}",
            self.key,
            conn.display_name()
        );

        Ok(acquired)
    }

    /// Releases the lock on one connection. Safe to call even when the lock
    /// was never acquired; the engine reports that as a no-op.
    pub async fn release(&self, conn: &PgControlConnection) -> LinkResult<()> {
        let query = format!("SELECT pg_advisory_unlock({})", self.key);
        conn.query(&query).await?;

        Ok(())
    }

    /// Acquires on `a` then `b`. When `b` cannot be taken, the lock on `a` is
    /// released before returning so no lock is left orphaned.
    pub async fn try_acquire_both(
        &self,
        a: &PgControlConnection,
        b: &PgControlConnection,
    ) -> LinkResult<bool> {
        if !self.try_acquire(a).await? {
            return Ok(false);
        }

        if !self.try_acquire(b).await? {
            if let Err(e) = self.release(a).await {
                warn!("failed to release advisory lock after partial acquisition: {e}");
            }
            return Ok(false);
        }

        Ok(true)
    }

    /// Releases on both connections, attempting each regardless of the other's
    /// outcome; failures are aggregated.
    pub async fn release_both(
        &self,
        a: &PgControlConnection,
        b: &PgControlConnection,
    ) -> LinkResult<()> {
        let first = self.release(a).await;
        let second = self.release(b).await;

        match (first, second) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(e1), Err(e2)) => Err(LinkError::many(vec![e1, e2])),
        }
    }
}

impl Default for AdvisoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_is_deterministic() {
        assert_eq!(advisory_lock_key(), advisory_lock_key());
        assert_eq!(AdvisoryLock::new().key(), advisory_lock_key());
    }

    #[test]
    fn key_fits_a_postgres_bigint_with_room() {
        let key = advisory_lock_key();

        assert!(key > 0);
        // One decimal digit per seed character, leading zeros folded away.
        assert!(key < 10i64.pow(LOCK_KEY_SEED.len() as u32));
    }

    #[test]
    fn key_matches_the_seed_fold() {
        assert_eq!(advisory_lock_key(), 53_052_346_063_652);
    }
}
