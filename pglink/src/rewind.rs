use std::future::Future;
use std::time::Duration;

use pg_escape::quote_literal;
use tokio_postgres::types::PgLsn;
use tracing::{info, warn};

use crate::bail;
use crate::client::ConnectionPair;
use crate::confirm::Confirmation;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::lock::AdvisoryLock;
use crate::subscriptions::SubscriptionRegistry;

/// Grace period granted to the replication worker between disabling the
/// subscription and advancing the origin. A best-effort drain, not a barrier:
/// a worker may still be mid-flight when it elapses.
pub const REWIND_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Terminal state of a rewind attempt that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindOutcome {
    /// The origin was advanced and the subscription re-enabled.
    Applied,
    /// The operator declined a confirmation; nothing was touched.
    Declined,
}

/// Engine-facing steps the rewind protocol drives.
///
/// Seamed as a trait so the protocol is a function of its inputs plus the
/// injected confirmation decisions.
pub trait RewindOps {
    fn try_acquire_locks(&self) -> impl Future<Output = LinkResult<bool>> + Send;
    fn release_locks(&self) -> impl Future<Output = LinkResult<()>> + Send;
    fn disable_subscription(&self) -> impl Future<Output = LinkResult<()>> + Send;
    fn enable_subscription(&self) -> impl Future<Output = LinkResult<()>> + Send;
    fn advance_origin(
        &self,
        origin: &str,
        target: PgLsn,
    ) -> impl Future<Output = LinkResult<()>> + Send;
}

/// Tracks replay position per subscription and applies guarded rewinds.
#[derive(Debug)]
pub struct OriginController {
    pair: ConnectionPair,
    subscriptions: SubscriptionRegistry,
    lock: AdvisoryLock,
    grace_period: Duration,
}

impl OriginController {
    pub fn new(pair: ConnectionPair) -> Self {
        let subscriptions = SubscriptionRegistry::new(&pair);

        Self {
            pair,
            subscriptions,
            lock: AdvisoryLock::new(),
            grace_period: REWIND_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Rewinds `subscription`'s replay position to `target` under the dual
    /// advisory lock, after two separate operator confirmations.
    pub async fn rewind(
        &self,
        origin: &str,
        subscription: &str,
        target: Option<PgLsn>,
        confirm: &mut dyn Confirmation,
    ) -> LinkResult<RewindOutcome> {
        let bound = BoundRewind {
            controller: self,
            subscription,
        };

        run_rewind(&bound, origin, target, self.grace_period, confirm).await
    }
}

struct BoundRewind<'a> {
    controller: &'a OriginController,
    subscription: &'a str,
}

impl RewindOps for BoundRewind<'_> {
    async fn try_acquire_locks(&self) -> LinkResult<bool> {
        self.controller
            .lock
            .try_acquire_both(&self.controller.pair.source, &self.controller.pair.destination)
            .await
    }

    async fn release_locks(&self) -> LinkResult<()> {
        self.controller
            .lock
            .release_both(&self.controller.pair.source, &self.controller.pair.destination)
            .await
    }

    async fn disable_subscription(&self) -> LinkResult<()> {
        self.controller.subscriptions.disable(self.subscription).await
    }

    async fn enable_subscription(&self) -> LinkResult<()> {
        self.controller.subscriptions.enable(self.subscription).await
    }

    async fn advance_origin(&self, origin: &str, target: PgLsn) -> LinkResult<()> {
        // Refuses to run inside a transaction block, like CREATE SUBSCRIPTION.
        let query = format!(
            "SELECT pg_replication_origin_advance({}, {})",
            quote_literal(origin),
            quote_literal(&target.to_string())
        );
        self.controller.pair.source.execute_detached(&query).await?;

        Ok(())
    }
}

async fn run_rewind<O: RewindOps>(
    ops: &O,
    origin: &str,
    target: Option<PgLsn>,
    grace_period: Duration,
    confirm: &mut dyn Confirmation,
) -> LinkResult<RewindOutcome> {
    let Some(target) = target else {
        bail!(
            ErrorKind::ValidationError,
            "cannot rewind a replication origin to a null position",
            origin
        );
    };

    if !confirm.confirm("Rewinding replay position is a very dangerous operation. Proceed?") {
        info!("rewind of '{origin}' declined");
        return Ok(RewindOutcome::Declined);
    }

    if !confirm.confirm(&format!(
        "Confirm the exact target position {target} for origin '{origin}'"
    )) {
        info!("rewind of '{origin}' declined at target confirmation");
        return Ok(RewindOutcome::Declined);
    }

    if !ops.try_acquire_locks().await? {
        bail!(
            ErrorKind::LockContention,
            "could not acquire the advisory locks on source and destination",
            "is another instance of this tool running?"
        );
    }

    // From here on the locks are released on every exit path, and a failed
    // advance still attempts to re-enable the subscription.
    let outcome = advance_guarded(ops, origin, target, grace_period).await;
    let released = ops.release_locks().await;

    outcome.and(released)?;

    Ok(RewindOutcome::Applied)
}

async fn advance_guarded<O: RewindOps>(
    ops: &O,
    origin: &str,
    target: PgLsn,
    grace_period: Duration,
) -> LinkResult<()> {
    ops.disable_subscription().await?;

    info!(
        "giving the replication worker {}s to shut down",
        grace_period.as_secs()
    );
    tokio::time::sleep(grace_period).await;

    let advanced = ops.advance_origin(origin, target).await;

    let enabled = ops.enable_subscription().await;
    if let Err(e) = &enabled {
        warn!("failed to re-enable the subscription after rewind: {e}");
    }

    advanced.and(enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ScriptedConfirmation;
    use pglink_telemetry::init_test_tracing;
    use std::sync::Mutex;

    struct MockRewind {
        lock_available: bool,
        fail_advance: bool,
        calls: Mutex<Vec<&'static str>>,
        enabled: Mutex<bool>,
        position: Mutex<Option<PgLsn>>,
        locks_held: Mutex<bool>,
    }

    impl MockRewind {
        fn new() -> Self {
            Self {
                lock_available: true,
                fail_advance: false,
                calls: Mutex::new(Vec::new()),
                enabled: Mutex::new(true),
                position: Mutex::new(None),
                locks_held: Mutex::new(false),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn is_enabled(&self) -> bool {
            *self.enabled.lock().unwrap()
        }

        fn position(&self) -> Option<PgLsn> {
            *self.position.lock().unwrap()
        }

        fn holds_locks(&self) -> bool {
            *self.locks_held.lock().unwrap()
        }
    }

    impl RewindOps for MockRewind {
        async fn try_acquire_locks(&self) -> LinkResult<bool> {
            self.record("lock");
            if self.lock_available {
                *self.locks_held.lock().unwrap() = true;
            }
            Ok(self.lock_available)
        }

        async fn release_locks(&self) -> LinkResult<()> {
            self.record("release");
            *self.locks_held.lock().unwrap() = false;
            Ok(())
        }

        async fn disable_subscription(&self) -> LinkResult<()> {
            self.record("disable");
            *self.enabled.lock().unwrap() = false;
            Ok(())
        }

        async fn enable_subscription(&self) -> LinkResult<()> {
            self.record("enable");
            *self.enabled.lock().unwrap() = true;
            Ok(())
        }

        async fn advance_origin(&self, _origin: &str, target: PgLsn) -> LinkResult<()> {
            self.record("advance");
            if self.fail_advance {
                bail!(ErrorKind::QueryFailed, "advance failed");
            }
            *self.position.lock().unwrap() = Some(target);
            Ok(())
        }
    }

    fn target() -> Option<PgLsn> {
        Some(PgLsn::from(0x16_EDE8A0))
    }

    #[tokio::test]
    async fn null_target_fails_validation_regardless_of_confirmations() {
        init_test_tracing();
        let ops = MockRewind::new();
        let mut confirm = ScriptedConfirmation::answering(&[true, true]);

        let err = run_rewind(&ops, "origin1", None, Duration::ZERO, &mut confirm)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(ops.calls().is_empty());
        assert!(confirm.prompts.is_empty());
    }

    #[tokio::test]
    async fn first_decline_aborts_with_no_side_effects() {
        init_test_tracing();
        let ops = MockRewind::new();
        let mut confirm = ScriptedConfirmation::answering(&[false]);

        let outcome = run_rewind(&ops, "origin1", target(), Duration::ZERO, &mut confirm)
            .await
            .unwrap();

        assert_eq!(outcome, RewindOutcome::Declined);
        assert!(ops.calls().is_empty());
        assert!(ops.is_enabled());
        assert_eq!(ops.position(), None);
    }

    #[tokio::test]
    async fn second_decline_aborts_with_no_side_effects() {
        init_test_tracing();
        let ops = MockRewind::new();
        let mut confirm = ScriptedConfirmation::answering(&[true, false]);

        let outcome = run_rewind(&ops, "origin1", target(), Duration::ZERO, &mut confirm)
            .await
            .unwrap();

        assert_eq!(outcome, RewindOutcome::Declined);
        assert_eq!(confirm.prompts.len(), 2);
        assert!(ops.calls().is_empty());
        assert!(ops.is_enabled());
        assert_eq!(ops.position(), None);
    }

    #[tokio::test]
    async fn lock_contention_aborts_before_touching_the_subscription() {
        init_test_tracing();
        let mut ops = MockRewind::new();
        ops.lock_available = false;
        let mut confirm = ScriptedConfirmation::answering(&[true, true]);

        let err = run_rewind(&ops, "origin1", target(), Duration::ZERO, &mut confirm)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LockContention);
        assert_eq!(ops.calls(), vec!["lock"]);
        assert!(ops.is_enabled());
        assert_eq!(ops.position(), None);
    }

    #[tokio::test]
    async fn happy_path_orders_the_guarded_steps() {
        init_test_tracing();
        let ops = MockRewind::new();
        let mut confirm = ScriptedConfirmation::answering(&[true, true]);

        let outcome = run_rewind(&ops, "origin1", target(), Duration::ZERO, &mut confirm)
            .await
            .unwrap();

        assert_eq!(outcome, RewindOutcome::Applied);
        assert_eq!(
            ops.calls(),
            vec!["lock", "disable", "advance", "enable", "release"]
        );
        assert!(ops.is_enabled());
        assert_eq!(ops.position(), target());
        assert!(!ops.holds_locks());
    }

    #[tokio::test]
    async fn failed_advance_still_reenables_and_releases() {
        init_test_tracing();
        let mut ops = MockRewind::new();
        ops.fail_advance = true;
        let mut confirm = ScriptedConfirmation::answering(&[true, true]);

        let err = run_rewind(&ops, "origin1", target(), Duration::ZERO, &mut confirm)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueryFailed);
        assert_eq!(
            ops.calls(),
            vec!["lock", "disable", "advance", "enable", "release"]
        );
        assert!(ops.is_enabled());
        assert_eq!(ops.position(), None);
        assert!(!ops.holds_locks());
    }
}
