use std::future::Future;

use pglink_config::{LinkConfig, PgConnectionConfig, TomlPairStore};
use tracing::info;

use crate::bail;
use crate::client::ConnectionPair;
use crate::confirm::Confirmation;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::link_error;
use crate::subscriptions::{DropReport, Subscription, SubscriptionRegistry, reversed_name_for};

/// Terminal state of a reversal attempt that did not error.
#[derive(Debug)]
pub enum ReversalOutcome {
    /// The triad was recreated in the opposite direction.
    Reversed(Subscription),
    /// The operator declined a confirmation; topology unchanged.
    Declined,
}

/// External sink the swapped connection pair is persisted to, so the next
/// invocation picks up the reversed topology.
pub trait ConnectionPairSink {
    fn set(
        &mut self,
        source: &PgConnectionConfig,
        destination: &PgConnectionConfig,
    ) -> LinkResult<()>;
}

impl ConnectionPairSink for TomlPairStore {
    fn set(
        &mut self,
        source: &PgConnectionConfig,
        destination: &PgConnectionConfig,
    ) -> LinkResult<()> {
        self.save(&LinkConfig {
            source: source.clone(),
            destination: destination.clone(),
        })
        .map_err(|e| {
            link_error!(
                ErrorKind::ConfigError,
                "failed to persist the swapped connection pair",
                e
            )
        })
    }
}

/// Engine-facing steps the reversal protocol drives, seamed for testing.
pub trait ReversalOps {
    fn replication_lag(&self) -> impl Future<Output = LinkResult<u64>> + Send;
    fn drop_current(&self) -> impl Future<Output = LinkResult<DropReport>> + Send;
    fn create_reversed(&self) -> impl Future<Output = LinkResult<Subscription>> + Send;
    /// Connection configs of the reversed topology: (new source, new destination).
    fn reversed_pair(&self) -> (PgConnectionConfig, PgConnectionConfig);
}

/// Swaps which instance is source and which is destination (failover support).
#[derive(Debug)]
pub struct TopologyReversalProtocol {
    pair: ConnectionPair,
    forward: SubscriptionRegistry,
    reversed: SubscriptionRegistry,
}

impl TopologyReversalProtocol {
    pub fn new(pair: ConnectionPair) -> Self {
        let forward = SubscriptionRegistry::new(&pair);
        let reversed = SubscriptionRegistry::new(&pair.swapped());

        Self {
            pair,
            forward,
            reversed,
        }
    }

    /// Reverses the direction of `name`'s replication link.
    pub async fn reverse(
        &self,
        name: &str,
        confirm: &mut dyn Confirmation,
        sink: &mut dyn ConnectionPairSink,
    ) -> LinkResult<ReversalOutcome> {
        let Some(subscription) = self.forward.get(name).await? else {
            bail!(
                ErrorKind::ValidationError,
                "no subscription with this name exists to reverse",
                name
            );
        };

        let bound = BoundReversal {
            protocol: self,
            subscription,
        };

        run_reversal(&bound, confirm, sink).await
    }
}

struct BoundReversal<'a> {
    protocol: &'a TopologyReversalProtocol,
    subscription: Subscription,
}

impl ReversalOps for BoundReversal<'_> {
    async fn replication_lag(&self) -> LinkResult<u64> {
        self.protocol
            .forward
            .replication_lag(&self.subscription)
            .await
    }

    async fn drop_current(&self) -> LinkResult<DropReport> {
        self.protocol.forward.drop(&self.subscription.name).await
    }

    async fn create_reversed(&self) -> LinkResult<Subscription> {
        // The old destination already holds the data: copy_data = false.
        self.protocol
            .reversed
            .create(&reversed_name_for(&self.subscription.name), false, true, None)
            .await
    }

    fn reversed_pair(&self) -> (PgConnectionConfig, PgConnectionConfig) {
        let swapped = self.protocol.pair.swapped();

        (
            swapped.source.config().clone(),
            swapped.destination.config().clone(),
        )
    }
}

async fn run_reversal<O: ReversalOps>(
    ops: &O,
    confirm: &mut dyn Confirmation,
    sink: &mut dyn ConnectionPairSink,
) -> LinkResult<ReversalOutcome> {
    if !confirm.confirm("Reversing the replication direction is irreversible. Proceed?") {
        info!("reversal declined");
        return Ok(ReversalOutcome::Declined);
    }

    let lag = ops.replication_lag().await?;
    if lag != 0
        && !confirm.confirm(&format!("Replication lag is {lag} bytes; proceed anyway?"))
    {
        info!("reversal declined at the lag confirmation");
        return Ok(ReversalOutcome::Declined);
    }

    // Dropping the old triad and creating the reversed one is not atomic: a
    // failure in between leaves no active subscription until repaired.
    ops.drop_current().await?;
    let subscription = ops.create_reversed().await?;

    let (source, destination) = ops.reversed_pair();
    sink.set(&source, &destination)?;

    info!(
        "replication direction reversed; subscription '{}' now active",
        subscription.name
    );

    Ok(ReversalOutcome::Reversed(subscription))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ScriptedConfirmation;
    use crate::publications::Publication;
    use pglink_config::TlsConfig;
    use pglink_telemetry::init_test_tracing;
    use std::sync::Mutex;

    fn endpoint(host: &str) -> PgConnectionConfig {
        PgConnectionConfig {
            host: host.to_owned(),
            port: 5432,
            name: "app".to_owned(),
            username: "postgres".to_owned(),
            password: None,
            tls: TlsConfig::default(),
        }
    }

    fn reversed_subscription() -> Subscription {
        Subscription {
            name: "sub1_reversed".to_owned(),
            enabled: true,
            conninfo: "host=replica.internal".to_owned(),
            slot: None,
            publication: Publication {
                name: "sub1_reversed_publication".to_owned(),
                all_tables: true,
                exists: true,
            },
        }
    }

    struct MockReversal {
        lag: u64,
        fail_drop: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MockReversal {
        fn with_lag(lag: u64) -> Self {
            Self {
                lag,
                fail_drop: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ReversalOps for MockReversal {
        async fn replication_lag(&self) -> LinkResult<u64> {
            self.record("lag");
            Ok(self.lag)
        }

        async fn drop_current(&self) -> LinkResult<DropReport> {
            self.record("drop");
            if self.fail_drop {
                bail!(ErrorKind::QueryFailed, "drop failed");
            }
            Ok(DropReport {
                subscription: true,
                slot: true,
                publication: true,
            })
        }

        async fn create_reversed(&self) -> LinkResult<Subscription> {
            self.record("create");
            Ok(reversed_subscription())
        }

        fn reversed_pair(&self) -> (PgConnectionConfig, PgConnectionConfig) {
            (endpoint("replica.internal"), endpoint("primary.internal"))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        pairs: Vec<(String, String)>,
    }

    impl ConnectionPairSink for MemorySink {
        fn set(
            &mut self,
            source: &PgConnectionConfig,
            destination: &PgConnectionConfig,
        ) -> LinkResult<()> {
            self.pairs
                .push((source.host.clone(), destination.host.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_decline_leaves_topology_untouched() {
        init_test_tracing();
        let ops = MockReversal::with_lag(0);
        let mut confirm = ScriptedConfirmation::answering(&[false]);
        let mut sink = MemorySink::default();

        let outcome = run_reversal(&ops, &mut confirm, &mut sink).await.unwrap();

        assert!(matches!(outcome, ReversalOutcome::Declined));
        assert!(ops.calls().is_empty());
        assert!(sink.pairs.is_empty());
    }

    #[tokio::test]
    async fn nonzero_lag_requires_a_second_confirmation() {
        init_test_tracing();
        let ops = MockReversal::with_lag(4096);
        let mut confirm = ScriptedConfirmation::answering(&[true, false]);
        let mut sink = MemorySink::default();

        let outcome = run_reversal(&ops, &mut confirm, &mut sink).await.unwrap();

        assert!(matches!(outcome, ReversalOutcome::Declined));
        assert_eq!(ops.calls(), vec!["lag"]);
        assert!(confirm.prompts[1].contains("4096"));
        assert!(sink.pairs.is_empty());
    }

    #[tokio::test]
    async fn caught_up_link_reverses_after_a_single_confirmation() {
        init_test_tracing();
        let ops = MockReversal::with_lag(0);
        let mut confirm = ScriptedConfirmation::answering(&[true]);
        let mut sink = MemorySink::default();

        let outcome = run_reversal(&ops, &mut confirm, &mut sink).await.unwrap();

        let ReversalOutcome::Reversed(subscription) = outcome else {
            panic!("expected a reversed subscription");
        };
        assert_eq!(subscription.name, "sub1_reversed");
        assert_eq!(confirm.prompts.len(), 1);
        assert_eq!(ops.calls(), vec!["lag", "drop", "create"]);
        assert_eq!(
            sink.pairs,
            vec![("replica.internal".to_owned(), "primary.internal".to_owned())]
        );
    }

    #[tokio::test]
    async fn lagging_link_reverses_when_both_confirmations_accept() {
        init_test_tracing();
        let ops = MockReversal::with_lag(128);
        let mut confirm = ScriptedConfirmation::answering(&[true, true]);
        let mut sink = MemorySink::default();

        let outcome = run_reversal(&ops, &mut confirm, &mut sink).await.unwrap();

        assert!(matches!(outcome, ReversalOutcome::Reversed(_)));
        assert_eq!(ops.calls(), vec!["lag", "drop", "create"]);
        assert_eq!(sink.pairs.len(), 1);
    }

    #[tokio::test]
    async fn failed_drop_stops_before_creating_the_reversed_triad() {
        init_test_tracing();
        let mut ops = MockReversal::with_lag(0);
        ops.fail_drop = true;
        let mut confirm = ScriptedConfirmation::answering(&[true]);
        let mut sink = MemorySink::default();

        let err = run_reversal(&ops, &mut confirm, &mut sink)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueryFailed);
        assert_eq!(ops.calls(), vec!["lag", "drop"]);
        assert!(sink.pairs.is_empty());
    }
}
