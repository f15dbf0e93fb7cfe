//! Duplicate-fund pipeline: detector, warning dispatcher, warning
//! recorder, and the unresolved-warnings query service.
//!
//! Detection runs synchronously inside the fund write path; everything
//! after the [`SignalSink`] happens on background tasks so the write is
//! never blocked on warning persistence.

use std::sync::Arc;
use std::time::Duration;

use fundreg_core::{identifier_sets_match, DuplicateSignal, FundWithAliases, WarningView};
use fundreg_storage::{FundStore, StoreError, WarningStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "fundreg-dedup";

/// Delivery is deliberately delayed to smooth the burst of signals a
/// single multi-alias write can generate.
pub const DEFAULT_DISPATCH_DELAY: Duration = Duration::from_secs(5);

/// Producer handle for duplicate signals. Cloneable; sending never
/// blocks and never fails the caller.
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<DuplicateSignal>,
}

impl SignalSink {
    /// A sink wired to a bare receiver, for wiring the detector to a
    /// custom consumer (tests capture signals this way).
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DuplicateSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, signal: DuplicateSignal) {
        if self.tx.send(signal).is_err() {
            warn!("warning dispatcher is gone; duplicate signal dropped");
        }
    }
}

/// Scans a candidate fund's manager-siblings for identifier collisions
/// and raises one [`DuplicateSignal`] per matched sibling.
pub struct DuplicateDetector {
    funds: Arc<dyn FundStore>,
    sink: SignalSink,
}

impl DuplicateDetector {
    pub fn new(funds: Arc<dyn FundStore>, sink: SignalSink) -> Self {
        Self { funds, sink }
    }

    /// Runs the duplicate scan for `candidate` (post-write state, aliases
    /// loaded) and returns the matched sibling ids.
    ///
    /// A sibling is reported at most once no matter how many of its
    /// identifiers collide. Storage failure aborts the scan and
    /// propagates; the triggering write has already committed, so the
    /// caller logs and moves on.
    pub async fn detect(&self, candidate: &FundWithAliases) -> Result<Vec<i64>, StoreError> {
        let siblings = self
            .funds
            .list_active_funds_by_manager(candidate.fund_manager_id, candidate.id)
            .await?;
        let candidate_ids = candidate.identifiers();
        let mut matched = Vec::new();
        for sibling in &siblings {
            if identifier_sets_match(&candidate_ids, &sibling.identifiers()) {
                debug!(
                    fund_id = candidate.id,
                    matched_fund_id = sibling.id,
                    "duplicate fund identifiers detected"
                );
                self.sink.send(DuplicateSignal::new(candidate.id, sibling.id));
                matched.push(sibling.id);
            }
        }
        Ok(matched)
    }
}

/// Idempotently persists a duplicate signal as a warning row.
pub struct WarningRecorder {
    warnings: Arc<dyn WarningStore>,
}

impl WarningRecorder {
    pub fn new(warnings: Arc<dyn WarningStore>) -> Self {
        Self { warnings }
    }

    /// Check-then-insert for the unordered pair. Redelivered or
    /// concurrently-generated signals for a pair already on file are
    /// skipped; the conflict-tolerant insert covers the window between
    /// check and insert.
    pub async fn record(&self, signal: &DuplicateSignal) -> Result<(), StoreError> {
        if self
            .warnings
            .warning_exists_for_pair(signal.fund_id, signal.matched_fund_id)
            .await?
        {
            debug!(
                signal_id = %signal.signal_id,
                fund_id_1 = signal.fund_id,
                fund_id_2 = signal.matched_fund_id,
                "warning already on file for pair; skipping"
            );
            return Ok(());
        }
        let inserted = self
            .warnings
            .insert_warning(signal.fund_id, signal.matched_fund_id)
            .await?;
        if inserted {
            info!(
                signal_id = %signal.signal_id,
                fund_id_1 = signal.fund_id,
                fund_id_2 = signal.matched_fund_id,
                "duplicate warning recorded"
            );
        } else {
            debug!(
                signal_id = %signal.signal_id,
                fund_id_1 = signal.fund_id,
                fund_id_2 = signal.matched_fund_id,
                "lost insert race; warning already recorded"
            );
        }
        Ok(())
    }
}

/// Background delivery of duplicate signals to the recorder.
///
/// Each accepted signal is delivered `delay` after acceptance on its own
/// task, so signals for different pairs land in no particular order.
/// Delivery is at-least-once from the producer's point of view; a
/// persistence failure is logged and the signal dropped (retry policy
/// stays with the channel, not the recorder). Signals still pending at
/// process exit are acceptable loss.
pub struct WarningDispatcher {
    handle: JoinHandle<()>,
}

impl WarningDispatcher {
    pub fn spawn(recorder: WarningRecorder, delay: Duration) -> (SignalSink, WarningDispatcher) {
        let (sink, mut rx) = SignalSink::channel();
        let recorder = Arc::new(recorder);
        let handle = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let recorder = Arc::clone(&recorder);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = recorder.record(&signal).await {
                        error!(
                            signal_id = %signal.signal_id,
                            error = %err,
                            "failed to persist duplicate warning; signal dropped"
                        );
                    }
                });
            }
            debug!("warning dispatcher channel closed; worker exiting");
        });
        (sink, WarningDispatcher { handle })
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Read model over recorded warnings.
pub struct WarningQueryService {
    warnings: Arc<dyn WarningStore>,
}

impl WarningQueryService {
    pub fn new(warnings: Arc<dyn WarningStore>) -> Self {
        Self { warnings }
    }

    /// Every unresolved warning, enriched with both funds' display
    /// detail.
    pub async fn list_unresolved(&self) -> Result<Vec<WarningView>, StoreError> {
        self.warnings.list_unresolved().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundreg_storage::{MemoryStore, NewFund};

    struct Fixture {
        store: Arc<MemoryStore>,
        detector: DuplicateDetector,
        rx: mpsc::UnboundedReceiver<DuplicateSignal>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let (sink, rx) = SignalSink::channel();
        let detector = DuplicateDetector::new(store.clone() as Arc<dyn FundStore>, sink);
        Fixture {
            store,
            detector,
            rx,
        }
    }

    async fn add_fund(
        store: &MemoryStore,
        manager_id: i64,
        name: &str,
        aliases: &[&str],
    ) -> FundWithAliases {
        store
            .create_fund(&NewFund {
                name: name.to_string(),
                start_year: 2019,
                fund_manager_id: manager_id,
                aliases: aliases.iter().map(ToString::to_string).collect(),
                company_ids: vec![],
            })
            .await
            .unwrap()
            .scan_view()
    }

    #[tokio::test]
    async fn same_name_same_manager_is_reported_exactly_once() {
        let mut fx = fixture();
        let manager = fx.store.create_manager("M").await.unwrap();
        let existing = add_fund(&fx.store, manager.id, "Acme Fund I", &[]).await;
        let candidate = add_fund(&fx.store, manager.id, "ACME FUND I", &[]).await;

        let matched = fx.detector.detect(&candidate).await.unwrap();
        assert_eq!(matched, vec![existing.id]);

        let signal = fx.rx.try_recv().unwrap();
        assert_eq!(signal.fund_id, candidate.id);
        assert_eq!(signal.matched_fund_id, existing.id);
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn alias_collision_is_reported() {
        let mut fx = fixture();
        let manager = fx.store.create_manager("M").await.unwrap();
        let existing = add_fund(&fx.store, manager.id, "Beta I", &["B1"]).await;
        let candidate = add_fund(&fx.store, manager.id, "B1", &[]).await;

        let matched = fx.detector.detect(&candidate).await.unwrap();
        assert_eq!(matched, vec![existing.id]);
        assert!(fx.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn multiple_colliding_identifiers_still_yield_one_signal_per_sibling() {
        let mut fx = fixture();
        let manager = fx.store.create_manager("M").await.unwrap();
        let existing = add_fund(&fx.store, manager.id, "Omega", &["O1", "O2"]).await;
        // Candidate collides with the sibling's name and both aliases.
        let candidate = FundWithAliases {
            id: 999,
            name: "omega".to_string(),
            fund_manager_id: manager.id,
            aliases: vec!["o1".to_string(), "o2".to_string()],
        };

        let matched = fx.detector.detect(&candidate).await.unwrap();
        assert_eq!(matched, vec![existing.id]);
        assert!(fx.rx.try_recv().is_ok());
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn each_matching_sibling_gets_its_own_signal() {
        let mut fx = fixture();
        let manager = fx.store.create_manager("M").await.unwrap();
        let first = add_fund(&fx.store, manager.id, "Twin Fund", &[]).await;
        let second = add_fund(&fx.store, manager.id, "Other Name", &["twin fund"]).await;
        let candidate = FundWithAliases {
            id: 999,
            name: "TWIN FUND".to_string(),
            fund_manager_id: manager.id,
            aliases: vec![],
        };

        let matched = fx.detector.detect(&candidate).await.unwrap();
        assert_eq!(matched, vec![first.id, second.id]);
        assert!(fx.rx.try_recv().is_ok());
        assert!(fx.rx.try_recv().is_ok());
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn different_managers_never_match() {
        let mut fx = fixture();
        let m1 = fx.store.create_manager("M1").await.unwrap();
        let m2 = fx.store.create_manager("M2").await.unwrap();
        add_fund(&fx.store, m1.id, "Gamma", &[]).await;
        let candidate = add_fund(&fx.store, m2.id, "Gamma", &[]).await;

        let matched = fx.detector.detect(&candidate).await.unwrap();
        assert!(matched.is_empty());
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tombstoned_siblings_are_never_reported() {
        let mut fx = fixture();
        let manager = fx.store.create_manager("M").await.unwrap();
        let deleted = add_fund(&fx.store, manager.id, "Delta", &[]).await;
        fx.store.delete_fund(deleted.id).await.unwrap();
        let candidate = add_fund(&fx.store, manager.id, "Delta", &[]).await;

        let matched = fx.detector.detect(&candidate).await.unwrap();
        assert!(matched.is_empty());
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn recorder_is_idempotent_for_redelivered_signals() {
        let store = Arc::new(MemoryStore::new());
        let manager = store.create_manager("M").await.unwrap();
        let a = add_fund(&store, manager.id, "A", &[]).await;
        let b = add_fund(&store, manager.id, "B", &[]).await;
        let recorder = WarningRecorder::new(store.clone() as Arc<dyn WarningStore>);

        let signal = DuplicateSignal::new(a.id, b.id);
        recorder.record(&signal).await.unwrap();
        recorder.record(&signal).await.unwrap();
        // Same pair, opposite detection order.
        recorder
            .record(&DuplicateSignal::new(b.id, a.id))
            .await
            .unwrap();

        let warnings = store.list_unresolved().await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(!warnings[0].resolved);
    }

    #[tokio::test]
    async fn end_to_end_create_duplicate_records_one_warning_after_delay() {
        let store = Arc::new(MemoryStore::new());
        let recorder = WarningRecorder::new(store.clone() as Arc<dyn WarningStore>);
        let (sink, _dispatcher) = WarningDispatcher::spawn(recorder, Duration::from_millis(20));
        let detector = DuplicateDetector::new(store.clone() as Arc<dyn FundStore>, sink);

        let manager = store.create_manager("M").await.unwrap();
        let existing = add_fund(&store, manager.id, "Acme Fund I", &[]).await;
        let candidate = add_fund(&store, manager.id, "ACME FUND I", &[]).await;

        let matched = detector.detect(&candidate).await.unwrap();
        assert_eq!(matched, vec![existing.id]);

        // Nothing is recorded before the dispatch delay elapses.
        assert!(store.list_unresolved().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let warnings = store.list_unresolved().await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].fund_id_1, candidate.id);
        assert_eq!(warnings[0].fund_id_2, existing.id);
        assert!(!warnings[0].resolved);
    }

    #[tokio::test]
    async fn end_to_end_alias_match_records_a_warning() {
        let store = Arc::new(MemoryStore::new());
        let recorder = WarningRecorder::new(store.clone() as Arc<dyn WarningStore>);
        let (sink, _dispatcher) = WarningDispatcher::spawn(recorder, Duration::from_millis(10));
        let detector = DuplicateDetector::new(store.clone() as Arc<dyn FundStore>, sink);

        let manager = store.create_manager("M").await.unwrap();
        let existing = add_fund(&store, manager.id, "Beta I", &["B1"]).await;
        let candidate = add_fund(&store, manager.id, "B1", &[]).await;

        detector.detect(&candidate).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let warnings = store.list_unresolved().await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].fund_id_2, existing.id);
    }

    #[tokio::test]
    async fn end_to_end_cross_manager_and_tombstoned_record_nothing() {
        let store = Arc::new(MemoryStore::new());
        let recorder = WarningRecorder::new(store.clone() as Arc<dyn WarningStore>);
        let (sink, _dispatcher) = WarningDispatcher::spawn(recorder, Duration::from_millis(10));
        let detector = DuplicateDetector::new(store.clone() as Arc<dyn FundStore>, sink);

        let m1 = store.create_manager("M1").await.unwrap();
        let m2 = store.create_manager("M2").await.unwrap();
        add_fund(&store, m1.id, "Gamma", &[]).await;
        let cross = add_fund(&store, m2.id, "Gamma", &[]).await;
        detector.detect(&cross).await.unwrap();

        let deleted = add_fund(&store, m1.id, "Delta", &[]).await;
        store.delete_fund(deleted.id).await.unwrap();
        let revived = add_fund(&store, m1.id, "Delta", &[]).await;
        detector.detect(&revived).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.list_unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn end_to_end_concurrent_equivalent_signals_record_one_row() {
        let store = Arc::new(MemoryStore::new());
        let recorder = WarningRecorder::new(store.clone() as Arc<dyn WarningStore>);
        let (sink, _dispatcher) = WarningDispatcher::spawn(recorder, Duration::from_millis(10));

        let manager = store.create_manager("M").await.unwrap();
        let a = add_fund(&store, manager.id, "Seven", &[]).await;
        let b = add_fund(&store, manager.id, "Nine", &[]).await;

        // Two writes independently detected the same pair, in opposite
        // orders; both signals are delivered around the same instant.
        sink.send(DuplicateSignal::new(a.id, b.id));
        sink.send(DuplicateSignal::new(b.id, a.id));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let warnings = store.list_unresolved().await.unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn resolved_warnings_stay_out_of_the_unresolved_view() {
        let store = Arc::new(MemoryStore::new());
        let manager = store.create_manager("M").await.unwrap();
        let a = add_fund(&store, manager.id, "A", &[]).await;
        let b = add_fund(&store, manager.id, "B", &[]).await;
        let recorder = WarningRecorder::new(store.clone() as Arc<dyn WarningStore>);
        recorder.record(&DuplicateSignal::new(a.id, b.id)).await.unwrap();

        let service = WarningQueryService::new(store.clone() as Arc<dyn WarningStore>);
        let id = service.list_unresolved().await.unwrap()[0].id;
        store.mark_resolved(id).await.unwrap();
        assert!(service.list_unresolved().await.unwrap().is_empty());

        // A redelivered signal for the resolved pair is still suppressed.
        recorder.record(&DuplicateSignal::new(a.id, b.id)).await.unwrap();
        assert!(service.list_unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn warning_view_includes_both_funds_detail() {
        let store = Arc::new(MemoryStore::new());
        let manager = store.create_manager("Crestline Partners").await.unwrap();
        let company = store.create_company("Acme Widgets").await.unwrap();
        let a = store
            .create_fund(&NewFund {
                name: "Crest Fund I".into(),
                start_year: 2018,
                fund_manager_id: manager.id,
                aliases: vec!["CF-I".into()],
                company_ids: vec![company.id],
            })
            .await
            .unwrap();
        let b = add_fund(&store, manager.id, "crest fund i", &[]).await;

        let recorder = WarningRecorder::new(store.clone() as Arc<dyn WarningStore>);
        recorder.record(&DuplicateSignal::new(b.id, a.id)).await.unwrap();

        let warnings = WarningQueryService::new(store.clone() as Arc<dyn WarningStore>)
            .list_unresolved()
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);
        let fund2 = warnings[0].fund2.as_ref().unwrap();
        assert_eq!(fund2.fund_manager_name, "Crestline Partners");
        assert_eq!(fund2.aliases, vec!["CF-I".to_string()]);
        assert_eq!(fund2.companies.len(), 1);
        assert_eq!(fund2.companies[0].name, "Acme Widgets");
    }
}
