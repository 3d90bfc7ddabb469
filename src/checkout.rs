//! Idempotent checkout.
//!
//! A checkout turns the active draft into exactly one committed transaction.
//! The draft's `submission_id` is the idempotency key: retrying after a
//! timeout or dropped response is always safe. When the server reports the
//! key as already used, the committed transaction is read back and compared
//! with the local total before the attempt is declared a success.
//!
//! Once validation passes, the network step runs on its own task. Dropping
//! the future returned by [`Checkout::submit`] does not abort the request,
//! and a late success still clears the draft.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::backend::CheckoutBackend;
use crate::draft::{Draft, DraftStore};
use crate::error::{BackendError, CheckoutError, ValidationError};
use crate::invalidation::{InvalidationBus, QueryKey};
use crate::models::{
    CommittedTransaction, Operator, TransactionHeader, TransactionLine, VoucherExpense,
};
use crate::pricing::same_amount;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the current (or last) checkout attempt stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutPhase {
    Idle,
    Validating,
    Submitting,
    /// Server reported the submission id as taken; reading it back.
    Reconciling,
    Committed,
    DuplicateReconciled,
    Failed { retryable: bool },
}

impl CheckoutPhase {
    /// A new attempt may start from here.
    pub fn accepts_submit(&self) -> bool {
        !matches!(self, Self::Validating | Self::Submitting | Self::Reconciling)
    }
}

/// Successful checkout.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    Committed(CommittedTransaction),
    /// An earlier attempt with the same submission id had already landed.
    DuplicateReconciled(CommittedTransaction),
}

impl CheckoutOutcome {
    pub fn transaction(&self) -> &CommittedTransaction {
        match self {
            Self::Committed(tx) | Self::DuplicateReconciled(tx) => tx,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Header and lines ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub header: TransactionHeader,
    pub lines: Vec<TransactionLine>,
}

/// Local preconditions. Nothing here touches the network.
pub fn validate(
    draft: &Draft,
    operator: Option<&Operator>,
) -> Result<CommitRequest, ValidationError> {
    if draft.is_empty() {
        return Err(ValidationError::EmptyCart);
    }
    let operator = operator.ok_or(ValidationError::MissingOperator)?;
    if draft.payment < 0.0 {
        return Err(ValidationError::NegativePayment);
    }
    if draft.voucher < 0.0 {
        return Err(ValidationError::NegativeVoucher);
    }

    let totals = draft.totals();
    if !totals.has_tender() {
        return Err(ValidationError::MissingPayment);
    }
    if totals.change < 0.0 {
        return Err(ValidationError::NegativeChange {
            shortfall: totals.shortfall(),
        });
    }
    if draft.effective_date.is_some() && !operator.can_backdate {
        return Err(ValidationError::BackdateNotAllowed {
            operator_id: operator.id.clone(),
        });
    }

    let header = TransactionHeader {
        submission_id: draft.submission_id.clone(),
        customer_reference: draft.customer_reference.clone(),
        payment_amount: draft.payment,
        voucher_amount: draft.voucher,
        grand_total: totals.grand_total,
        change: totals.change,
        operator_id: operator.id.clone(),
        effective_date: draft.effective_date,
    };
    let lines = draft
        .items
        .iter()
        .map(|item| TransactionLine {
            product_reference: item.product_reference.clone(),
            display_name: item.display_name.clone(),
            unit_price: item.unit_price,
            quantity: item.quantity,
            discount: item.discount,
        })
        .collect();

    Ok(CommitRequest { header, lines })
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Checkout {
    drafts: Arc<DraftStore>,
    backend: Arc<dyn CheckoutBackend>,
    bus: Arc<InvalidationBus>,
    commit_timeout: Duration,
    phase: watch::Sender<CheckoutPhase>,
}

impl Checkout {
    pub fn new(
        drafts: Arc<DraftStore>,
        backend: Arc<dyn CheckoutBackend>,
        bus: Arc<InvalidationBus>,
        commit_timeout: Duration,
    ) -> Arc<Self> {
        let (phase, _rx) = watch::channel(CheckoutPhase::Idle);
        Arc::new(Self {
            drafts,
            backend,
            bus,
            commit_timeout,
            phase,
        })
    }

    pub fn phase(&self) -> CheckoutPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<CheckoutPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, next: CheckoutPhase) {
        self.phase.send_replace(next);
    }

    /// Claim the coordinator for a new attempt.
    fn begin(&self) -> bool {
        let mut claimed = false;
        self.phase.send_if_modified(|phase| {
            if !phase.accepts_submit() {
                return false;
            }
            *phase = CheckoutPhase::Validating;
            claimed = true;
            true
        });
        claimed
    }

    /// Commit the active draft on behalf of `operator`.
    pub async fn submit(
        self: &Arc<Self>,
        operator: Option<&Operator>,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        if !self.begin() {
            warn!("Checkout already in progress, ignoring submit");
            return Err(CheckoutError::Busy);
        }

        // The draft stays frozen until the attempt settles, so what clears on
        // success is exactly what was committed.
        let draft = self.drafts.hold();
        let request = match validate(&draft, operator) {
            Ok(request) => request,
            Err(reason) => {
                info!(submission_id = %draft.submission_id, %reason, "Checkout rejected locally");
                self.drafts.release();
                self.set_phase(CheckoutPhase::Idle);
                return Err(reason.into());
            }
        };

        self.set_phase(CheckoutPhase::Submitting);
        info!(
            submission_id = %request.header.submission_id,
            grand_total = request.header.grand_total,
            lines = request.lines.len(),
            "Submitting checkout"
        );

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = this.commit(request).await;
            this.drafts.release();
            result
        });
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Checkout task aborted");
                self.drafts.release();
                self.set_phase(CheckoutPhase::Failed { retryable: true });
                Err(CheckoutError::Retryable(BackendError::Transient(
                    "checkout task aborted".to_string(),
                )))
            }
        }
    }

    async fn commit(&self, request: CommitRequest) -> Result<CheckoutOutcome, CheckoutError> {
        let header = &request.header;
        let result = match timeout(
            self.commit_timeout,
            self.backend.commit(header, &request.lines),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };

        match result {
            Ok(tx) => {
                self.finish(header, &tx);
                self.set_phase(CheckoutPhase::Committed);
                info!(
                    submission_id = %tx.submission_id,
                    transaction_id = %tx.id,
                    "Checkout committed"
                );
                Ok(CheckoutOutcome::Committed(tx))
            }
            Err(BackendError::UniqueViolation { .. }) => {
                self.set_phase(CheckoutPhase::Reconciling);
                info!(
                    submission_id = %header.submission_id,
                    "Submission id already used, reconciling with server copy"
                );
                self.reconcile(header).await
            }
            Err(e) => Err(self.fail(header, e)),
        }
    }

    /// Compare the server's copy of `header.submission_id` with the local
    /// total.
    async fn reconcile(
        &self,
        header: &TransactionHeader,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let fetched = match timeout(
            self.commit_timeout,
            self.backend.fetch_by_submission_id(&header.submission_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };

        let existing = match fetched {
            Ok(existing) => existing,
            Err(e) => return Err(self.fail(header, e)),
        };

        match existing {
            Some(tx) if same_amount(tx.grand_total, header.grand_total) => {
                self.finish(header, &tx);
                self.set_phase(CheckoutPhase::DuplicateReconciled);
                info!(
                    submission_id = %tx.submission_id,
                    transaction_id = %tx.id,
                    "Duplicate submission reconciled with committed transaction"
                );
                Ok(CheckoutOutcome::DuplicateReconciled(tx))
            }
            other => {
                let server_total = other.map(|tx| tx.grand_total);
                error!(
                    submission_id = %header.submission_id,
                    local_total = header.grand_total,
                    server_total = ?server_total,
                    "Submission collision"
                );
                self.set_phase(CheckoutPhase::Failed { retryable: false });
                Err(CheckoutError::SubmissionCollision {
                    submission_id: header.submission_id.clone(),
                    local_total: header.grand_total,
                    server_total,
                })
            }
        }
    }

    fn fail(&self, header: &TransactionHeader, e: BackendError) -> CheckoutError {
        let retryable = e.is_retryable();
        self.set_phase(CheckoutPhase::Failed { retryable });
        if retryable {
            warn!(submission_id = %header.submission_id, error = %e, "Checkout failed, retry is safe");
            CheckoutError::Retryable(e)
        } else {
            error!(submission_id = %header.submission_id, error = %e, "Checkout refused by server");
            CheckoutError::Fatal(e)
        }
    }

    /// Post-commit work shared by fresh and reconciled commits.
    fn finish(&self, header: &TransactionHeader, tx: &CommittedTransaction) {
        self.drafts.clear_if_current(&header.submission_id);
        self.bus.invalidate(QueryKey::RecentTransactions);

        if header.voucher_amount > 0.0 {
            let entry = VoucherExpense {
                submission_id: header.submission_id.clone(),
                amount: header.voucher_amount,
                operator_id: header.operator_id.clone(),
                expense_date: header
                    .effective_date
                    .unwrap_or(tx.committed_at)
                    .date_naive(),
            };
            let backend = Arc::clone(&self.backend);
            let bus = Arc::clone(&self.bus);
            tokio::spawn(async move {
                match backend.record_voucher_expense(&entry).await {
                    Ok(()) => {
                        info!(submission_id = %entry.submission_id, amount = entry.amount, "Voucher expense recorded");
                        bus.invalidate(QueryKey::ExpensePage);
                    }
                    Err(e) => {
                        warn!(
                            submission_id = %entry.submission_id,
                            error = %e,
                            "Failed to record voucher expense"
                        );
                    }
                }
            });
        }
    }

    /// Recent committed sales, marking the view fresh.
    pub async fn recent_transactions(
        &self,
        limit: u32,
    ) -> Result<Vec<CommittedTransaction>, BackendError> {
        let observed = self.bus.generation(&QueryKey::RecentTransactions);
        let rows = timeout(self.commit_timeout, self.backend.recent_transactions(limit))
            .await
            .map_err(|_| BackendError::Timeout)??;
        self.bus.mark_fresh(&QueryKey::RecentTransactions, observed);
        Ok(rows)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::DraftOp;
    use crate::error::DraftError;
    use crate::storage::{KeyValueSlot, MemorySlot};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Script {
        /// Fail without writing.
        Fail(BackendError),
        /// Write, then lose the response.
        LandThenFail(BackendError),
        /// Answer normally after a delay.
        Delay(Duration),
    }

    #[derive(Default)]
    struct FakeServer {
        committed: Mutex<HashMap<String, CommittedTransaction>>,
        script: Mutex<VecDeque<Script>>,
        commit_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
        vouchers: Mutex<Vec<VoucherExpense>>,
        voucher_fails: AtomicBool,
        slow_reads: AtomicBool,
    }

    impl FakeServer {
        fn push(&self, step: Script) {
            self.script.lock().unwrap().push_back(step);
        }

        fn store(&self, header: &TransactionHeader) -> Result<CommittedTransaction, BackendError> {
            let mut committed = self.committed.lock().unwrap();
            if committed.contains_key(&header.submission_id) {
                return Err(BackendError::UniqueViolation {
                    submission_id: header.submission_id.clone(),
                });
            }
            let tx = CommittedTransaction {
                id: format!("tx-{}", committed.len() + 1),
                submission_id: header.submission_id.clone(),
                grand_total: header.grand_total,
                payment_amount: header.payment_amount,
                voucher_amount: header.voucher_amount,
                change: header.change,
                operator_id: header.operator_id.clone(),
                committed_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            };
            committed.insert(header.submission_id.clone(), tx.clone());
            Ok(tx)
        }

        fn count(&self) -> usize {
            self.committed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CheckoutBackend for FakeServer {
        async fn commit(
            &self,
            header: &TransactionHeader,
            _lines: &[TransactionLine],
        ) -> Result<CommittedTransaction, BackendError> {
            self.commit_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Script::Fail(e)) => Err(e),
                Some(Script::LandThenFail(e)) => {
                    self.store(header)?;
                    Err(e)
                }
                Some(Script::Delay(d)) => {
                    tokio::time::sleep(d).await;
                    self.store(header)
                }
                None => self.store(header),
            }
        }

        async fn fetch_by_submission_id(
            &self,
            submission_id: &str,
        ) -> Result<Option<CommittedTransaction>, BackendError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.committed.lock().unwrap().get(submission_id).cloned())
        }

        async fn record_voucher_expense(&self, entry: &VoucherExpense) -> Result<(), BackendError> {
            if self.voucher_fails.load(Ordering::SeqCst) {
                return Err(BackendError::Transient("ledger offline".into()));
            }
            self.vouchers.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn recent_transactions(
            &self,
            limit: u32,
        ) -> Result<Vec<CommittedTransaction>, BackendError> {
            if self.slow_reads.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(self
                .committed
                .lock()
                .unwrap()
                .values()
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    fn operator() -> Operator {
        Operator {
            id: "op-1".to_string(),
            display_name: "Maria".to_string(),
            can_backdate: false,
        }
    }

    struct Harness {
        server: Arc<FakeServer>,
        drafts: Arc<DraftStore>,
        bus: Arc<InvalidationBus>,
        checkout: Arc<Checkout>,
    }

    fn harness_with(server: Arc<FakeServer>, commit_timeout: Duration) -> Harness {
        let drafts = Arc::new(DraftStore::load(Arc::new(MemorySlot::new())));
        let bus = Arc::new(InvalidationBus::new());
        let backend: Arc<dyn CheckoutBackend> = server.clone();
        let checkout = Checkout::new(
            Arc::clone(&drafts),
            backend,
            Arc::clone(&bus),
            commit_timeout,
        );
        Harness {
            server,
            drafts,
            bus,
            checkout,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(FakeServer::default()), Duration::from_secs(5))
    }

    fn add(drafts: &DraftStore, reference: &str, price: f64, quantity: u32) {
        drafts
            .mutate(DraftOp::AddItem {
                product_reference: reference.to_string(),
                display_name: reference.to_uppercase(),
                unit_price: price,
                quantity,
            })
            .unwrap();
    }

    fn fill_cart(drafts: &DraftStore) {
        add(drafts, "sku-60", 60.0, 1);
        drafts.mutate(DraftOp::SetPayment(100.0)).unwrap();
    }

    #[tokio::test]
    async fn test_simple_sale_commits_and_clears_draft() {
        let h = harness();
        fill_cart(&h.drafts);
        let submission_id = h.drafts.get().submission_id;
        let totals = h.drafts.totals();
        assert_eq!(totals.subtotal, 60.0);
        assert_eq!(totals.grand_total, 60.0);
        assert_eq!(totals.change, 40.0);

        let outcome = h.checkout.submit(Some(&operator())).await.unwrap();

        match &outcome {
            CheckoutOutcome::Committed(tx) => {
                assert_eq!(tx.submission_id, submission_id);
                assert_eq!(tx.grand_total, 60.0);
                assert_eq!(tx.change, 40.0);
            }
            other => panic!("expected fresh commit, got {other:?}"),
        }
        assert_eq!(h.checkout.phase(), CheckoutPhase::Committed);
        assert!(h.drafts.get().is_empty());
        assert_ne!(h.drafts.get().submission_id, submission_id);
        assert!(h.bus.is_stale(&QueryKey::RecentTransactions));
    }

    #[tokio::test]
    async fn test_wholly_free_sale_needs_no_payment() {
        let h = harness();
        h.drafts.mutate(DraftOp::SetFreeMode(true)).unwrap();
        add(&h.drafts, "sku-gift", 25.0, 2);
        assert_eq!(h.drafts.totals().subtotal, 0.0);

        let outcome = h.checkout.submit(Some(&operator())).await.unwrap();
        assert_eq!(outcome.transaction().grand_total, 0.0);
        assert_eq!(h.server.count(), 1);
    }

    #[tokio::test]
    async fn test_validation_failures_skip_network_and_keep_draft() {
        let h = harness();

        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert_eq!(err, CheckoutError::Validation(ValidationError::EmptyCart));

        add(&h.drafts, "sku-60", 60.0, 1);
        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert_eq!(err, CheckoutError::Validation(ValidationError::MissingPayment));

        h.drafts.mutate(DraftOp::SetPayment(50.0)).unwrap();
        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert_eq!(
            err,
            CheckoutError::Validation(ValidationError::NegativeChange { shortfall: 10.0 })
        );

        h.drafts.mutate(DraftOp::SetPayment(60.0)).unwrap();
        let err = h.checkout.submit(None).await.unwrap_err();
        assert_eq!(err, CheckoutError::Validation(ValidationError::MissingOperator));

        assert_eq!(h.server.commit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.drafts.get().items.len(), 1);
        assert_eq!(h.checkout.phase(), CheckoutPhase::Idle);
    }

    #[tokio::test]
    async fn test_backdating_requires_permission() {
        let h = harness();
        fill_cart(&h.drafts);
        let yesterday = Utc.with_ymd_and_hms(2024, 5, 31, 18, 0, 0).unwrap();
        h.drafts
            .mutate(DraftOp::SetEffectiveDate(Some(yesterday)))
            .unwrap();

        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Validation(ValidationError::BackdateNotAllowed { .. })
        ));

        let manager = Operator {
            can_backdate: true,
            ..operator()
        };
        h.checkout.submit(Some(&manager)).await.unwrap();
        assert_eq!(h.server.count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_response_then_retry_reconciles() {
        let h = harness();
        fill_cart(&h.drafts);
        let submission_id = h.drafts.get().submission_id;

        h.server.push(Script::LandThenFail(BackendError::Timeout));
        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.checkout.phase(), CheckoutPhase::Failed { retryable: true });
        // Draft kept with the same key so the retry is idempotent
        assert_eq!(h.drafts.get().submission_id, submission_id);

        let outcome = h.checkout.submit(Some(&operator())).await.unwrap();
        match outcome {
            CheckoutOutcome::DuplicateReconciled(tx) => {
                assert_eq!(tx.submission_id, submission_id);
                assert_eq!(tx.id, "tx-1");
            }
            other => panic!("expected reconciled duplicate, got {other:?}"),
        }
        assert_eq!(h.server.count(), 1);
        assert_eq!(h.server.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.checkout.phase(), CheckoutPhase::DuplicateReconciled);
        assert!(h.drafts.get().is_empty());
    }

    #[tokio::test]
    async fn test_two_terminals_racing_same_submission_commit_once() {
        let server = Arc::new(FakeServer::default());
        let a = harness_with(Arc::clone(&server), Duration::from_secs(5));
        fill_cart(&a.drafts);

        // A second session restored from the same persisted draft
        let raw = serde_json::to_string(&a.drafts.get()).unwrap();
        let slot: Arc<dyn KeyValueSlot> = Arc::new(MemorySlot::with_value(raw));
        let restored = Arc::new(DraftStore::load(slot));
        assert_eq!(restored.get(), a.drafts.get());
        let b = Checkout::new(
            restored,
            server.clone() as Arc<dyn CheckoutBackend>,
            Arc::new(InvalidationBus::new()),
            Duration::from_secs(5),
        );

        // The first request to arrive is slow; the second overtakes it
        server.push(Script::Delay(Duration::from_millis(20)));
        let op = operator();
        let (first, second) = tokio::join!(a.checkout.submit(Some(&op)), b.submit(Some(&op)));

        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(server.count(), 1);
        assert_eq!(outcomes[0].transaction(), outcomes[1].transaction());
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, CheckoutOutcome::DuplicateReconciled(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_with_different_total_is_collision() {
        let h = harness();
        fill_cart(&h.drafts);
        h.server.push(Script::LandThenFail(BackendError::Transient("reset".into())));
        h.checkout.submit(Some(&operator())).await.unwrap_err();

        // Operator changes the cart but the key stays the same
        add(&h.drafts, "sku-5", 5.0, 1);
        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();

        assert_eq!(
            err,
            CheckoutError::SubmissionCollision {
                submission_id: h.drafts.get().submission_id,
                local_total: 65.0,
                server_total: Some(60.0),
            }
        );
        assert!(!err.is_retryable());
        assert_eq!(h.checkout.phase(), CheckoutPhase::Failed { retryable: false });
        assert_eq!(h.drafts.get().items.len(), 2);
        assert_eq!(h.server.count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_signal_without_server_copy_is_collision() {
        let h = harness();
        fill_cart(&h.drafts);
        let submission_id = h.drafts.get().submission_id;
        h.server.push(Script::Fail(BackendError::UniqueViolation {
            submission_id: submission_id.clone(),
        }));

        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert_eq!(
            err,
            CheckoutError::SubmissionCollision {
                submission_id,
                local_total: 60.0,
                server_total: None,
            }
        );
    }

    #[tokio::test]
    async fn test_slow_commit_times_out_as_retryable() {
        let h = harness_with(Arc::new(FakeServer::default()), Duration::from_millis(20));
        fill_cart(&h.drafts);
        h.server.push(Script::Delay(Duration::from_millis(500)));

        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert_eq!(err, CheckoutError::Retryable(BackendError::Timeout));
        assert!(!h.drafts.get().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_commit_is_fatal() {
        let h = harness();
        fill_cart(&h.drafts);
        h.server
            .push(Script::Fail(BackendError::Rejected("terminal disabled".into())));

        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Fatal(_)));
        assert_eq!(h.checkout.phase(), CheckoutPhase::Failed { retryable: false });
        assert!(!h.drafts.get().is_empty());
    }

    #[tokio::test]
    async fn test_resubmit_while_in_flight_is_busy() {
        let h = harness();
        fill_cart(&h.drafts);
        h.server.push(Script::Delay(Duration::from_millis(30)));

        let first = {
            let checkout = Arc::clone(&h.checkout);
            tokio::spawn(async move { checkout.submit(Some(&operator())).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.checkout.phase(), CheckoutPhase::Submitting);

        let err = h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert_eq!(err, CheckoutError::Busy);

        first.await.unwrap().unwrap();
        assert_eq!(h.server.commit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_still_completes_commit() {
        let h = harness();
        fill_cart(&h.drafts);
        h.server.push(Script::Delay(Duration::from_millis(20)));
        let mut phases = h.checkout.subscribe_phase();

        let caller = {
            let checkout = Arc::clone(&h.checkout);
            tokio::spawn(async move { checkout.submit(Some(&operator())).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        caller.abort();

        let committed = phases.wait_for(|p| *p == CheckoutPhase::Committed);
        tokio::time::timeout(Duration::from_secs(1), committed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.server.count(), 1);
        assert!(h.drafts.get().is_empty());
    }

    #[tokio::test]
    async fn test_voucher_records_expense_best_effort() {
        let h = harness();
        add(&h.drafts, "sku-60", 60.0, 1);
        h.drafts.mutate(DraftOp::SetVoucher(15.0)).unwrap();
        h.drafts.mutate(DraftOp::SetPayment(45.0)).unwrap();
        let submission_id = h.drafts.get().submission_id;

        let outcome = h.checkout.submit(Some(&operator())).await.unwrap();
        assert_eq!(outcome.transaction().grand_total, 45.0);

        for _ in 0..50 {
            if !h.server.vouchers.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let vouchers = h.server.vouchers.lock().unwrap().clone();
        assert_eq!(vouchers.len(), 1);
        assert_eq!(vouchers[0].submission_id, submission_id);
        assert_eq!(vouchers[0].amount, 15.0);
    }

    #[tokio::test]
    async fn test_voucher_expense_failure_does_not_fail_checkout() {
        let h = harness();
        add(&h.drafts, "sku-60", 60.0, 1);
        h.drafts.mutate(DraftOp::SetVoucher(60.0)).unwrap();
        h.server.voucher_fails.store(true, Ordering::SeqCst);

        let outcome = h.checkout.submit(Some(&operator())).await.unwrap();
        assert!(matches!(outcome, CheckoutOutcome::Committed(_)));
        assert!(h.drafts.get().is_empty());
    }

    #[tokio::test]
    async fn test_recent_transactions_marks_view_fresh() {
        let h = harness();
        fill_cart(&h.drafts);
        h.checkout.submit(Some(&operator())).await.unwrap();
        assert!(h.bus.is_stale(&QueryKey::RecentTransactions));

        let recent = h.checkout.recent_transactions(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(!h.bus.is_stale(&QueryKey::RecentTransactions));
    }

    #[tokio::test]
    async fn test_slow_recent_transactions_times_out() {
        let h = harness_with(Arc::new(FakeServer::default()), Duration::from_millis(20));
        h.server.slow_reads.store(true, Ordering::SeqCst);
        h.bus.invalidate(QueryKey::RecentTransactions);

        let err = h.checkout.recent_transactions(10).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout);
        assert!(h.bus.is_stale(&QueryKey::RecentTransactions));
    }

    #[tokio::test]
    async fn test_draft_is_frozen_while_commit_in_flight() {
        let h = harness();
        add(&h.drafts, "sku-a", 10.0, 1);
        h.drafts.mutate(DraftOp::SetPayment(10.0)).unwrap();
        h.server.push(Script::Delay(Duration::from_millis(50)));

        let first = {
            let checkout = Arc::clone(&h.checkout);
            tokio::spawn(async move { checkout.submit(Some(&operator())).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.checkout.phase(), CheckoutPhase::Submitting);

        let late = h.drafts.mutate(DraftOp::AddItem {
            product_reference: "sku-b".to_string(),
            display_name: "SKU-B".to_string(),
            unit_price: 99.0,
            quantity: 1,
        });
        assert_eq!(late, Err(DraftError::Locked));

        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.transaction().grand_total, 10.0);
        assert!(h.drafts.get().is_empty());
        assert!(!h.drafts.is_held());
        add(&h.drafts, "sku-b", 99.0, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_releases_draft_for_editing() {
        let h = harness();
        fill_cart(&h.drafts);
        h.server.push(Script::Fail(BackendError::Transient("502".into())));

        h.checkout.submit(Some(&operator())).await.unwrap_err();
        assert!(!h.drafts.is_held());
        h.drafts.mutate(DraftOp::SetPayment(60.0)).unwrap();

        let outcome = h.checkout.submit(Some(&operator())).await.unwrap();
        assert_eq!(outcome.transaction().change, 0.0);

        // Local rejection releases too
        add(&h.drafts, "sku-60", 60.0, 1);
        h.checkout.submit(None).await.unwrap_err();
        assert!(!h.drafts.is_held());
    }
}
