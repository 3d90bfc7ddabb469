//! End-to-end flows against the embedded database backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use small_pos_sync::backend::{CheckoutBackend, CollectionBackend, SqliteBackend};
use small_pos_sync::config::Config;
use small_pos_sync::db;
use small_pos_sync::models::{
    CommittedTransaction, Expense, ExpenseFilters, ExpenseInput, Operator, TransactionHeader,
    TransactionLine, VoucherExpense,
};
use small_pos_sync::storage::{KeyValueSlot, SqliteSlot};
use small_pos_sync::{
    BackendError, CheckoutOutcome, CheckoutPhase, DraftOp, MutationError, QueryKey, Session,
};

/// Commits for real, then loses the response when armed.
struct DroppingBackend {
    inner: SqliteBackend,
    drop_next: AtomicBool,
}

#[async_trait]
impl CheckoutBackend for DroppingBackend {
    async fn commit(
        &self,
        header: &TransactionHeader,
        lines: &[TransactionLine],
    ) -> Result<CommittedTransaction, BackendError> {
        let committed = self.inner.commit(header, lines).await?;
        if self.drop_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Timeout);
        }
        Ok(committed)
    }

    async fn fetch_by_submission_id(
        &self,
        submission_id: &str,
    ) -> Result<Option<CommittedTransaction>, BackendError> {
        self.inner.fetch_by_submission_id(submission_id).await
    }

    async fn record_voucher_expense(&self, entry: &VoucherExpense) -> Result<(), BackendError> {
        self.inner.record_voucher_expense(entry).await
    }

    async fn recent_transactions(
        &self,
        limit: u32,
    ) -> Result<Vec<CommittedTransaction>, BackendError> {
        self.inner.recent_transactions(limit).await
    }
}

/// Expense backend that refuses every write.
struct ReadOnlyExpenses {
    inner: SqliteBackend,
}

#[async_trait]
impl CollectionBackend<Expense> for ReadOnlyExpenses {
    async fn create(&self, _input: &ExpenseInput) -> Result<Expense, BackendError> {
        Err(BackendError::Rejected("ledger period closed".into()))
    }

    async fn update(&self, _id: &str, _input: &ExpenseInput) -> Result<Expense, BackendError> {
        Err(BackendError::Rejected("ledger period closed".into()))
    }

    async fn delete(&self, _id: &str) -> Result<(), BackendError> {
        Err(BackendError::Rejected("ledger period closed".into()))
    }

    async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        filters: &ExpenseFilters,
    ) -> Result<small_pos_sync::models::Page<Expense>, BackendError> {
        self.inner.list_page(page, page_size, filters).await
    }
}

fn cashier() -> Operator {
    Operator {
        id: "op-7".to_string(),
        display_name: "Nikos".to_string(),
        can_backdate: false,
    }
}

fn expense_input(amount: f64, description: &str) -> ExpenseInput {
    ExpenseInput {
        amount,
        description: description.to_string(),
        expense_type: "supplies".to_string(),
        expense_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
    }
}

struct Terminal {
    session: Session,
    sqlite: SqliteBackend,
    checkout_backend: Arc<DroppingBackend>,
}

fn terminal() -> Terminal {
    let db = Arc::new(db::open_in_memory().unwrap());
    let sqlite = SqliteBackend::new(Arc::clone(&db));
    let checkout_backend = Arc::new(DroppingBackend {
        inner: sqlite.clone(),
        drop_next: AtomicBool::new(false),
    });
    let slot: Arc<dyn KeyValueSlot> = Arc::new(SqliteSlot::new(Arc::clone(&db), "active-draft"));
    let config = Config {
        commit_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    let session = Session::assemble(
        db,
        slot,
        checkout_backend.clone(),
        Arc::new(sqlite.clone()),
        &config,
    );
    Terminal {
        session,
        sqlite,
        checkout_backend,
    }
}

fn ring_up(session: &Session) {
    session
        .drafts
        .mutate(DraftOp::AddItem {
            product_reference: "sku-espresso".to_string(),
            display_name: "Espresso".to_string(),
            unit_price: 2.4,
            quantity: 2,
        })
        .unwrap();
    session
        .drafts
        .mutate(DraftOp::AddItem {
            product_reference: "sku-espresso".to_string(),
            display_name: "Espresso".to_string(),
            unit_price: 2.4,
            quantity: 3,
        })
        .unwrap();
    session.drafts.mutate(DraftOp::SetPayment(20.0)).unwrap();
}

#[tokio::test]
async fn dropped_response_retry_commits_exactly_once() {
    let t = terminal();
    ring_up(&t.session);
    let draft = t.session.drafts.get();
    assert_eq!(draft.items.len(), 1);
    assert_eq!(draft.items[0].quantity, 5);
    assert_eq!(t.session.drafts.totals().grand_total, 12.0);

    t.checkout_backend.drop_next.store(true, Ordering::SeqCst);
    let err = t.session.checkout.submit(Some(&cashier())).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(t.session.drafts.get().submission_id, draft.submission_id);

    let outcome = t.session.checkout.submit(Some(&cashier())).await.unwrap();
    let tx = match outcome {
        CheckoutOutcome::DuplicateReconciled(tx) => tx,
        other => panic!("expected reconciled duplicate, got {other:?}"),
    };
    assert_eq!(tx.submission_id, draft.submission_id);
    assert_eq!(tx.grand_total, 12.0);
    assert_eq!(tx.change, 8.0);
    assert_eq!(
        t.session.checkout.phase(),
        CheckoutPhase::DuplicateReconciled
    );

    let recent = t.sqlite.recent_transactions(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0], tx);

    // Draft cleared, including the persisted copy
    assert!(t.session.drafts.get().is_empty());
    let reloaded = small_pos_sync::DraftStore::load(Arc::new(SqliteSlot::new(
        Arc::clone(&t.session.db),
        "active-draft",
    )));
    assert!(reloaded.get().is_empty());
}

#[tokio::test]
async fn voucher_sale_lands_in_expense_ledger() {
    let t = terminal();
    let expenses = &t.session.expenses;
    expenses.refetch(ExpenseFilters::default()).await.unwrap();
    assert!(expenses.visible().is_empty());

    t.session
        .drafts
        .mutate(DraftOp::AddItem {
            product_reference: "sku-cake".to_string(),
            display_name: "Cake".to_string(),
            unit_price: 18.0,
            quantity: 1,
        })
        .unwrap();
    t.session.drafts.mutate(DraftOp::SetVoucher(5.0)).unwrap();
    t.session.drafts.mutate(DraftOp::SetPayment(13.0)).unwrap();
    let submission_id = t.session.drafts.get().submission_id;

    let outcome = t.session.checkout.submit(Some(&cashier())).await.unwrap();
    assert_eq!(outcome.transaction().grand_total, 13.0);
    assert!(t.session.bus.is_stale(&QueryKey::RecentTransactions));

    // The voucher expense is recorded in the background
    let mut listed = Vec::new();
    for _ in 0..100 {
        expenses.refetch(ExpenseFilters::default()).await.unwrap();
        listed = expenses.visible();
        if !listed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].amount, 5.0);
    assert_eq!(
        listed[0].source_submission_id.as_deref(),
        Some(submission_id.as_str())
    );
}

#[tokio::test]
async fn ledger_add_edit_delete_converge_with_database() {
    let t = terminal();
    let expenses = &t.session.expenses;
    expenses.refetch(ExpenseFilters::default()).await.unwrap();

    let created = expenses
        .optimistic_add(expense_input(12.5, "Milk"))
        .await
        .unwrap();
    assert!(t.session.bus.is_stale(&QueryKey::ExpensePage));
    assert!(expenses.rows()[0].is_pending());

    expenses.refetch(ExpenseFilters::default()).await.unwrap();
    let rows = expenses.rows();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].is_pending());
    assert_eq!(rows[0].record().id, created.id);

    let edited = expenses
        .optimistic_edit(&created.id, expense_input(14.0, "Milk and sugar"))
        .await
        .unwrap();
    assert_eq!(edited.amount, 14.0);
    expenses.refetch(ExpenseFilters::default()).await.unwrap();
    assert_eq!(expenses.visible()[0].description, "Milk and sugar");

    expenses.optimistic_delete(&created.id).await.unwrap();
    expenses.refetch(ExpenseFilters::default()).await.unwrap();
    assert!(expenses.visible().is_empty());
    assert_eq!(expenses.total_count(), 0);
}

#[tokio::test]
async fn refused_ledger_writes_roll_back() {
    let db = Arc::new(db::open_in_memory().unwrap());
    let sqlite = SqliteBackend::new(Arc::clone(&db));
    sqlite
        .create(&expense_input(3.0, "Napkins"))
        .await
        .unwrap();
    sqlite
        .create(&expense_input(4.0, "Straws"))
        .await
        .unwrap();

    let slot: Arc<dyn KeyValueSlot> = Arc::new(SqliteSlot::new(Arc::clone(&db), "active-draft"));
    let session = Session::assemble(
        Arc::clone(&db),
        slot,
        Arc::new(sqlite.clone()),
        Arc::new(ReadOnlyExpenses { inner: sqlite }),
        &Config::default(),
    );
    let expenses = &session.expenses;
    expenses.refetch(ExpenseFilters::default()).await.unwrap();
    let before = expenses.rows();
    let target = before[1].record().id.clone();

    let err = expenses
        .optimistic_edit(&target, expense_input(99.0, "Changed"))
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::RolledBack(BackendError::Rejected(_))));
    assert_eq!(expenses.rows(), before);

    expenses.optimistic_delete(&target).await.unwrap_err();
    assert_eq!(expenses.rows(), before);

    expenses
        .optimistic_add(expense_input(1.0, "Lids"))
        .await
        .unwrap_err();
    assert_eq!(expenses.rows(), before);
    assert!(!session.bus.is_stale(&QueryKey::ExpensePage));
}
