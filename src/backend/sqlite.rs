//! Embedded authoritative store.
//!
//! Terminals running offline (and the test suite) use the local SQLite
//! database as "the server". Writes follow the same single-transaction shape
//! the admin dashboard uses: header and lines together or not at all, with
//! the unique `submission_id` index as the idempotency guard.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CheckoutBackend, CollectionBackend};
use crate::db::DbState;
use crate::error::BackendError;
use crate::models::{
    CommittedTransaction, Expense, ExpenseFilters, ExpenseInput, Page, TransactionHeader,
    TransactionLine, VoucherExpense, VOUCHER_EXPENSE_TYPE,
};

/// Backend over the local database.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<DbState>,
}

impl SqliteBackend {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn run<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Connection) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .conn
                .lock()
                .map_err(|_| BackendError::Transient("database lock poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| BackendError::Transient(format!("database task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_error(context: &'static str) -> impl Fn(rusqlite::Error) -> BackendError {
    move |e| BackendError::Transient(format!("{context}: {e}"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const TRANSACTION_COLUMNS: &str = "id, submission_id, grand_total, payment_amount, \
     voucher_amount, change_amount, operator_id, committed_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<CommittedTransaction> {
    Ok(CommittedTransaction {
        id: row.get(0)?,
        submission_id: row.get(1)?,
        grand_total: row.get(2)?,
        payment_amount: row.get(3)?,
        voucher_amount: row.get(4)?,
        change: row.get(5)?,
        operator_id: row.get(6)?,
        committed_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
    })
}

const EXPENSE_COLUMNS: &str =
    "id, amount, description, expense_type, expense_date, source_submission_id";

fn expense_from_row(row: &Row<'_>) -> rusqlite::Result<Expense> {
    Ok(Expense {
        id: row.get(0)?,
        amount: row.get(1)?,
        description: row.get(2)?,
        expense_type: row.get(3)?,
        expense_date: parse_date(4, &row.get::<_, String>(4)?)?,
        source_submission_id: row.get(5)?,
    })
}

fn load_transaction(
    conn: &Connection,
    submission_id: &str,
) -> Result<Option<CommittedTransaction>, BackendError> {
    conn.query_row(
        &format!("SELECT {TRANSACTION_COLUMNS} FROM pos_transactions WHERE submission_id = ?1"),
        params![submission_id],
        transaction_from_row,
    )
    .optional()
    .map_err(db_error("query transaction"))
}

fn load_expense(conn: &Connection, id: &str) -> Result<Expense, BackendError> {
    conn.query_row(
        &format!("SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ?1"),
        params![id],
        expense_from_row,
    )
    .optional()
    .map_err(db_error("query expense"))?
    .ok_or_else(|| BackendError::NotFound(id.to_string()))
}

fn validate_expense(input: &ExpenseInput) -> Result<(), BackendError> {
    if !input.amount.is_finite() || input.amount < 0.0 {
        return Err(BackendError::Rejected(
            "amount must be a non-negative number".to_string(),
        ));
    }
    if input.description.trim().is_empty() {
        return Err(BackendError::Rejected("description is required".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

#[async_trait]
impl CheckoutBackend for SqliteBackend {
    async fn commit(
        &self,
        header: &TransactionHeader,
        lines: &[TransactionLine],
    ) -> Result<CommittedTransaction, BackendError> {
        if lines.is_empty() {
            return Err(BackendError::Rejected(
                "transaction has no line items".to_string(),
            ));
        }
        let header = header.clone();
        let lines = lines.to_vec();

        self.run(move |conn| {
            let tx_id = Uuid::new_v4().to_string();
            // Stored at microsecond precision; keep the echo identical.
            let now = Utc::now().trunc_subsecs(6);

            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(db_error("begin transaction"))?;

            let result = (|| -> Result<(), BackendError> {
                conn.execute(
                    "INSERT INTO pos_transactions (
                        id, submission_id, customer_reference, payment_amount,
                        voucher_amount, grand_total, change_amount, operator_id,
                        effective_date, committed_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        tx_id,
                        header.submission_id,
                        header.customer_reference,
                        header.payment_amount,
                        header.voucher_amount,
                        header.grand_total,
                        header.change,
                        header.operator_id,
                        header.effective_date.map(timestamp),
                        timestamp(now),
                    ],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        BackendError::UniqueViolation {
                            submission_id: header.submission_id.clone(),
                        }
                    } else {
                        BackendError::Transient(format!("insert transaction: {e}"))
                    }
                })?;

                for (line_no, line) in lines.iter().enumerate() {
                    conn.execute(
                        "INSERT INTO pos_transaction_items (
                            transaction_id, line_no, product_reference, display_name,
                            unit_price, quantity, discount
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            tx_id,
                            line_no as i64,
                            line.product_reference,
                            line.display_name,
                            line.unit_price,
                            line.quantity,
                            line.discount,
                        ],
                    )
                    .map_err(|e| {
                        if matches!(
                            e.sqlite_error_code(),
                            Some(rusqlite::ErrorCode::ConstraintViolation)
                        ) {
                            BackendError::Rejected(format!("invalid line {line_no}: {e}"))
                        } else {
                            BackendError::Transient(format!("insert line: {e}"))
                        }
                    })?;
                }
                Ok(())
            })();

            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT").map_err(db_error("commit"))?;
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }

            info!(
                transaction_id = %tx_id,
                submission_id = %header.submission_id,
                lines = lines.len(),
                grand_total = header.grand_total,
                "Transaction committed"
            );

            Ok(CommittedTransaction {
                id: tx_id,
                submission_id: header.submission_id.clone(),
                grand_total: header.grand_total,
                payment_amount: header.payment_amount,
                voucher_amount: header.voucher_amount,
                change: header.change,
                operator_id: header.operator_id.clone(),
                committed_at: now,
            })
        })
        .await
    }

    async fn fetch_by_submission_id(
        &self,
        submission_id: &str,
    ) -> Result<Option<CommittedTransaction>, BackendError> {
        let submission_id = submission_id.to_string();
        self.run(move |conn| load_transaction(conn, &submission_id))
            .await
    }

    async fn record_voucher_expense(&self, entry: &VoucherExpense) -> Result<(), BackendError> {
        let entry = entry.clone();
        self.run(move |conn| {
            let now = timestamp(Utc::now());
            // One derived entry per sale; replays are ignored.
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO expenses (
                        id, amount, description, expense_type, expense_date,
                        source_submission_id, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        entry.amount,
                        entry.description(),
                        VOUCHER_EXPENSE_TYPE,
                        entry.expense_date.to_string(),
                        entry.submission_id,
                        now,
                    ],
                )
                .map_err(db_error("insert voucher expense"))?;
            if inserted == 0 {
                debug!(submission_id = %entry.submission_id, "Voucher expense already recorded");
            }
            Ok(())
        })
        .await
    }

    async fn recent_transactions(
        &self,
        limit: u32,
    ) -> Result<Vec<CommittedTransaction>, BackendError> {
        self.run(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM pos_transactions
                     ORDER BY committed_at DESC LIMIT ?1"
                ))
                .map_err(db_error("prepare recent transactions"))?;
            let rows = stmt
                .query_map(params![limit], transaction_from_row)
                .map_err(db_error("query recent transactions"))?;

            let mut out = Vec::new();
            for row in rows {
                match row {
                    Ok(tx) => out.push(tx),
                    Err(e) => warn!("skipping malformed transaction row: {e}"),
                }
            }
            Ok(out)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Expense ledger
// ---------------------------------------------------------------------------

#[async_trait]
impl CollectionBackend<Expense> for SqliteBackend {
    async fn create(&self, input: &ExpenseInput) -> Result<Expense, BackendError> {
        validate_expense(input)?;
        let input = input.clone();
        self.run(move |conn| {
            let id = Uuid::new_v4().to_string();
            let now = timestamp(Utc::now());
            conn.execute(
                "INSERT INTO expenses (
                    id, amount, description, expense_type, expense_date,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id,
                    input.amount,
                    input.description.trim(),
                    input.expense_type,
                    input.expense_date.to_string(),
                    now,
                ],
            )
            .map_err(db_error("insert expense"))?;
            info!(expense_id = %id, amount = input.amount, "Expense recorded");
            load_expense(conn, &id)
        })
        .await
    }

    async fn update(&self, id: &str, input: &ExpenseInput) -> Result<Expense, BackendError> {
        validate_expense(input)?;
        let id = id.to_string();
        let input = input.clone();
        self.run(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE expenses SET
                        amount = ?1, description = ?2, expense_type = ?3,
                        expense_date = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        input.amount,
                        input.description.trim(),
                        input.expense_type,
                        input.expense_date.to_string(),
                        timestamp(Utc::now()),
                        id,
                    ],
                )
                .map_err(db_error("update expense"))?;
            if changed == 0 {
                return Err(BackendError::NotFound(id));
            }
            load_expense(conn, &id)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        let id = id.to_string();
        self.run(move |conn| {
            let removed = conn
                .execute("DELETE FROM expenses WHERE id = ?1", params![id])
                .map_err(db_error("delete expense"))?;
            if removed == 0 {
                return Err(BackendError::NotFound(id));
            }
            info!(expense_id = %id, "Expense deleted");
            Ok(())
        })
        .await
    }

    async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        filters: &ExpenseFilters,
    ) -> Result<Page<Expense>, BackendError> {
        let filters = filters.clone();
        self.run(move |conn| {
            let from = filters.from.map(|d| d.to_string());
            let to = filters.to.map(|d| d.to_string());
            let where_clause = "(?1 IS NULL OR expense_date >= ?1)
                 AND (?2 IS NULL OR expense_date <= ?2)
                 AND (?3 IS NULL OR expense_type = ?3)";

            let total_count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM expenses WHERE {where_clause}"),
                    params![from, to, filters.expense_type],
                    |row| row.get(0),
                )
                .map_err(db_error("count expenses"))?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE {where_clause}
                     ORDER BY expense_date DESC, created_at DESC, id
                     LIMIT ?4 OFFSET ?5"
                ))
                .map_err(db_error("prepare expense page"))?;
            let offset = i64::from(page) * i64::from(page_size);
            let rows = stmt
                .query_map(
                    params![from, to, filters.expense_type, page_size, offset],
                    expense_from_row,
                )
                .map_err(db_error("query expense page"))?;

            let mut items = Vec::new();
            for row in rows {
                match row {
                    Ok(expense) => items.push(expense),
                    Err(e) => warn!("skipping malformed expense row: {e}"),
                }
            }

            Ok(Page {
                items,
                total_count: u64::try_from(total_count).unwrap_or(0),
            })
        })
        .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
