//! Wire and record types shared by the checkout and ledger engines.
//!
//! Field names serialize as camelCase to match the admin dashboard API.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// Signed-in staff member, supplied by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: String,
    pub display_name: String,
    /// May commit with an effective date other than "now".
    #[serde(default)]
    pub can_backdate: bool,
}

// ---------------------------------------------------------------------------
// Checkout commit
// ---------------------------------------------------------------------------

/// Transaction header sent with a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHeader {
    pub submission_id: String,
    pub customer_reference: Option<String>,
    pub payment_amount: f64,
    pub voucher_amount: f64,
    pub grand_total: f64,
    pub change: f64,
    pub operator_id: String,
    pub effective_date: Option<DateTime<Utc>>,
}

/// One committed line, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLine {
    pub product_reference: String,
    pub display_name: String,
    pub unit_price: f64,
    pub quantity: u32,
    pub discount: f64,
}

/// Authoritative transaction as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedTransaction {
    pub id: String,
    pub submission_id: String,
    pub grand_total: f64,
    pub payment_amount: f64,
    pub voucher_amount: f64,
    pub change: f64,
    pub operator_id: String,
    pub committed_at: DateTime<Utc>,
}

/// Ledger entry derived from a voucher redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherExpense {
    pub submission_id: String,
    pub amount: f64,
    pub operator_id: String,
    pub expense_date: NaiveDate,
}

/// Expense type recorded for voucher redemptions.
pub const VOUCHER_EXPENSE_TYPE: &str = "voucher";

impl VoucherExpense {
    /// Ledger description shared by every backend.
    pub fn description(&self) -> String {
        format!(
            "Voucher redeemed on sale {} by {}",
            self.submission_id, self.operator_id
        )
    }
}

// ---------------------------------------------------------------------------
// Expense ledger
// ---------------------------------------------------------------------------

/// Expense ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub amount: f64,
    pub description: String,
    pub expense_type: String,
    pub expense_date: NaiveDate,
    /// Checkout that produced this entry, for voucher-derived rows.
    pub source_submission_id: Option<String>,
}

/// Create/update payload for an expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseInput {
    pub amount: f64,
    pub description: String,
    pub expense_type: String,
    pub expense_date: NaiveDate,
}

/// Filters applied to the expense ledger listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseFilters {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub expense_type: Option<String>,
}

/// One page of a remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<R> {
    pub items: Vec<R>,
    pub total_count: u64,
}
