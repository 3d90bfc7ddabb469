//! Error taxonomy for the checkout and ledger engines.
//!
//! Every failure is classified at the layer that observes it. Local
//! validation never reaches the backend; backend failures are mapped into
//! retryable or fatal outcomes before anything is shown to the operator.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Failure reported by a remote (or embedded) backend call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// The server already holds a transaction with this submission id.
    #[error("submission {submission_id} already exists")]
    UniqueViolation { submission_id: String },

    /// The call did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// Network failure or 5xx. Safe to retry with the same idempotency key.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// The server refused the request (4xx other than a uniqueness conflict).
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// Target record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Draft
// ---------------------------------------------------------------------------

/// Rejected draft mutation. The draft is left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DraftError {
    #[error("quantity must be at least 1")]
    InvalidQuantity,
    #[error("{field} must not be negative")]
    NegativeAmount { field: &'static str },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("no line item at position {0}")]
    UnknownLine(usize),
    /// A checkout of this draft is in flight.
    #[error("draft is locked while its checkout is in progress")]
    Locked,
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

/// Why a checkout was refused before any network call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("cart is empty")]
    EmptyCart,
    #[error("no operator is signed in")]
    MissingOperator,
    #[error("payment must not be negative")]
    NegativePayment,
    #[error("voucher must not be negative")]
    NegativeVoucher,
    #[error("payment does not cover the total (short by {shortfall:.2})")]
    NegativeChange { shortfall: f64 },
    #[error("a non-free sale needs a payment or voucher")]
    MissingPayment,
    #[error("operator {operator_id} may not backdate transactions")]
    BackdateNotAllowed { operator_id: String },
}

/// Outcome of a failed checkout attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckoutError {
    #[error("checkout rejected: {0}")]
    Validation(#[from] ValidationError),

    /// A checkout for this draft is already validating or in flight.
    #[error("a checkout is already in progress")]
    Busy,

    /// Timeout or transient failure. Resubmitting reuses the same
    /// submission id, so retrying cannot double-charge.
    #[error("checkout did not complete: {0}")]
    Retryable(BackendError),

    /// The submission id was already committed with a different total, or
    /// the server reported a duplicate it could not produce.
    #[error("submission {submission_id} collides with a committed transaction (local total {local_total:.2})")]
    SubmissionCollision {
        submission_id: String,
        local_total: f64,
        server_total: Option<f64>,
    },

    /// Non-retryable backend refusal.
    #[error("checkout failed: {0}")]
    Fatal(BackendError),
}

impl CheckoutError {
    /// Retryable failures keep the draft intact for a resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Operator-facing text. Raw transport detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(reason) => reason.to_string(),
            Self::Busy => "Checkout is already being processed, please wait".to_string(),
            Self::Retryable(BackendError::Timeout) => {
                "The server did not answer in time. Please submit again.".to_string()
            }
            Self::Retryable(_) => {
                "Could not reach the server. Please submit again.".to_string()
            }
            Self::SubmissionCollision { .. } => {
                "This sale conflicts with one already recorded. Refresh and enter it again."
                    .to_string()
            }
            Self::Fatal(_) => "The server refused this sale.".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Failed optimistic list mutation. The view has already been rolled back
/// when this is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("row {0} is not on the current page")]
    UnknownRow(String),

    #[error("write failed and was rolled back: {0}")]
    RolledBack(BackendError),

    /// The mutation task died before reporting an outcome.
    #[error("mutation task did not complete: {0}")]
    Interrupted(String),
}

impl MutationError {
    pub fn user_message(&self) -> String {
        match self {
            Self::UnknownRow(_) => "That entry is no longer on screen. Refresh and try again."
                .to_string(),
            Self::RolledBack(e) if e.is_retryable() => {
                "Could not save the change. It has been undone, please try again.".to_string()
            }
            Self::RolledBack(_) => "The server refused the change. It has been undone.".to_string(),
            Self::Interrupted(_) => "Something went wrong. Refresh to see the latest entries."
                .to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Failure of a durable key-value slot.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("keyring: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("slot lock poisoned")]
    Poisoned,
}
