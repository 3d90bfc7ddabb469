//! Server-facing interfaces.
//!
//! The engines only talk to the authoritative store through these traits.
//! Two implementations ship: [`sqlite::SqliteBackend`] for terminals running
//! against the embedded database, and [`http::HttpBackend`] for the admin
//! dashboard API.

use async_trait::async_trait;

use crate::error::BackendError;
use crate::ledger::LedgerRecord;
use crate::models::{
    CommittedTransaction, Page, TransactionHeader, TransactionLine, VoucherExpense,
};

pub mod http;
pub mod sqlite;

pub use http::HttpBackend;
pub use sqlite::SqliteBackend;

/// Checkout side of the server.
#[async_trait]
pub trait CheckoutBackend: Send + Sync {
    /// Atomically write the header and all lines. Must fail with
    /// [`BackendError::UniqueViolation`] when `header.submission_id` was
    /// already committed.
    async fn commit(
        &self,
        header: &TransactionHeader,
        lines: &[TransactionLine],
    ) -> Result<CommittedTransaction, BackendError>;

    /// Authoritative read used to reconcile duplicate submissions.
    async fn fetch_by_submission_id(
        &self,
        submission_id: &str,
    ) -> Result<Option<CommittedTransaction>, BackendError>;

    /// Record the ledger entry derived from a voucher redemption.
    async fn record_voucher_expense(&self, entry: &VoucherExpense) -> Result<(), BackendError>;

    /// Most recent committed sales, newest first.
    async fn recent_transactions(
        &self,
        limit: u32,
    ) -> Result<Vec<CommittedTransaction>, BackendError>;
}

/// Paginated remote collection of `R`.
#[async_trait]
pub trait CollectionBackend<R: LedgerRecord>: Send + Sync {
    async fn create(&self, input: &R::Input) -> Result<R, BackendError>;

    async fn update(&self, id: &str, input: &R::Input) -> Result<R, BackendError>;

    async fn delete(&self, id: &str) -> Result<(), BackendError>;

    /// `page` is zero-based.
    async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        filters: &R::Filters,
    ) -> Result<Page<R>, BackendError>;
}
