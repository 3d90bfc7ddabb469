//! The Small POS - checkout and ledger sync engine
//!
//! Client-side core shared by the sales terminal and the back-office expense
//! ledger: a persisted cart ([`draft`]), derived pricing ([`pricing`]), an
//! idempotent checkout keyed on the draft's submission id ([`checkout`]),
//! optimistic list mutations with rollback ([`ledger`]), and view
//! invalidation after confirmed writes ([`invalidation`]).
//!
//! The server is reached through the traits in [`backend`]: either the admin
//! dashboard over HTTP or the terminal's embedded SQLite database.

pub mod api;
pub mod backend;
pub mod checkout;
pub mod config;
pub mod db;
pub mod draft;
pub mod error;
pub mod invalidation;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod pricing;
pub mod session;
pub mod storage;

pub use checkout::{Checkout, CheckoutOutcome, CheckoutPhase};
pub use config::Config;
pub use draft::{Draft, DraftOp, DraftStore, LineItem};
pub use error::{BackendError, CheckoutError, DraftError, MutationError, ValidationError};
pub use invalidation::{InvalidationBus, QueryKey};
pub use ledger::{LedgerCoordinator, LedgerRecord, Row};
pub use pricing::Totals;
pub use session::Session;
