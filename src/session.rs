//! Wires the engines together for one terminal session.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::api::ApiClient;
use crate::backend::{CheckoutBackend, CollectionBackend, HttpBackend, SqliteBackend};
use crate::checkout::Checkout;
use crate::config::{Config, DraftSlotKind};
use crate::db::{self, DbState};
use crate::draft::DraftStore;
use crate::invalidation::{InvalidationBus, QueryKey};
use crate::ledger::LedgerCoordinator;
use crate::models::Expense;
use crate::storage::{KeyValueSlot, KeyringSlot, MemorySlot, SqliteSlot};

/// Everything a terminal UI needs: the draft, checkout, and expense ledger
/// sharing one invalidation bus.
pub struct Session {
    pub db: Arc<DbState>,
    pub bus: Arc<InvalidationBus>,
    pub drafts: Arc<DraftStore>,
    pub checkout: Arc<Checkout>,
    pub expenses: Arc<LedgerCoordinator<Expense>>,
}

fn draft_key(config: &Config) -> String {
    format!(
        "active-draft:{}",
        config.terminal_id.as_deref().unwrap_or("default")
    )
}

impl Session {
    /// Open the local database and pick the backend: the admin dashboard
    /// when credentials are configured, the embedded database otherwise.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let db = Arc::new(db::init(&config.db_path).map_err(anyhow::Error::msg)?);

        let (checkout_backend, expense_backend): (
            Arc<dyn CheckoutBackend>,
            Arc<dyn CollectionBackend<Expense>>,
        ) = match config.admin_credentials() {
            Some((url, key)) => {
                let api = ApiClient::new(
                    url,
                    key,
                    config.terminal_id.clone(),
                    config.commit_timeout,
                )
                .context("building admin dashboard client")?;
                info!(admin_url = %api.base_url(), "Using admin dashboard backend");
                let backend = Arc::new(HttpBackend::new(api));
                (backend.clone(), backend)
            }
            None => {
                info!(db_path = %config.db_path.display(), "Using embedded database backend");
                let backend = Arc::new(SqliteBackend::new(Arc::clone(&db)));
                (backend.clone(), backend)
            }
        };

        let slot: Arc<dyn KeyValueSlot> = match config.draft_slot {
            DraftSlotKind::Memory => Arc::new(MemorySlot::new()),
            DraftSlotKind::Sqlite => Arc::new(SqliteSlot::new(Arc::clone(&db), &draft_key(config))),
            DraftSlotKind::Keyring => Arc::new(KeyringSlot::new(&draft_key(config))),
        };

        Ok(Self::assemble(db, slot, checkout_backend, expense_backend, config))
    }

    /// Build a session from explicit parts.
    pub fn assemble(
        db: Arc<DbState>,
        slot: Arc<dyn KeyValueSlot>,
        checkout_backend: Arc<dyn CheckoutBackend>,
        expense_backend: Arc<dyn CollectionBackend<Expense>>,
        config: &Config,
    ) -> Self {
        let bus = Arc::new(InvalidationBus::new());
        let drafts = Arc::new(DraftStore::load(slot));
        let checkout = Checkout::new(
            Arc::clone(&drafts),
            checkout_backend,
            Arc::clone(&bus),
            config.commit_timeout,
        );
        let expenses = LedgerCoordinator::new(
            expense_backend,
            Arc::clone(&bus),
            QueryKey::ExpensePage,
            config.ledger_options(),
        );
        Self {
            db,
            bus,
            drafts,
            checkout,
            expenses,
        }
    }
}
