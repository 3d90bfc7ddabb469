//! Optimistic list mutations against a paginated remote collection.
//!
//! The coordinator owns the in-memory first page of a collection. Add, edit
//! and delete are applied to that page immediately as [`Row::Pending`]
//! entries, then written to the backend. Success invalidates the page so a
//! refetch brings in authoritative rows; failure restores the snapshot the
//! pending row was created with.
//!
//! Mutations on the same row id run one at a time. A queued mutation applies
//! its optimistic change only once the previous one has settled, so every
//! snapshot is a known-good row.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::CollectionBackend;
use crate::error::{BackendError, MutationError};
use crate::invalidation::{InvalidationBus, QueryKey};
use crate::models::{Expense, ExpenseFilters, ExpenseInput};

/// Prefix of client-generated ids. Server ids never start with it.
pub const TEMP_ID_PREFIX: &str = "tmp-";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Record contract
// ---------------------------------------------------------------------------

/// A row type the coordinator can manage.
pub trait LedgerRecord: Clone + PartialEq + Debug + Send + Sync + 'static {
    /// Create/update payload.
    type Input: Clone + PartialEq + Debug + Send + Sync + 'static;
    /// Listing filters.
    type Filters: Clone + Default + Debug + Send + Sync + 'static;

    fn id(&self) -> &str;

    /// Row shown while a create is in flight.
    fn placeholder(temp_id: &str, input: &Self::Input) -> Self;

    /// This row with `input` applied, as shown while an edit is in flight.
    fn with_input(&self, input: &Self::Input) -> Self;
}

impl LedgerRecord for Expense {
    type Input = ExpenseInput;
    type Filters = ExpenseFilters;

    fn id(&self) -> &str {
        &self.id
    }

    fn placeholder(temp_id: &str, input: &ExpenseInput) -> Self {
        Expense {
            id: temp_id.to_string(),
            amount: input.amount,
            description: input.description.clone(),
            expense_type: input.expense_type.clone(),
            expense_date: input.expense_date,
            source_submission_id: None,
        }
    }

    fn with_input(&self, input: &ExpenseInput) -> Self {
        Expense {
            amount: input.amount,
            description: input.description.clone(),
            expense_type: input.expense_type.clone(),
            expense_date: input.expense_date,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Intended write carried by a pending row.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingPayload<R: LedgerRecord> {
    Create(R::Input),
    Update(R::Input),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    /// Applied locally, write not yet sent.
    Optimistic,
    /// Write in flight.
    Syncing,
    /// Create confirmed as `confirmed_id`; waiting for a refetch to surface it.
    AwaitingRefetch { confirmed_id: String },
}

/// What a rollback restores.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot<R> {
    /// Nothing was there: rollback removes the row.
    Absent,
    /// Rollback puts this committed row back in place.
    Committed(R),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRow<R: LedgerRecord> {
    /// Client id of this mutation. For creates it is also the displayed id.
    pub temp_id: String,
    /// Server id of the row being edited or deleted.
    pub target_id: Option<String>,
    pub payload: PendingPayload<R>,
    pub state: PendingState,
    /// Record as currently displayed.
    pub display: R,
    pub snapshot: Snapshot<R>,
    /// Time of the last state change.
    pub since: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Row<R: LedgerRecord> {
    Committed(R),
    Pending(PendingRow<R>),
}

impl<R: LedgerRecord> Row<R> {
    /// Record as displayed.
    pub fn record(&self) -> &R {
        match self {
            Row::Committed(r) => r,
            Row::Pending(p) => &p.display,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Row::Pending(_))
    }

    /// A pending delete hides its row.
    pub fn is_visible(&self) -> bool {
        !matches!(
            self,
            Row::Pending(PendingRow {
                payload: PendingPayload::Delete,
                ..
            })
        )
    }

    fn temp_id(&self) -> Option<&str> {
        match self {
            Row::Pending(p) => Some(&p.temp_id),
            Row::Committed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct View<R: LedgerRecord> {
    rows: Vec<Row<R>>,
    total_count: u64,
    filters: R::Filters,
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub page_size: u32,
    /// How long a confirmed create may stay unreconciled before a refetch
    /// drops its placeholder.
    pub reconcile_timeout: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            reconcile_timeout: Duration::from_secs(30),
        }
    }
}

pub struct LedgerCoordinator<R: LedgerRecord> {
    backend: Arc<dyn CollectionBackend<R>>,
    bus: Arc<InvalidationBus>,
    key: QueryKey,
    options: LedgerOptions,
    view: Mutex<View<R>>,
    row_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<R: LedgerRecord> LedgerCoordinator<R> {
    /// `key` is the view invalidated after every confirmed write.
    pub fn new(
        backend: Arc<dyn CollectionBackend<R>>,
        bus: Arc<InvalidationBus>,
        key: QueryKey,
        options: LedgerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            bus,
            key,
            options,
            view: Mutex::new(View {
                rows: Vec::new(),
                total_count: 0,
                filters: R::Filters::default(),
            }),
            row_locks: Mutex::new(HashMap::new()),
        })
    }

    fn view(&self) -> MutexGuard<'_, View<R>> {
        self.view.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -- Read side ----------------------------------------------------------

    /// Every row of the first page, including hidden pending deletes.
    pub fn rows(&self) -> Vec<Row<R>> {
        self.view().rows.clone()
    }

    /// Records as the operator sees them.
    pub fn visible(&self) -> Vec<R> {
        self.view()
            .rows
            .iter()
            .filter(|row| row.is_visible())
            .map(|row| row.record().clone())
            .collect()
    }

    /// Server-reported size of the whole collection.
    pub fn total_count(&self) -> u64 {
        self.view().total_count
    }

    pub fn filters(&self) -> R::Filters {
        self.view().filters.clone()
    }

    /// Load the first page for `filters` and merge it with in-flight rows.
    pub async fn refetch(&self, filters: R::Filters) -> Result<(), BackendError> {
        let observed = self.bus.generation(&self.key);
        let page = self
            .backend
            .list_page(0, self.options.page_size, &filters)
            .await?;

        {
            let mut view = self.view();
            let rows = std::mem::take(&mut view.rows);
            view.rows = merge_page(rows, page.items, self.options.reconcile_timeout);
            view.total_count = page.total_count;
            view.filters = filters;
        }
        self.bus.mark_fresh(&self.key, observed);
        Ok(())
    }

    /// Refetch with the current filters if the view was invalidated.
    pub async fn refresh_if_stale(&self) -> Result<bool, BackendError> {
        if !self.bus.is_stale(&self.key) {
            return Ok(false);
        }
        self.refetch(self.filters()).await?;
        Ok(true)
    }

    /// Refetch whenever this coordinator's view is invalidated.
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            info!(key = ?this.key, "Ledger auto-refresh started");
            loop {
                match rx.recv().await {
                    Ok(event) if event.key == this.key => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Invalidation receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
                if let Err(e) = this.refresh_if_stale().await {
                    warn!(key = ?this.key, error = %e, "Ledger refresh failed");
                }
            }
            info!(key = ?this.key, "Ledger auto-refresh stopped");
        })
    }

    // -- Write side ---------------------------------------------------------

    /// Show `input` at the top of the page and create it on the server.
    ///
    /// The write runs on its own task; dropping the returned future does not
    /// abort it.
    pub async fn optimistic_add(self: &Arc<Self>, input: R::Input) -> Result<R, MutationError> {
        let this = Arc::clone(self);
        join(tokio::spawn(async move { this.run_add(input).await }).await)
    }

    /// Apply `input` to row `id` in place and update it on the server.
    pub async fn optimistic_edit(
        self: &Arc<Self>,
        id: &str,
        input: R::Input,
    ) -> Result<R, MutationError> {
        let this = Arc::clone(self);
        let id = id.to_string();
        join(tokio::spawn(async move { this.run_edit(id, input).await }).await)
    }

    /// Hide row `id` and delete it on the server.
    pub async fn optimistic_delete(self: &Arc<Self>, id: &str) -> Result<(), MutationError> {
        let this = Arc::clone(self);
        let id = id.to_string();
        join(tokio::spawn(async move { this.run_delete(id).await }).await)
    }

    /// Fire-and-forget add; failures are logged.
    pub fn spawn_add(self: &Arc<Self>, input: R::Input) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_add(input).await {
                warn!(error = %e, "Detached ledger add failed");
            }
        })
    }

    pub fn spawn_edit(self: &Arc<Self>, id: &str, input: R::Input) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.run_edit(id.clone(), input).await {
                warn!(row_id = %id, error = %e, "Detached ledger edit failed");
            }
        })
    }

    pub fn spawn_delete(self: &Arc<Self>, id: &str) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.run_delete(id.clone()).await {
                warn!(row_id = %id, error = %e, "Detached ledger delete failed");
            }
        })
    }

    async fn run_add(&self, input: R::Input) -> Result<R, MutationError> {
        let temp_id = new_temp_id();
        {
            let mut view = self.view();
            view.rows.insert(
                0,
                Row::Pending(PendingRow {
                    temp_id: temp_id.clone(),
                    target_id: None,
                    display: R::placeholder(&temp_id, &input),
                    payload: PendingPayload::Create(input.clone()),
                    state: PendingState::Optimistic,
                    snapshot: Snapshot::Absent,
                    since: Instant::now(),
                }),
            );
        }
        self.set_state(&temp_id, PendingState::Syncing);
        debug!(temp_id = %temp_id, "Optimistic add in flight");

        match self.backend.create(&input).await {
            Ok(created) => {
                let confirmed_id = created.id().to_string();
                {
                    let mut view = self.view();
                    let already_listed = view
                        .rows
                        .iter()
                        .any(|row| !row.is_pending() && row.record().id() == confirmed_id);
                    if let Some(idx) = position_of(&view.rows, &temp_id) {
                        if already_listed {
                            view.rows.remove(idx);
                        } else if let Row::Pending(p) = &mut view.rows[idx] {
                            p.display = created.clone();
                            p.state = PendingState::AwaitingRefetch {
                                confirmed_id: confirmed_id.clone(),
                            };
                            p.since = Instant::now();
                        }
                    }
                    view.total_count += 1;
                }
                info!(temp_id = %temp_id, row_id = %confirmed_id, "Ledger add confirmed");
                self.bus.invalidate(self.key.clone());
                Ok(created)
            }
            Err(e) => {
                {
                    let mut view = self.view();
                    if let Some(idx) = position_of(&view.rows, &temp_id) {
                        view.rows.remove(idx);
                    }
                }
                warn!(temp_id = %temp_id, error = %e, "Ledger add failed, placeholder removed");
                Err(MutationError::RolledBack(e))
            }
        }
    }

    async fn run_edit(&self, id: String, input: R::Input) -> Result<R, MutationError> {
        let lock = self.row_lock(&id);
        let guard = lock.lock().await;
        let result = self.apply_edit(&id, input).await;
        drop(guard);
        drop(lock);
        self.release_row_lock(&id);
        result
    }

    async fn apply_edit(&self, id: &str, input: R::Input) -> Result<R, MutationError> {
        let temp_id = self.begin_row_mutation(id, |current| {
            (
                current.with_input(&input),
                PendingPayload::Update(input.clone()),
            )
        })?;
        self.set_state(&temp_id, PendingState::Syncing);
        debug!(row_id = %id, "Optimistic edit in flight");

        match self.backend.update(id, &input).await {
            Ok(updated) => {
                {
                    let mut view = self.view();
                    if let Some(idx) = position_of(&view.rows, &temp_id) {
                        view.rows[idx] = Row::Committed(updated.clone());
                    }
                }
                info!(row_id = %id, "Ledger edit confirmed");
                self.bus.invalidate(self.key.clone());
                Ok(updated)
            }
            Err(e) => {
                self.roll_back(&temp_id);
                warn!(row_id = %id, error = %e, "Ledger edit failed, row restored");
                Err(MutationError::RolledBack(e))
            }
        }
    }

    async fn run_delete(&self, id: String) -> Result<(), MutationError> {
        let lock = self.row_lock(&id);
        let guard = lock.lock().await;
        let result = self.apply_delete(&id).await;
        drop(guard);
        drop(lock);
        self.release_row_lock(&id);
        result
    }

    async fn apply_delete(&self, id: &str) -> Result<(), MutationError> {
        let temp_id =
            self.begin_row_mutation(id, |current| (current.clone(), PendingPayload::Delete))?;
        self.set_state(&temp_id, PendingState::Syncing);
        debug!(row_id = %id, "Optimistic delete in flight");

        match self.backend.delete(id).await {
            Ok(()) => {
                {
                    let mut view = self.view();
                    if let Some(idx) = position_of(&view.rows, &temp_id) {
                        view.rows.remove(idx);
                    }
                    view.total_count = view.total_count.saturating_sub(1);
                }
                info!(row_id = %id, "Ledger delete confirmed");
                self.bus.invalidate(self.key.clone());
                Ok(())
            }
            Err(e) => {
                self.roll_back(&temp_id);
                warn!(row_id = %id, error = %e, "Ledger delete failed, row restored");
                Err(MutationError::RolledBack(e))
            }
        }
    }

    /// Swap committed row `id` for a pending row built by `build`.
    /// Returns the pending row's temp id.
    ///
    /// A confirmed create still waiting for its refetch already shows the
    /// server's row, so it counts as committed here.
    fn begin_row_mutation(
        &self,
        id: &str,
        build: impl FnOnce(&R) -> (R, PendingPayload<R>),
    ) -> Result<String, MutationError> {
        let mut view = self.view();
        let found = view.rows.iter().enumerate().find_map(|(idx, row)| match row {
            Row::Committed(r) if r.id() == id => Some((idx, r.clone())),
            Row::Pending(PendingRow {
                state: PendingState::AwaitingRefetch { confirmed_id },
                display,
                ..
            }) if confirmed_id == id => Some((idx, display.clone())),
            _ => None,
        });
        let (idx, current) = found.ok_or_else(|| MutationError::UnknownRow(id.to_string()))?;

        let (display, payload) = build(&current);
        let temp_id = new_temp_id();
        view.rows[idx] = Row::Pending(PendingRow {
            temp_id: temp_id.clone(),
            target_id: Some(id.to_string()),
            payload,
            state: PendingState::Optimistic,
            display,
            snapshot: Snapshot::Committed(current),
            since: Instant::now(),
        });
        Ok(temp_id)
    }

    /// Restore the snapshot of pending row `temp_id` at its position.
    fn roll_back(&self, temp_id: &str) {
        let mut view = self.view();
        let Some(idx) = position_of(&view.rows, temp_id) else {
            // A refetch already dropped it
            return;
        };
        let snapshot = match &view.rows[idx] {
            Row::Pending(p) => p.snapshot.clone(),
            Row::Committed(_) => return,
        };
        match snapshot {
            Snapshot::Committed(previous) => view.rows[idx] = Row::Committed(previous),
            Snapshot::Absent => {
                view.rows.remove(idx);
            }
        }
    }

    fn set_state(&self, temp_id: &str, state: PendingState) {
        let mut view = self.view();
        if let Some(idx) = position_of(&view.rows, temp_id) {
            if let Row::Pending(p) = &mut view.rows[idx] {
                p.state = state;
                p.since = Instant::now();
            }
        }
    }

    fn row_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn release_row_lock(&self, id: &str) {
        let mut locks = self.row_locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }
}

fn join<T>(
    joined: Result<Result<T, MutationError>, tokio::task::JoinError>,
) -> Result<T, MutationError> {
    joined.map_err(|e| MutationError::Interrupted(e.to_string()))?
}

fn position_of<R: LedgerRecord>(rows: &[Row<R>], temp_id: &str) -> Option<usize> {
    rows.iter().position(|row| row.temp_id() == Some(temp_id))
}

/// Rebuild the first page from authoritative `items`, keeping in-flight work.
///
/// - Unconfirmed creates stay on top.
/// - Confirmed creates are retired once their id is listed, or dropped once
///   older than `reconcile_timeout`.
/// - In-flight edits/deletes stay over their target row and take the fresh
///   row as their snapshot. If the target is gone the pending row goes too.
fn merge_page<R: LedgerRecord>(
    previous: Vec<Row<R>>,
    items: Vec<R>,
    reconcile_timeout: Duration,
) -> Vec<Row<R>> {
    let listed: HashSet<&str> = items.iter().map(|r| r.id()).collect();
    let mut creates = Vec::new();
    let mut targeted: HashMap<String, PendingRow<R>> = HashMap::new();

    for row in previous {
        let Row::Pending(pending) = row else {
            continue;
        };
        if !matches!(pending.payload, PendingPayload::Create(_)) {
            if let Some(target) = pending.target_id.clone() {
                targeted.insert(target, pending);
            }
            continue;
        }
        if let PendingState::AwaitingRefetch { confirmed_id } = &pending.state {
            if listed.contains(confirmed_id.as_str()) {
                debug!(temp_id = %pending.temp_id, row_id = %confirmed_id, "Placeholder retired");
                continue;
            }
            if pending.since.elapsed() >= reconcile_timeout {
                warn!(
                    temp_id = %pending.temp_id,
                    row_id = %confirmed_id,
                    "Confirmed row never appeared in a refetch, dropping placeholder"
                );
                continue;
            }
        }
        creates.push(Row::Pending(pending));
    }

    let mut rows = creates;
    for item in items {
        match targeted.remove(item.id()) {
            Some(mut pending) => {
                pending.display = match &pending.payload {
                    PendingPayload::Update(input) => item.with_input(input),
                    _ => item.clone(),
                };
                pending.snapshot = Snapshot::Committed(item);
                rows.push(Row::Pending(pending));
            }
            None => rows.push(Row::Committed(item)),
        }
    }

    for (target, pending) in targeted {
        debug!(row_id = %target, temp_id = %pending.temp_id, "Pending row left the page");
    }
    rows
}

// =============================================================================
// Tests
// =============================================================================
