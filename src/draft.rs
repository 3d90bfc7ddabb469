//! The in-progress cart.
//!
//! [`DraftStore`] is the single writer for the active draft. Every named
//! mutation is applied under a lock, persisted synchronously to the
//! session's [`KeyValueSlot`], and broadcast to subscribers. Derived totals
//! are never stored; ask [`Draft::totals`] after any change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DraftError;
use crate::pricing::{self, Totals};
use crate::storage::KeyValueSlot;

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// One cart line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_reference: String,
    pub display_name: String,
    /// List price captured when the line was added; zero for free-mode lines.
    pub unit_price: f64,
    pub quantity: u32,
    pub discount: f64,
    /// Added while free mode was on.
    #[serde(default)]
    pub free: bool,
}

impl LineItem {
    pub fn gross(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }

    pub fn line_total(&self) -> f64 {
        (self.gross() - self.discount).max(0.0)
    }
}

/// The active cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub items: Vec<LineItem>,
    pub payment: f64,
    pub voucher: f64,
    #[serde(default)]
    pub customer_reference: Option<String>,
    /// Idempotency key for the eventual commit. Fixed for the draft's life.
    pub submission_id: String,
    #[serde(default)]
    pub free_mode_enabled: bool,
    #[serde(default)]
    pub effective_date: Option<DateTime<Utc>>,
}

impl Default for Draft {
    fn default() -> Self {
        Self::new()
    }
}

impl Draft {
    /// Empty draft with a fresh submission id.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            payment: 0.0,
            voucher: 0.0,
            customer_reference: None,
            submission_id: Uuid::new_v4().to_string(),
            free_mode_enabled: false,
            effective_date: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn totals(&self) -> Totals {
        pricing::price(&self.items, self.payment, self.voucher)
    }

    /// Structural checks applied to drafts read back from storage.
    fn is_well_formed(&self) -> bool {
        let amount_ok = |v: f64| v.is_finite() && v >= 0.0;
        !self.submission_id.trim().is_empty()
            && amount_ok(self.payment)
            && amount_ok(self.voucher)
            && self.items.iter().all(|item| {
                item.quantity >= 1
                    && amount_ok(item.unit_price)
                    && amount_ok(item.discount)
                    && item.discount <= item.gross() + pricing::MONEY_EPSILON
            })
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Named draft mutation. Lines are addressed by their position in the cart.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftOp {
    /// Add a product. Merges into an existing line with the same product
    /// and pricing mode.
    AddItem {
        product_reference: String,
        display_name: String,
        unit_price: f64,
        quantity: u32,
    },
    RemoveLine(usize),
    SetQuantity { line: usize, quantity: u32 },
    /// Clamped to the line's gross amount.
    SetDiscount { line: usize, discount: f64 },
    SetPayment(f64),
    SetVoucher(f64),
    SetCustomer(Option<String>),
    /// Affects only lines added afterwards.
    SetFreeMode(bool),
    SetEffectiveDate(Option<DateTime<Utc>>),
}

fn check_amount(field: &'static str, value: f64) -> Result<f64, DraftError> {
    if !value.is_finite() {
        return Err(DraftError::NotFinite { field });
    }
    if value < 0.0 {
        return Err(DraftError::NegativeAmount { field });
    }
    Ok(value)
}

fn apply(draft: &mut Draft, op: DraftOp) -> Result<(), DraftError> {
    match op {
        DraftOp::AddItem {
            product_reference,
            display_name,
            unit_price,
            quantity,
        } => {
            if quantity == 0 {
                return Err(DraftError::InvalidQuantity);
            }
            let free = draft.free_mode_enabled;
            let unit_price = if free {
                0.0
            } else {
                check_amount("unit price", unit_price)?
            };
            if let Some(existing) = draft
                .items
                .iter_mut()
                .find(|l| l.product_reference == product_reference && l.free == free)
            {
                existing.quantity = existing.quantity.saturating_add(quantity);
            } else {
                draft.items.push(LineItem {
                    product_reference,
                    display_name,
                    unit_price,
                    quantity,
                    discount: 0.0,
                    free,
                });
            }
        }
        DraftOp::RemoveLine(line) => {
            if line >= draft.items.len() {
                return Err(DraftError::UnknownLine(line));
            }
            draft.items.remove(line);
        }
        DraftOp::SetQuantity { line, quantity } => {
            if quantity == 0 {
                return Err(DraftError::InvalidQuantity);
            }
            let item = draft
                .items
                .get_mut(line)
                .ok_or(DraftError::UnknownLine(line))?;
            item.quantity = quantity;
            item.discount = item.discount.min(item.gross());
        }
        DraftOp::SetDiscount { line, discount } => {
            let discount = check_amount("discount", discount)?;
            let item = draft
                .items
                .get_mut(line)
                .ok_or(DraftError::UnknownLine(line))?;
            item.discount = discount.min(item.gross());
        }
        DraftOp::SetPayment(amount) => draft.payment = check_amount("payment", amount)?,
        DraftOp::SetVoucher(amount) => draft.voucher = check_amount("voucher", amount)?,
        DraftOp::SetCustomer(reference) => {
            draft.customer_reference = reference
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty());
        }
        DraftOp::SetFreeMode(enabled) => draft.free_mode_enabled = enabled,
        DraftOp::SetEffectiveDate(date) => draft.effective_date = date,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Single-writer container for the session's draft.
pub struct DraftStore {
    slot: Arc<dyn KeyValueSlot>,
    state: Mutex<Draft>,
    /// Set while a checkout owns the draft. Only read or written under
    /// `state`.
    held: AtomicBool,
    tx: watch::Sender<Draft>,
}

impl DraftStore {
    /// Rehydrate from `slot`. A missing, empty, or unreadable entry yields an
    /// empty draft; this never fails.
    pub fn load(slot: Arc<dyn KeyValueSlot>) -> Self {
        let draft = match slot.read() {
            Ok(Some(raw)) if !raw.trim().is_empty() => match serde_json::from_str::<Draft>(&raw) {
                Ok(draft) if draft.is_well_formed() => {
                    info!(
                        submission_id = %draft.submission_id,
                        items = draft.items.len(),
                        "Draft restored from {}",
                        slot.describe()
                    );
                    draft
                }
                Ok(draft) => {
                    warn!(
                        submission_id = %draft.submission_id,
                        "Persisted draft violates cart invariants, starting empty"
                    );
                    Draft::new()
                }
                Err(e) => {
                    warn!(error = %e, "Persisted draft is corrupt, starting empty");
                    Draft::new()
                }
            },
            Ok(_) => Draft::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read draft slot, starting empty");
                Draft::new()
            }
        };

        let (tx, _rx) = watch::channel(draft.clone());
        Self {
            slot,
            state: Mutex::new(draft),
            held: AtomicBool::new(false),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Draft> {
        // A panic mid-mutation leaves the previous draft in place, which is
        // still a valid cart.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the current draft.
    pub fn get(&self) -> Draft {
        self.lock().clone()
    }

    /// Totals for the current draft.
    pub fn totals(&self) -> Totals {
        self.lock().totals()
    }

    /// Apply `op`, persist, and notify subscribers. On error nothing changes.
    pub fn mutate(&self, op: DraftOp) -> Result<Draft, DraftError> {
        let mut guard = self.lock();
        if self.held.load(Ordering::SeqCst) {
            debug!(submission_id = %guard.submission_id, ?op, "Draft is held by checkout, mutation refused");
            return Err(DraftError::Locked);
        }
        let mut next = guard.clone();
        apply(&mut next, op)?;
        *guard = next.clone();
        self.persist(&next);
        self.tx.send_replace(next.clone());
        Ok(next)
    }

    /// Snapshot the draft and refuse further mutations until
    /// [`release`](Self::release). The snapshot is exactly what the checkout
    /// commits.
    pub fn hold(&self) -> Draft {
        let guard = self.lock();
        self.held.store(true, Ordering::SeqCst);
        guard.clone()
    }

    /// Accept mutations again.
    pub fn release(&self) {
        let _guard = self.lock();
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Persist the current draft. Mutations already do this; exposed for
    /// callers that want to force a write before shutdown.
    pub fn save(&self) {
        let guard = self.lock();
        self.persist(&guard);
    }

    /// Drop the draft and its persisted copy. Returns the fresh empty draft.
    pub fn clear(&self) -> Draft {
        let mut guard = self.lock();
        let previous = guard.submission_id.clone();
        *guard = Draft::new();
        if let Err(e) = self.slot.remove() {
            warn!(error = %e, submission_id = %previous, "Failed to remove persisted draft");
        }
        info!(previous = %previous, next = %guard.submission_id, "Draft cleared");
        self.tx.send_replace(guard.clone());
        guard.clone()
    }

    /// Clear only if the active draft still carries `submission_id`.
    pub fn clear_if_current(&self, submission_id: &str) -> bool {
        if self.lock().submission_id != submission_id {
            debug!(submission_id, "Draft already replaced, not clearing");
            return false;
        }
        self.clear();
        true
    }

    /// Observe every save and clear.
    pub fn subscribe(&self) -> watch::Receiver<Draft> {
        self.tx.subscribe()
    }

    fn persist(&self, draft: &Draft) {
        let raw = match serde_json::to_string(draft) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to serialize draft");
                return;
            }
        };
        if let Err(e) = self.slot.write(&raw) {
            warn!(
                error = %e,
                submission_id = %draft.submission_id,
                "Failed to persist draft to {}",
                self.slot.describe()
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
