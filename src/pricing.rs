//! Derived totals for a draft.
//!
//! Everything here is a pure function of the line items and the tendered
//! amounts. Nothing is cached on the draft; callers recompute on every read.

use serde::Serialize;

use crate::draft::LineItem;

/// Two amounts closer than this are the same amount of money.
pub const MONEY_EPSILON: f64 = 0.005;

/// Totals derived from a draft.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub subtotal: f64,
    pub grand_total: f64,
    pub change: f64,
    pub payment: f64,
    pub voucher: f64,
}

impl Totals {
    /// A sale with a non-zero subtotal must be covered by some tender. A
    /// zero subtotal (everything added in free mode) needs none.
    pub fn has_tender(&self) -> bool {
        if self.subtotal > 0.0 {
            self.payment + self.voucher > 0.0
        } else {
            true
        }
    }

    /// Ready to submit: tender present and no outstanding balance. Negative
    /// change is tolerated while the operator is still typing the payment.
    pub fn is_ready(&self) -> bool {
        self.has_tender() && self.change >= 0.0
    }

    /// Amount still owed, zero when fully covered.
    pub fn shortfall(&self) -> f64 {
        if self.change < 0.0 {
            -self.change
        } else {
            0.0
        }
    }
}

/// Compute totals for `items` with the given tender.
pub fn price(items: &[LineItem], payment: f64, voucher: f64) -> Totals {
    let subtotal = round_half_up(items.iter().map(LineItem::line_total).sum());
    let grand_total = round_half_up((subtotal - voucher).max(0.0));
    let change = round_half_up(payment + voucher - subtotal);

    Totals {
        subtotal,
        grand_total,
        change,
        payment,
        voucher,
    }
}

/// Round to two decimals, halves toward positive infinity.
pub fn round_half_up(value: f64) -> f64 {
    // 1e-9 absorbs representation error such as 1.005 * 100 = 100.49999...
    ((value * 100.0) + 0.5 + 1e-9).floor() / 100.0
}

/// Compare two money amounts within rounding tolerance.
pub fn same_amount(a: f64, b: f64) -> bool {
    (a - b).abs() < MONEY_EPSILON
}
