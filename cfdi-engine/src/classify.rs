//! Classification engine.
//!
//! Deterministic mapping from (direction, voucher type) to the movement
//! kind posted to the company's books. Pure; the dedup invariant in the
//! ingestion layer relies on this being stable across replays.

use crate::models::{Direction, MovementKind, TypeCode};

/// Policy knobs for edge cases the truth table does not fix.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationPolicy {
    /// Payment complements (`P`) do not produce movements on their own
    /// unless this is set; they then classify as income-type by direction.
    pub include_payment_invoices: bool,
    /// When false, deferred-payment invoices (MetodoPago = PPD) are
    /// excluded from movement generation until settled.
    pub include_deferred: bool,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            include_payment_invoices: false,
            include_deferred: true,
        }
    }
}

/// Map an invoice to the movement kind it produces, if any.
///
/// | direction | type    | kind    |
/// |-----------|---------|---------|
/// | issued    | income  | income  |
/// | issued    | expense | expense |
/// | received  | income  | expense |
/// | received  | expense | income  |
pub fn classify(
    direction: Direction,
    type_code: TypeCode,
    payment_method: Option<&str>,
    policy: ClassificationPolicy,
) -> Option<MovementKind> {
    if !policy.include_deferred && payment_method == Some("PPD") {
        return None;
    }

    let income_like = match type_code {
        TypeCode::Income => true,
        TypeCode::Expense => false,
        TypeCode::Payment if policy.include_payment_invoices => true,
        TypeCode::Payment => return None,
    };

    Some(match (direction, income_like) {
        (Direction::Issued, true) | (Direction::Received, false) => MovementKind::Income,
        (Direction::Issued, false) | (Direction::Received, true) => MovementKind::Expense,
    })
}
