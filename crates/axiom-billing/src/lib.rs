//! Payment reconciliation engine.
//!
//! Webhook authentication, the tagged union of known processor event
//! shapes, and the paid/remaining/status arithmetic. All storage effects
//! live with the caller; everything here is pure and unit-tested.

pub mod webhook;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;

use axiom_core::{InvoiceStatus, LineItem};

pub use webhook::{
    CheckoutEventData, EventMetadata, ParsedWebhook, PaymentEventData, WebhookEvent,
    parse_event, verify_signature, REPLAY_WINDOW_SECS,
};

/// Absolute tolerance for floating-point currency arithmetic carried over
/// from upstream processors: an invoice is PAID once it is within one
/// cent of its total.
pub fn payment_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Derived status. Never stored authoritatively; always a pure function
/// of paid vs total.
pub fn derive_status(paid_amount: Decimal, total: Decimal) -> InvoiceStatus {
    if paid_amount >= total - payment_tolerance() {
        InvoiceStatus::Paid
    } else if paid_amount > Decimal::ZERO {
        InvoiceStatus::PartiallyPaid
    } else {
        InvoiceStatus::Unpaid
    }
}

/// Result of applying one payment to an invoice balance.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPayment {
    pub paid_amount: Decimal,
    pub remaining_amount: Decimal,
    pub status: InvoiceStatus,
}

/// Accumulates a payment: new paid total, remaining clamped at zero, and
/// the derived status.
pub fn apply_payment(paid_amount: Decimal, total: Decimal, amount: Decimal) -> AppliedPayment {
    let new_paid = paid_amount + amount;
    let remaining = (total - new_paid).max(Decimal::ZERO);

    AppliedPayment {
        paid_amount: new_paid,
        remaining_amount: remaining,
        status: derive_status(new_paid, total),
    }
}

/// Globally-unique invoice number: timestamp plus a random suffix so
/// numbering survives deletions. Uniqueness is still enforced by the
/// store's constraint on `invoice_number`.
pub fn mint_invoice_number(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::rng().random_range(1000..10_000);
    format!("INV-{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}

/// Builds a line item with its amount computed from quantity and rate.
pub fn line_item(description: &str, quantity: Decimal, rate: Decimal) -> LineItem {
    LineItem {
        description: description.to_string(),
        quantity,
        rate,
        amount: (quantity * rate).round_dp(2),
    }
}

/// Fixed-at-creation invoice totals.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Sums line items and applies a percentage tax rate.
pub fn compute_totals(line_items: &[LineItem], tax_rate: Decimal) -> InvoiceTotals {
    let subtotal: Decimal = line_items.iter().map(|item| item.amount).sum();
    let tax_amount = (subtotal * tax_rate / Decimal::ONE_HUNDRED).round_dp(2);

    InvoiceTotals {
        subtotal,
        tax_amount,
        total: subtotal + tax_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(value: i64, scale: u32) -> Decimal {
        Decimal::new(value, scale)
    }

    #[test]
    fn status_is_a_pure_function_of_paid_vs_total() {
        let total = dec(10_000, 0);
        assert_eq!(derive_status(Decimal::ZERO, total), InvoiceStatus::Unpaid);
        assert_eq!(derive_status(dec(1, 0), total), InvoiceStatus::PartiallyPaid);
        assert_eq!(derive_status(total, total), InvoiceStatus::Paid);
    }

    #[test]
    fn status_tolerance_boundary() {
        let total = dec(10_000, 0);
        // Within one cent of the total counts as paid.
        assert_eq!(derive_status(total - dec(1, 2), total), InvoiceStatus::Paid);
        assert_eq!(
            derive_status(total - dec(2, 2), total),
            InvoiceStatus::PartiallyPaid
        );
    }

    #[test]
    fn partial_payments_accumulate() {
        let total = dec(10_000, 0);

        let first = apply_payment(Decimal::ZERO, total, dec(5_000, 0));
        assert_eq!(first.paid_amount, dec(5_000, 0));
        assert_eq!(first.remaining_amount, dec(5_000, 0));
        assert_eq!(first.status, InvoiceStatus::PartiallyPaid);

        let second = apply_payment(first.paid_amount, total, dec(5_000, 0));
        assert_eq!(second.paid_amount, total);
        assert_eq!(second.remaining_amount, Decimal::ZERO);
        assert_eq!(second.status, InvoiceStatus::Paid);
    }

    #[test]
    fn conservation_holds_across_sequences() {
        let total = dec(123_456, 2);
        let payments = [dec(100, 1), dec(4_000, 2), dec(70_000, 2)];

        let mut paid = Decimal::ZERO;
        for amount in payments {
            let applied = apply_payment(paid, total, amount);
            assert!(
                (applied.paid_amount + applied.remaining_amount - total).abs()
                    <= payment_tolerance()
            );
            paid = applied.paid_amount;
        }
    }

    #[test]
    fn overpayment_clamps_remaining_to_zero() {
        let total = dec(10_000, 0);
        let applied = apply_payment(dec(9_000, 0), total, dec(2_000, 0));
        assert_eq!(applied.remaining_amount, Decimal::ZERO);
        assert_eq!(applied.status, InvoiceStatus::Paid);
    }

    #[test]
    fn invoice_number_shape() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let number = mint_invoice_number(now);
        assert!(number.starts_with("INV-20260301093000-"));
        let suffix: u32 = number.rsplit('-').next().unwrap().parse().unwrap();
        assert!((1000..10_000).contains(&suffix));
    }

    #[test]
    fn totals_with_tax() {
        let items = vec![
            line_item("Design", dec(1, 0), dec(200_000, 2)),
            line_item("Build", dec(10, 0), dec(30_000, 2)),
        ];
        let totals = compute_totals(&items, dec(10, 0));
        assert_eq!(totals.subtotal, dec(500_000, 2));
        assert_eq!(totals.tax_amount, dec(50_000, 2));
        assert_eq!(totals.total, dec(550_000, 2));
    }

    #[test]
    fn line_item_amount_is_quantity_times_rate() {
        let item = line_item("Hours", dec(35, 1), dec(9_950, 2));
        assert_eq!(item.amount, dec(34_825, 2));
    }
}
