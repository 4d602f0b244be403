use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Coarse proposal lifecycle, independent of the signature sub-state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Sent,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Sent => "sent",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(ProposalStatus::Draft),
            "sent" => Some(ProposalStatus::Sent),
            "accepted" => Some(ProposalStatus::Accepted),
            "rejected" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

/// Signature lifecycle. Transitions only move forward:
/// not_started -> pending_client -> signed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    NotStarted,
    PendingClient,
    Signed,
}

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureStatus::NotStarted => "not_started",
            SignatureStatus::PendingClient => "pending_client",
            SignatureStatus::Signed => "signed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(SignatureStatus::NotStarted),
            "pending_client" => Some(SignatureStatus::PendingClient),
            "signed" => Some(SignatureStatus::Signed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    Drawn,
    Typed,
}

impl SignatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureKind::Drawn => "drawn",
            SignatureKind::Typed => "typed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drawn" => Some(SignatureKind::Drawn),
            "typed" => Some(SignatureKind::Typed),
            _ => None,
        }
    }
}

/// Derived invoice state. Never stored authoritatively; always recomputed
/// from paid_amount vs total.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvoiceStatus {
    #[serde(rename = "UNPAID")]
    Unpaid,
    #[serde(rename = "PARTIALLY_PAID")]
    PartiallyPaid,
    #[serde(rename = "PAID")]
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "UNPAID",
            InvoiceStatus::PartiallyPaid => "PARTIALLY_PAID",
            InvoiceStatus::Paid => "PAID",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNPAID" => Some(InvoiceStatus::Unpaid),
            "PARTIALLY_PAID" => Some(InvoiceStatus::PartiallyPaid),
            "PAID" => Some(InvoiceStatus::Paid),
            _ => None,
        }
    }
}

/// One invoice line; amount is always quantity * rate rounded to cents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
}
