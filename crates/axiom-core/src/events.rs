use serde::{Deserialize, Serialize};

/// Append-only timeline entry kinds for a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    Created,
    Sent,
    Viewed,
    Signed,
    InvoiceGenerated,
    PaymentReceived,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Created => "CREATED",
            ActivityKind::Sent => "SENT",
            ActivityKind::Viewed => "VIEWED",
            ActivityKind::Signed => "SIGNED",
            ActivityKind::InvoiceGenerated => "INVOICE_GENERATED",
            ActivityKind::PaymentReceived => "PAYMENT_RECEIVED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(ActivityKind::Created),
            "SENT" => Some(ActivityKind::Sent),
            "VIEWED" => Some(ActivityKind::Viewed),
            "SIGNED" => Some(ActivityKind::Signed),
            "INVOICE_GENERATED" => Some(ActivityKind::InvoiceGenerated),
            "PAYMENT_RECEIVED" => Some(ActivityKind::PaymentReceived),
            _ => None,
        }
    }
}
