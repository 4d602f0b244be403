use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use axiom_core::{InvoiceStatus, LineItem, ProposalStatus, SignatureKind, SignatureStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProposalRequest {
    pub client_name: String,
    pub client_email: String,
    pub client_company: Option<String>,
    pub project_title: String,
    pub description: Option<String>,
    pub budget: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub timeline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalDetail {
    pub proposal_id: Uuid,
    pub owner_id: Uuid,
    pub client_name: String,
    pub client_email: String,
    pub client_company: Option<String>,
    pub project_title: String,
    pub description: Option<String>,
    pub executive_summary: String,
    pub scope_of_work: String,
    pub pricing_breakdown: String,
    pub timeline_details: String,
    pub terms_and_conditions: String,
    pub budget: Decimal,
    pub currency: String,
    pub timeline: Option<String>,
    pub status: ProposalStatus,
    pub signature_status: SignatureStatus,
    pub content_hash: Option<String>,
    pub freelancer_signed_at: Option<DateTime<Utc>>,
    pub client_signed_at: Option<DateTime<Utc>>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalSummary {
    pub proposal_id: Uuid,
    pub project_title: String,
    pub client_name: String,
    pub budget: Decimal,
    pub currency: String,
    pub status: ProposalStatus,
    pub signature_status: SignatureStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalListResponse {
    pub items: Vec<ProposalSummary>,
}

/// Client-facing projection served on share links. Carries no codes,
/// tokens or owner-only fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedProposalView {
    pub proposal_id: Uuid,
    pub client_name: String,
    pub client_company: Option<String>,
    pub project_title: String,
    pub executive_summary: String,
    pub scope_of_work: String,
    pub pricing_breakdown: String,
    pub timeline_details: String,
    pub terms_and_conditions: String,
    pub budget: Decimal,
    pub currency: String,
    pub signature_status: SignatureStatus,
    pub freelancer_signed_at: Option<DateTime<Utc>>,
    pub client_signed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareResponse {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreelancerSignRequest {
    pub signature_type: SignatureKind,
    pub signature_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreelancerSignResponse {
    pub proposal_id: Uuid,
    pub signature_status: SignatureStatus,
    pub signature_token: String,
    pub content_hash: String,
    pub verification_code_expiry: DateTime<Utc>,
    pub freelancer_signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEmailResponse {
    pub proposal_id: Uuid,
    pub client_email_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptTermsRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptTermsResponse {
    pub proposal_id: Uuid,
    pub terms_accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSignRequest {
    pub token: String,
    pub signature_type: SignatureKind,
    pub signature_data: String,
}

/// Body of the direct shared-link signing flow; the token travels in the
/// URL path instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectSignRequest {
    pub signature_type: SignatureKind,
    pub signature_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSignResponse {
    pub proposal_id: Uuid,
    pub signature_status: SignatureStatus,
    pub client_signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityView {
    pub activity_id: Uuid,
    pub kind: String,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityListResponse {
    pub items: Vec<ActivityView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: Decimal,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateInvoiceRequest {
    #[serde(default)]
    pub tax_rate: Decimal,
    pub line_items: Option<Vec<LineItemInput>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDetail {
    pub invoice_id: Uuid,
    pub proposal_id: Uuid,
    pub invoice_number: String,
    pub client_name: String,
    pub client_email: String,
    pub client_company: Option<String>,
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub paid_amount: Decimal,
    pub remaining_amount: Decimal,
    pub status: InvoiceStatus,
    pub payment_link: Option<String>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPaymentLinkRequest {
    pub payment_link: String,
}

/// Compact invoice state echoed in webhook acknowledgements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceBalance {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub paid_amount: Decimal,
    pub remaining_amount: Decimal,
}

/// Webhook acknowledgement. Business-rule misses stay HTTP 200 with a
/// warning so the processor does not redeliver; only infrastructure
/// failures surface as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    pub handled: bool,
    pub already_processed: bool,
    pub warning: Option<String>,
    pub invoice: Option<InvoiceBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalPendingEvent {
    pub proposal_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalSignedEvent {
    pub proposal_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePaidEvent {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub paid_amount: Decimal,
}

fn default_currency() -> String {
    "USD".to_string()
}
