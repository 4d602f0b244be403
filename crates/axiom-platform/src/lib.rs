pub mod config;
pub mod contracts;
pub mod db;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{
    AcceptTermsRequest, AcceptTermsResponse, ActivityListResponse, ActivityView,
    ClientSignRequest, ClientSignResponse, CreateProposalRequest, DirectSignRequest,
    FreelancerSignRequest, FreelancerSignResponse, GenerateInvoiceRequest, InvoiceBalance,
    InvoiceDetail, InvoicePaidEvent, LineItemInput, ProposalDetail, ProposalListResponse,
    ProposalPendingEvent, ProposalSignedEvent, ProposalSummary, SetPaymentLinkRequest,
    ShareResponse, SharedProposalView, VerifyEmailRequest, VerifyEmailResponse, WebhookAck,
};
pub use db::connect_database;
pub use redis_bus::RedisBus;
