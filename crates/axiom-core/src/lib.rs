pub mod collaborators;
pub mod error;
pub mod events;
pub mod models;

pub use collaborators::{
    CheckoutProvider, CheckoutRequest, CheckoutSession, ContentGenerator, EmailMessage,
    EmailSender, GeneratedContent, HostedCheckoutProvider, ProjectBrief, TemplateGenerator,
};
pub use error::{ErrorClass, SigningError, WebhookError};
pub use events::ActivityKind;
pub use models::{
    InvoiceStatus, LineItem, ProposalStatus, SignatureKind, SignatureStatus,
};
