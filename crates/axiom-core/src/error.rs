use thiserror::Error;

/// Broad failure classes the HTTP layer maps to status codes. Identity
/// problems and workflow-ordering problems are reported distinctly so the
/// caller can tell "not allowed" from "not ready yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Identity,
    Ordering,
    Input,
    NotFound,
}

/// Failures of the signature workflow engine. Every variant is a rejected
/// precondition; none leaves partial effects behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("caller is not the proposal owner")]
    Forbidden,
    #[error("signature token does not match")]
    InvalidToken,
    #[error("verification code is incorrect")]
    InvalidCode,
    #[error("verification code has expired")]
    CodeExpired,
    #[error("freelancer must sign before the client")]
    FreelancerMustSignFirst,
    #[error("client email has not been verified")]
    EmailNotVerified,
    #[error("terms have not been accepted")]
    TermsNotAccepted,
    #[error("proposal is already signed")]
    AlreadySigned,
    #[error("proposal not found")]
    NotFound,
}

impl SigningError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SigningError::Forbidden | SigningError::InvalidToken => ErrorClass::Identity,
            SigningError::FreelancerMustSignFirst
            | SigningError::EmailNotVerified
            | SigningError::TermsNotAccepted
            | SigningError::AlreadySigned => ErrorClass::Ordering,
            SigningError::InvalidCode | SigningError::CodeExpired => ErrorClass::Input,
            SigningError::NotFound => ErrorClass::NotFound,
        }
    }
}

/// Rejections raised while authenticating or decoding an inbound payment
/// webhook, before any reconciliation runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("webhook signature header is malformed")]
    MalformedHeader,
    #[error("webhook signature mismatch")]
    InvalidSignature,
    #[error("webhook timestamp outside the {max_age_secs}s replay window (age {age_secs}s)")]
    ReplayTooOld { age_secs: i64, max_age_secs: i64 },
    #[error("webhook payload is not valid JSON: {0}")]
    MalformedPayload(String),
}
