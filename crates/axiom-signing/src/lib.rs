//! Signature workflow engine.
//!
//! Pure precondition checks and minting for the dual-signature protocol:
//! not_started -> (freelancer signs) -> pending_client -> (client signs)
//! -> signed. Callers re-read the proposal row under a lock immediately
//! before every check and apply the returned effects in one statement.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use axiom_core::SigningError;

/// Validity window for a client email verification code.
pub const VERIFICATION_CODE_TTL: Duration = Duration::hours(1);

/// Canonical projection of the content fields a signature binds to.
/// Field order is the serialization order; changing it changes every hash.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    pub executive_summary: String,
    pub scope_of_work: String,
    pub pricing_breakdown: String,
    pub timeline_details: String,
    pub terms_and_conditions: String,
    pub budget: Decimal,
    pub project_title: String,
}

/// SHA-256 hex digest over the canonical JSON projection of the content
/// fields. Recomputing over unmodified content reproduces the stored hash.
pub fn content_hash(content: &ContentSnapshot) -> String {
    let canonical =
        serde_json::to_vec(content).expect("content snapshot serialization is infallible");
    let digest = Sha256::digest(&canonical);
    hex::encode(digest)
}

/// One-time 6-digit code, uniform in [100000, 999999].
pub fn mint_verification_code() -> String {
    rand::rng().random_range(100_000..=999_999).to_string()
}

/// Opaque bearer credential for the client's signing session: 64 hex chars
/// of v4-uuid entropy. Minted once per proposal, never rotated.
pub fn mint_signature_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Opaque share-link credential, same shape as the signature token.
pub fn mint_access_token() -> String {
    mint_signature_token()
}

/// The signature-relevant slice of a proposal row, as read inside the
/// mutating transaction.
#[derive(Debug, Clone, Default)]
pub struct SignatureSnapshot {
    pub signature_token: Option<String>,
    pub freelancer_signed_at: Option<DateTime<Utc>>,
    pub client_signed_at: Option<DateTime<Utc>>,
    pub client_email_verified: bool,
    pub terms_accepted: bool,
    pub verification_code: Option<String>,
    pub verification_code_expiry: Option<DateTime<Utc>>,
}

/// Everything the freelancer-sign operation writes besides the signature
/// payload itself.
#[derive(Debug, Clone)]
pub struct FreelancerSignEffects {
    pub signature_token: String,
    pub content_hash: String,
    pub verification_code: String,
    pub verification_code_expiry: DateTime<Utc>,
    /// True when a prior freelancer signature existed; re-signing is
    /// allowed but invalidates any unconsumed verification code, so
    /// callers log it.
    pub re_signed: bool,
}

/// Owner gate for freelancer-side operations.
pub fn authorize_owner(owner_id: Uuid, caller_id: Uuid) -> Result<(), SigningError> {
    if owner_id == caller_id {
        Ok(())
    } else {
        Err(SigningError::Forbidden)
    }
}

fn verify_token(snapshot: &SignatureSnapshot, token: &str) -> Result<(), SigningError> {
    match snapshot.signature_token.as_deref() {
        Some(stored) if stored == token => Ok(()),
        _ => Err(SigningError::InvalidToken),
    }
}

/// Computes the effects of a freelancer signature. The token is reused
/// when present; hash and verification code are always re-issued.
pub fn freelancer_sign_effects(
    content: &ContentSnapshot,
    snapshot: &SignatureSnapshot,
    now: DateTime<Utc>,
) -> FreelancerSignEffects {
    let signature_token = snapshot
        .signature_token
        .clone()
        .unwrap_or_else(mint_signature_token);

    FreelancerSignEffects {
        signature_token,
        content_hash: content_hash(content),
        verification_code: mint_verification_code(),
        verification_code_expiry: now + VERIFICATION_CODE_TTL,
        re_signed: snapshot.freelancer_signed_at.is_some(),
    }
}

/// Preconditions for marking the client email verified. Checked in order:
/// token, code, expiry.
pub fn check_verify_email(
    snapshot: &SignatureSnapshot,
    token: &str,
    code: &str,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    verify_token(snapshot, token)?;

    match snapshot.verification_code.as_deref() {
        Some(stored) if stored == code => {}
        _ => return Err(SigningError::InvalidCode),
    }

    match snapshot.verification_code_expiry {
        Some(expiry) if now <= expiry => Ok(()),
        _ => Err(SigningError::CodeExpired),
    }
}

/// Precondition for recording terms acceptance: token match only.
pub fn check_accept_terms(snapshot: &SignatureSnapshot, token: &str) -> Result<(), SigningError> {
    verify_token(snapshot, token)
}

/// Preconditions for the authoritative, fully-verified client-sign flow.
/// Each failure maps to a distinct error so the caller can re-prompt.
pub fn check_client_sign(snapshot: &SignatureSnapshot, token: &str) -> Result<(), SigningError> {
    verify_token(snapshot, token)?;

    if snapshot.freelancer_signed_at.is_none() {
        return Err(SigningError::FreelancerMustSignFirst);
    }
    if !snapshot.client_email_verified {
        return Err(SigningError::EmailNotVerified);
    }
    if !snapshot.terms_accepted {
        return Err(SigningError::TermsNotAccepted);
    }
    if snapshot.client_signed_at.is_some() {
        return Err(SigningError::AlreadySigned);
    }

    Ok(())
}

/// Preconditions for the direct shared-link client-sign flow. Weaker gate
/// than [`check_client_sign`]: it skips the email and terms checks. Kept
/// as a distinct operation so the differing guarantees stay explicit.
pub fn check_direct_client_sign(
    snapshot: &SignatureSnapshot,
    token: &str,
) -> Result<(), SigningError> {
    verify_token(snapshot, token)?;

    if snapshot.freelancer_signed_at.is_none() {
        return Err(SigningError::FreelancerMustSignFirst);
    }
    if snapshot.client_signed_at.is_some() {
        return Err(SigningError::AlreadySigned);
    }

    Ok(())
}

/// Audit-only source address: first of `x-forwarded-for` / `x-real-ip`,
/// else "unknown". Never used for authorization.
pub fn client_ip(forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|value| !value.is_empty()))
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn content() -> ContentSnapshot {
        ContentSnapshot {
            executive_summary: "summary".to_string(),
            scope_of_work: "scope".to_string(),
            pricing_breakdown: "pricing".to_string(),
            timeline_details: "timeline".to_string(),
            terms_and_conditions: "terms".to_string(),
            budget: Decimal::new(500_000, 2),
            project_title: "Website Redesign".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn pending_snapshot() -> SignatureSnapshot {
        SignatureSnapshot {
            signature_token: Some("tok".to_string()),
            freelancer_signed_at: Some(now()),
            client_signed_at: None,
            client_email_verified: false,
            terms_accepted: false,
            verification_code: Some("123456".to_string()),
            verification_code_expiry: Some(now() + VERIFICATION_CODE_TTL),
        }
    }

    #[test]
    fn content_hash_is_stable_and_hex() {
        let first = content_hash(&content());
        let second = content_hash(&content());
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn content_hash_changes_with_any_field() {
        let base = content_hash(&content());

        let mut changed = content();
        changed.scope_of_work.push('!');
        assert_ne!(base, content_hash(&changed));

        let mut changed = content();
        changed.budget = Decimal::new(500_001, 2);
        assert_ne!(base, content_hash(&changed));

        let mut changed = content();
        changed.project_title = "Other".to_string();
        assert_ne!(base, content_hash(&changed));
    }

    #[test]
    fn verification_code_is_six_digits_in_range() {
        for _ in 0..200 {
            let code = mint_verification_code();
            assert_eq!(code.len(), 6);
            let value: u32 = code.parse().unwrap();
            assert!((100_000..=999_999).contains(&value));
        }
    }

    #[test]
    fn signature_token_shape() {
        let token = mint_signature_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, mint_signature_token());
    }

    #[test]
    fn freelancer_sign_mints_token_once() {
        let fresh = SignatureSnapshot::default();
        let effects = freelancer_sign_effects(&content(), &fresh, now());
        assert!(!effects.re_signed);
        assert_eq!(effects.signature_token.len(), 64);
        assert_eq!(effects.content_hash.len(), 64);
        assert_eq!(effects.verification_code_expiry, now() + Duration::hours(1));

        let mut signed = pending_snapshot();
        signed.signature_token = Some(effects.signature_token.clone());
        let again = freelancer_sign_effects(&content(), &signed, now());
        assert!(again.re_signed);
        assert_eq!(again.signature_token, effects.signature_token);
    }

    #[test]
    fn re_sign_reissues_verification_code() {
        let snapshot = pending_snapshot();
        let effects = freelancer_sign_effects(&content(), &snapshot, now());
        assert!(effects.re_signed);
        // The stored "123456" is invalidated once the new code is written.
        assert_eq!(effects.verification_code.len(), 6);
    }

    #[test]
    fn verify_email_happy_path() {
        let snapshot = pending_snapshot();
        assert!(check_verify_email(&snapshot, "tok", "123456", now()).is_ok());
    }

    #[test]
    fn verify_email_rejects_bad_token_before_code() {
        let snapshot = pending_snapshot();
        assert_eq!(
            check_verify_email(&snapshot, "wrong", "123456", now()),
            Err(SigningError::InvalidToken)
        );
    }

    #[test]
    fn verify_email_rejects_bad_code() {
        let snapshot = pending_snapshot();
        assert_eq!(
            check_verify_email(&snapshot, "tok", "654321", now()),
            Err(SigningError::InvalidCode)
        );
    }

    #[test]
    fn verify_email_expiry_boundary() {
        let snapshot = pending_snapshot();
        let expiry = snapshot.verification_code_expiry.unwrap();

        assert!(check_verify_email(&snapshot, "tok", "123456", expiry - Duration::seconds(1)).is_ok());
        assert!(check_verify_email(&snapshot, "tok", "123456", expiry).is_ok());
        assert_eq!(
            check_verify_email(&snapshot, "tok", "123456", expiry + Duration::seconds(1)),
            Err(SigningError::CodeExpired)
        );
    }

    #[test]
    fn client_sign_requires_freelancer_first() {
        let snapshot = SignatureSnapshot {
            signature_token: Some("tok".to_string()),
            ..SignatureSnapshot::default()
        };
        assert_eq!(
            check_client_sign(&snapshot, "tok"),
            Err(SigningError::FreelancerMustSignFirst)
        );
    }

    #[test]
    fn client_sign_walks_the_full_gate() {
        let mut snapshot = pending_snapshot();
        assert_eq!(
            check_client_sign(&snapshot, "tok"),
            Err(SigningError::EmailNotVerified)
        );

        snapshot.client_email_verified = true;
        assert_eq!(
            check_client_sign(&snapshot, "tok"),
            Err(SigningError::TermsNotAccepted)
        );

        snapshot.terms_accepted = true;
        assert!(check_client_sign(&snapshot, "tok").is_ok());

        snapshot.client_signed_at = Some(now());
        assert_eq!(
            check_client_sign(&snapshot, "tok"),
            Err(SigningError::AlreadySigned)
        );
    }

    #[test]
    fn direct_sign_skips_email_and_terms() {
        let snapshot = pending_snapshot();
        assert!(check_direct_client_sign(&snapshot, "tok").is_ok());
    }

    #[test]
    fn direct_sign_rejects_completed_proposal() {
        let mut snapshot = pending_snapshot();
        snapshot.client_signed_at = Some(now());
        assert_eq!(
            check_direct_client_sign(&snapshot, "tok"),
            Err(SigningError::AlreadySigned)
        );
    }

    #[test]
    fn direct_sign_still_requires_token() {
        let snapshot = pending_snapshot();
        assert_eq!(
            check_direct_client_sign(&snapshot, "nope"),
            Err(SigningError::InvalidToken)
        );
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        assert_eq!(
            client_ip(Some("203.0.113.7, 10.0.0.1"), Some("10.0.0.2")),
            "203.0.113.7"
        );
        assert_eq!(client_ip(None, Some("10.0.0.2")), "10.0.0.2");
        assert_eq!(client_ip(Some("  "), None), "unknown");
        assert_eq!(client_ip(None, None), "unknown");
    }

    #[test]
    fn owner_gate() {
        let owner = Uuid::new_v4();
        assert!(authorize_owner(owner, owner).is_ok());
        assert_eq!(
            authorize_owner(owner, Uuid::new_v4()),
            Err(SigningError::Forbidden)
        );
    }
}
