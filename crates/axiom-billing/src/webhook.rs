//! Inbound webhook authentication and event decoding.
//!
//! The processor signs deliveries with `webhook-signature:
//! t=<unix_seconds>,v1=<hex_hmac>` where the MAC covers
//! `"<timestamp>.<rawBody>"`. Payloads decode into an explicit tagged
//! union of known event shapes; unrecognized types are surfaced rather
//! than silently dropped.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use axiom_core::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the delivery timestamp and now.
pub const REPLAY_WINDOW_SECS: i64 = 300;

fn parse_signature_header(header: &str) -> Result<(i64, Vec<u8>), WebhookError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| WebhookError::MalformedHeader)?,
                );
            }
            Some(("v1", value)) => {
                signature = Some(hex::decode(value).map_err(|_| WebhookError::MalformedHeader)?);
            }
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => Ok((timestamp, signature)),
        _ => Err(WebhookError::MalformedHeader),
    }
}

/// Verifies a delivery signature: replay window first, then a
/// constant-time HMAC-SHA256 comparison against `v1`.
pub fn verify_signature(
    header: &str,
    raw_body: &[u8],
    secret: &[u8],
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    let (timestamp, signature) = parse_signature_header(header)?;

    let age_secs = (now.timestamp() - timestamp).abs();
    if age_secs > REPLAY_WINDOW_SECS {
        return Err(WebhookError::ReplayTooOld {
            age_secs,
            max_age_secs: REPLAY_WINDOW_SECS,
        });
    }

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    mac.verify_slice(&signature)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Routing identifiers the processor echoes back from checkout creation.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EventMetadata {
    pub proposal_id: Option<Uuid>,
    pub invoice_number: Option<String>,
}

/// Shape of `payment.*` events: the processor's payment id is the
/// idempotency key.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaymentEventData {
    pub payment_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// Shape of `checkout.*` events: keyed by the checkout session id.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CheckoutEventData {
    pub session_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// Every event type the processor is known to deliver. Matching over this
/// union is exhaustive; a new type shows up as [`ParsedWebhook::Unrecognized`]
/// and is acknowledged but flagged, never silently absorbed.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    PaymentSucceeded(PaymentEventData),
    PaymentCompleted(PaymentEventData),
    CheckoutCompleted(CheckoutEventData),
    PaymentFailed(PaymentEventData),
    PaymentCancelled(PaymentEventData),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedWebhook {
    Known(WebhookEvent),
    Unrecognized { event_type: String },
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decodes a raw delivery body into the event union.
pub fn parse_event(raw_body: &[u8]) -> Result<ParsedWebhook, WebhookError> {
    let envelope: WebhookEnvelope = serde_json::from_slice(raw_body)
        .map_err(|err| WebhookError::MalformedPayload(err.to_string()))?;

    let decode_payment = |data: serde_json::Value| -> Result<PaymentEventData, WebhookError> {
        serde_json::from_value(data).map_err(|err| WebhookError::MalformedPayload(err.to_string()))
    };

    let event = match envelope.event_type.as_str() {
        "payment.succeeded" => WebhookEvent::PaymentSucceeded(decode_payment(envelope.data)?),
        "payment.completed" => WebhookEvent::PaymentCompleted(decode_payment(envelope.data)?),
        "checkout.completed" => WebhookEvent::CheckoutCompleted(
            serde_json::from_value(envelope.data)
                .map_err(|err| WebhookError::MalformedPayload(err.to_string()))?,
        ),
        "payment.failed" => WebhookEvent::PaymentFailed(decode_payment(envelope.data)?),
        "payment.cancelled" => WebhookEvent::PaymentCancelled(decode_payment(envelope.data)?),
        other => {
            return Ok(ParsedWebhook::Unrecognized {
                event_type: other.to_string(),
            });
        }
    };

    Ok(ParsedWebhook::Known(event))
}

impl WebhookEvent {
    /// True for the event types that apply money to an invoice. Failure
    /// and cancellation events are acknowledged without side effects.
    pub fn drives_reconciliation(&self) -> bool {
        match self {
            WebhookEvent::PaymentSucceeded(_)
            | WebhookEvent::PaymentCompleted(_)
            | WebhookEvent::CheckoutCompleted(_) => true,
            WebhookEvent::PaymentFailed(_) | WebhookEvent::PaymentCancelled(_) => false,
        }
    }

    /// The processor-side identifier used to deduplicate deliveries.
    pub fn external_payment_id(&self) -> &str {
        match self {
            WebhookEvent::PaymentSucceeded(data)
            | WebhookEvent::PaymentCompleted(data)
            | WebhookEvent::PaymentFailed(data)
            | WebhookEvent::PaymentCancelled(data) => &data.payment_id,
            WebhookEvent::CheckoutCompleted(data) => &data.session_id,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            WebhookEvent::PaymentSucceeded(data)
            | WebhookEvent::PaymentCompleted(data)
            | WebhookEvent::PaymentFailed(data)
            | WebhookEvent::PaymentCancelled(data) => data.amount,
            WebhookEvent::CheckoutCompleted(data) => data.amount,
        }
    }

    pub fn currency(&self) -> Option<&str> {
        match self {
            WebhookEvent::PaymentSucceeded(data)
            | WebhookEvent::PaymentCompleted(data)
            | WebhookEvent::PaymentFailed(data)
            | WebhookEvent::PaymentCancelled(data) => data.currency.as_deref(),
            WebhookEvent::CheckoutCompleted(data) => data.currency.as_deref(),
        }
    }

    /// Processor-reported payment status. Falls back to the status the
    /// event type implies when the payload omits the field.
    pub fn status(&self) -> &str {
        match self {
            WebhookEvent::PaymentSucceeded(data) | WebhookEvent::PaymentCompleted(data) => {
                data.status.as_deref().unwrap_or("succeeded")
            }
            WebhookEvent::CheckoutCompleted(_) => "succeeded",
            WebhookEvent::PaymentFailed(data) => data.status.as_deref().unwrap_or("failed"),
            WebhookEvent::PaymentCancelled(data) => data.status.as_deref().unwrap_or("cancelled"),
        }
    }

    pub fn payment_method(&self) -> Option<&str> {
        match self {
            WebhookEvent::PaymentSucceeded(data)
            | WebhookEvent::PaymentCompleted(data)
            | WebhookEvent::PaymentFailed(data)
            | WebhookEvent::PaymentCancelled(data) => data.payment_method.as_deref(),
            WebhookEvent::CheckoutCompleted(data) => data.payment_method.as_deref(),
        }
    }

    pub fn metadata(&self) -> &EventMetadata {
        match self {
            WebhookEvent::PaymentSucceeded(data)
            | WebhookEvent::PaymentCompleted(data)
            | WebhookEvent::PaymentFailed(data)
            | WebhookEvent::PaymentCancelled(data) => &data.metadata,
            WebhookEvent::CheckoutCompleted(data) => &data.metadata,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WebhookEvent::PaymentSucceeded(_) => "payment.succeeded",
            WebhookEvent::PaymentCompleted(_) => "payment.completed",
            WebhookEvent::CheckoutCompleted(_) => "checkout.completed",
            WebhookEvent::PaymentFailed(_) => "payment.failed",
            WebhookEvent::PaymentCancelled(_) => "payment.cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn sign(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"type":"payment.succeeded"}"#;
        let header = sign(b"whsec_test", now().timestamp(), body);
        assert!(verify_signature(&header, body, b"whsec_test", now()).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign(b"whsec_test", now().timestamp(), b"original");
        assert_eq!(
            verify_signature(&header, b"tampered", b"whsec_test", now()),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let header = sign(b"whsec_test", now().timestamp(), body);
        assert_eq!(
            verify_signature(&header, body, b"whsec_other", now()),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected_even_with_a_valid_mac() {
        let body = b"payload";
        let timestamp = now().timestamp() - 400;
        let header = sign(b"whsec_test", timestamp, body);
        assert_eq!(
            verify_signature(&header, body, b"whsec_test", now()),
            Err(WebhookError::ReplayTooOld {
                age_secs: 400,
                max_age_secs: REPLAY_WINDOW_SECS,
            })
        );
    }

    #[test]
    fn skew_inside_the_window_is_accepted_both_ways() {
        let body = b"payload";
        for offset in [-300, -1, 0, 1, 300] {
            let timestamp = now().timestamp() + offset;
            let header = sign(b"whsec_test", timestamp, body);
            assert!(verify_signature(&header, body, b"whsec_test", now()).is_ok());
        }
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "t=abc,v1=00", "v1=00", "t=100", "t=100,v1=zz"] {
            assert_eq!(
                verify_signature(header, b"x", b"s", now()),
                Err(WebhookError::MalformedHeader),
                "header: {header}"
            );
        }
    }

    #[test]
    fn payment_succeeded_parses() {
        let raw = br#"{
            "type": "payment.succeeded",
            "data": {
                "payment_id": "pay_123",
                "amount": 5000,
                "currency": "USD",
                "payment_method": "card",
                "metadata": {"invoice_number": "INV-20260301093000-1234"}
            }
        }"#;
        let ParsedWebhook::Known(event) = parse_event(raw).unwrap() else {
            panic!("expected a known event");
        };
        assert!(event.drives_reconciliation());
        assert_eq!(event.external_payment_id(), "pay_123");
        assert_eq!(event.amount(), Decimal::new(5_000, 0));
        assert_eq!(event.status(), "succeeded");
        assert_eq!(
            event.metadata().invoice_number.as_deref(),
            Some("INV-20260301093000-1234")
        );
    }

    #[test]
    fn processor_status_survives_into_the_event() {
        let raw = br#"{
            "type": "payment.completed",
            "data": {"payment_id": "pay_7", "amount": 100, "status": "completed"}
        }"#;
        let ParsedWebhook::Known(event) = parse_event(raw).unwrap() else {
            panic!("expected a known event");
        };
        assert_eq!(event.status(), "completed");

        let raw = br#"{"type":"payment.failed","data":{"payment_id":"pay_8","amount":100}}"#;
        let ParsedWebhook::Known(event) = parse_event(raw).unwrap() else {
            panic!("expected a known event");
        };
        assert_eq!(event.status(), "failed");
    }

    #[test]
    fn checkout_completed_is_keyed_by_session_id() {
        let proposal_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"checkout.completed","data":{{"session_id":"cks_9","amount":"120.50","metadata":{{"proposal_id":"{proposal_id}"}}}}}}"#
        );
        let ParsedWebhook::Known(event) = parse_event(raw.as_bytes()).unwrap() else {
            panic!("expected a known event");
        };
        assert_eq!(event.external_payment_id(), "cks_9");
        assert_eq!(event.metadata().proposal_id, Some(proposal_id));
        assert!(event.drives_reconciliation());
    }

    #[test]
    fn failed_and_cancelled_do_not_reconcile() {
        for kind in ["payment.failed", "payment.cancelled"] {
            let raw = format!(
                r#"{{"type":"{kind}","data":{{"payment_id":"pay_1","amount":100}}}}"#
            );
            let ParsedWebhook::Known(event) = parse_event(raw.as_bytes()).unwrap() else {
                panic!("expected a known event");
            };
            assert!(!event.drives_reconciliation());
        }
    }

    #[test]
    fn unrecognized_types_are_flagged_not_dropped() {
        let raw = br#"{"type":"refund.created","data":{}}"#;
        assert_eq!(
            parse_event(raw).unwrap(),
            ParsedWebhook::Unrecognized {
                event_type: "refund.created".to_string()
            }
        );
    }

    #[test]
    fn malformed_json_is_a_bad_request() {
        assert!(matches!(
            parse_event(b"not json"),
            Err(WebhookError::MalformedPayload(_))
        ));
    }
}
