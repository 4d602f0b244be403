use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::Msg;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::{error, info};
use uuid::Uuid;

use axiom_core::{EmailMessage, EmailSender};
use axiom_platform::{
    InvoicePaidEvent, ProposalPendingEvent, ProposalSignedEvent, RedisBus, ServiceConfig,
    connect_database,
};

const CHANNEL_PROPOSAL_PENDING: &str = "proposals.pending_client";
const CHANNEL_PROPOSAL_SIGNED: &str = "proposals.signed";
const CHANNEL_INVOICE_PAID: &str = "invoices.paid";

/// Stand-in delivery channel: writes the rendered message to the log.
/// A production sender implements [`EmailSender`] against the mail
/// provider's API without touching the handlers below.
struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            "email to {}: {} | {}",
            message.to, message.subject, message.body
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "axiom_notifier=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url, config.db_max_connections).await?;
    let redis = RedisBus::connect(&config.redis_url)?;
    let sender = LogEmailSender;

    let mut pubsub = redis
        .subscriber(&[
            CHANNEL_PROPOSAL_PENDING,
            CHANNEL_PROPOSAL_SIGNED,
            CHANNEL_INVOICE_PAID,
        ])
        .await?;
    let mut messages = pubsub.on_message();

    info!(
        "notifier subscribed to {CHANNEL_PROPOSAL_PENDING}, {CHANNEL_PROPOSAL_SIGNED}, {CHANNEL_INVOICE_PAID}"
    );

    loop {
        let msg = messages
            .next()
            .await
            .context("notification stream ended unexpectedly")?;
        if let Err(err) = handle_message(&pool, &sender, msg).await {
            error!("failed to process notification: {err:#}");
        }
    }
}

async fn handle_message(pool: &PgPool, sender: &dyn EmailSender, msg: Msg) -> Result<()> {
    let channel = msg.get_channel_name().to_string();
    let payload: String = msg.get_payload()?;

    match channel.as_str() {
        CHANNEL_PROPOSAL_PENDING => {
            let event: ProposalPendingEvent = serde_json::from_str(&payload)?;
            send_verification_email(pool, sender, event.proposal_id).await
        }
        CHANNEL_PROPOSAL_SIGNED => {
            let event: ProposalSignedEvent = serde_json::from_str(&payload)?;
            send_signed_confirmation(pool, sender, event.proposal_id).await
        }
        CHANNEL_INVOICE_PAID => {
            let event: InvoicePaidEvent = serde_json::from_str(&payload)?;
            send_payment_receipt(pool, sender, event.invoice_id).await
        }
        other => {
            anyhow::bail!("unexpected channel {other}");
        }
    }
}

/// Emails the one-time verification code to the client once the
/// freelancer has signed. The code is read back from the store rather
/// than carried on the bus.
async fn send_verification_email(
    pool: &PgPool,
    sender: &dyn EmailSender,
    proposal_id: Uuid,
) -> Result<()> {
    let row = sqlx::query(
        r#"
        SELECT client_name, client_email, project_title, verification_code,
               verification_code_expiry
        FROM proposals
        WHERE id = $1
        "#,
    )
    .bind(proposal_id)
    .fetch_optional(pool)
    .await?
    .context("proposal not found")?;

    let client_name: String = row.try_get("client_name")?;
    let client_email: String = row.try_get("client_email")?;
    let project_title: String = row.try_get("project_title")?;
    let verification_code: Option<String> = row.try_get("verification_code")?;
    let verification_code =
        verification_code.context("proposal has no pending verification code")?;

    sender
        .send(&EmailMessage {
            to: client_email,
            subject: format!("Signature requested: {project_title}"),
            body: format!(
                "Hi {client_name}, the proposal \"{project_title}\" is ready for your \
                 signature. Your verification code is {verification_code}; it expires \
                 in one hour."
            ),
        })
        .await?;

    info!("verification email dispatched for proposal {proposal_id}");
    Ok(())
}

async fn send_signed_confirmation(
    pool: &PgPool,
    sender: &dyn EmailSender,
    proposal_id: Uuid,
) -> Result<()> {
    let row = sqlx::query(
        "SELECT client_name, client_email, project_title FROM proposals WHERE id = $1",
    )
    .bind(proposal_id)
    .fetch_optional(pool)
    .await?
    .context("proposal not found")?;

    let client_name: String = row.try_get("client_name")?;
    let client_email: String = row.try_get("client_email")?;
    let project_title: String = row.try_get("project_title")?;

    sender
        .send(&EmailMessage {
            to: client_email,
            subject: format!("Fully signed: {project_title}"),
            body: format!(
                "Hi {client_name}, both parties have now signed \"{project_title}\". \
                 A copy of the signed proposal is available through your link."
            ),
        })
        .await?;

    info!("signed confirmation dispatched for proposal {proposal_id}");
    Ok(())
}

async fn send_payment_receipt(
    pool: &PgPool,
    sender: &dyn EmailSender,
    invoice_id: Uuid,
) -> Result<()> {
    let row = sqlx::query(
        r#"
        SELECT invoice_number, client_name, client_email, total, paid_amount, currency
        FROM invoices
        WHERE id = $1
        "#,
    )
    .bind(invoice_id)
    .fetch_optional(pool)
    .await?
    .context("invoice not found")?;

    let invoice_number: String = row.try_get("invoice_number")?;
    let client_name: String = row.try_get("client_name")?;
    let client_email: String = row.try_get("client_email")?;
    let total: Decimal = row.try_get("total")?;
    let currency: String = row.try_get("currency")?;

    sender
        .send(&EmailMessage {
            to: client_email,
            subject: format!("Payment received for {invoice_number}"),
            body: format!(
                "Hi {client_name}, invoice {invoice_number} is now paid in full \
                 ({total} {currency}). Thank you."
            ),
        })
        .await?;

    info!("payment receipt dispatched for invoice {invoice_id}");
    Ok(())
}
