use std::{net::SocketAddr, sync::Arc, time::Duration as StdDuration};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{info, warn};
use uuid::Uuid;

use axiom_billing::{ParsedWebhook, WebhookEvent};
use axiom_core::{
    ActivityKind, CheckoutProvider, CheckoutRequest, ContentGenerator, ErrorClass,
    GeneratedContent, HostedCheckoutProvider, InvoiceStatus, LineItem, ProjectBrief,
    ProposalStatus, SignatureStatus, SigningError, TemplateGenerator, WebhookError,
};
use axiom_platform::{
    AcceptTermsRequest, AcceptTermsResponse, ActivityListResponse, ActivityView,
    ClientSignRequest, ClientSignResponse, CreateProposalRequest, DirectSignRequest,
    FreelancerSignRequest, FreelancerSignResponse, GenerateInvoiceRequest, InvoiceBalance,
    InvoiceDetail, InvoicePaidEvent, ProposalDetail, ProposalListResponse, ProposalPendingEvent,
    ProposalSignedEvent, ProposalSummary, RedisBus, ServiceConfig, SetPaymentLinkRequest,
    ShareResponse, SharedProposalView, VerifyEmailRequest, VerifyEmailResponse, WebhookAck,
    connect_database,
};
use axiom_signing::{ContentSnapshot, SignatureSnapshot};

const CHANNEL_PROPOSAL_PENDING: &str = "proposals.pending_client";
const CHANNEL_PROPOSAL_SIGNED: &str = "proposals.signed";
const CHANNEL_INVOICE_PAID: &str = "invoices.paid";

/// Header installed by the fronting auth layer carrying the authenticated
/// principal for owner-gated operations.
const CALLER_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    redis: RedisBus,
    generator: Arc<dyn ContentGenerator>,
    checkout: Option<Arc<dyn CheckoutProvider>>,
    webhook_secret: Option<String>,
    share_link_ttl: Duration,
    collaborator_timeout: StdDuration,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "axiom_gateway=info,tower_http=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url, config.db_max_connections).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    if config.webhook_secret.is_none() {
        warn!("PAYMENT_WEBHOOK_SECRET is not set; webhook deliveries will be accepted unsigned");
    }

    let checkout: Option<Arc<dyn CheckoutProvider>> = match config.checkout_base_url.as_deref() {
        Some(base_url) => Some(Arc::new(HostedCheckoutProvider::new(base_url))),
        None => {
            info!("CHECKOUT_BASE_URL is not set; invoices are created without payment links");
            None
        }
    };

    let state = AppState {
        pool,
        redis,
        generator: Arc::new(TemplateGenerator),
        checkout,
        webhook_secret: config.webhook_secret.clone(),
        share_link_ttl: Duration::days(config.share_link_ttl_days),
        collaborator_timeout: StdDuration::from_secs(config.collaborator_timeout_secs),
    };

    let router = build_router(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/proposals", get(list_proposals).post(create_proposal))
        .route("/proposals/{proposal_id}", get(get_proposal))
        .route("/proposals/{proposal_id}/share", post(share_proposal))
        .route("/proposals/{proposal_id}/activity", get(list_activity))
        .route(
            "/proposals/{proposal_id}/signature/freelancer",
            post(freelancer_sign),
        )
        .route(
            "/proposals/{proposal_id}/signature/verify-email",
            post(verify_client_email),
        )
        .route(
            "/proposals/{proposal_id}/signature/accept-terms",
            post(accept_terms),
        )
        .route(
            "/proposals/{proposal_id}/signature/client",
            post(client_sign),
        )
        .route("/proposals/{proposal_id}/invoice", post(generate_invoice))
        .route("/share/proposals/{access_token}", get(view_shared_proposal))
        .route("/share/sign/{signature_token}", post(direct_client_sign))
        .route("/share/invoices/{access_token}", get(view_shared_invoice))
        .route("/invoices/{invoice_id}", get(get_invoice))
        .route(
            "/invoices/{invoice_id}/payment-link",
            post(set_payment_link),
        )
        .route("/invoices/{invoice_id}/share", post(share_invoice))
        .route("/webhooks/payments", post(ingest_payment_webhook))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

// --- proposals -----------------------------------------------------------

async fn create_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateProposalRequest>,
) -> Result<(StatusCode, Json<ProposalDetail>), (StatusCode, String)> {
    let owner_id = require_caller(&headers)?;

    let client_name = payload.client_name.trim().to_string();
    if client_name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "client_name is required".to_string()));
    }
    let client_email = payload.client_email.trim().to_string();
    if client_email.is_empty() || !client_email.contains('@') {
        return Err((
            StatusCode::BAD_REQUEST,
            "client_email must be a valid address".to_string(),
        ));
    }
    let project_title = payload.project_title.trim().to_string();
    if project_title.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "project_title is required".to_string(),
        ));
    }
    if payload.budget <= Decimal::ZERO {
        return Err((StatusCode::BAD_REQUEST, "budget must be positive".to_string()));
    }

    let brief = ProjectBrief {
        project_title: project_title.clone(),
        client_name: client_name.clone(),
        client_company: trimmed(payload.client_company.as_deref()),
        description: trimmed(payload.description.as_deref()),
        budget: payload.budget,
        currency: payload.currency.trim().to_uppercase(),
        timeline: trimmed(payload.timeline.as_deref()),
    };
    let content = generate_content(&state, &brief).await;

    let proposal_id = Uuid::new_v4();
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    sqlx::query(
        r#"
        INSERT INTO proposals (
            id, owner_id, client_name, client_email, client_company, project_title,
            description, executive_summary, scope_of_work, pricing_breakdown,
            timeline_details, terms_and_conditions, budget, currency, timeline,
            status, signature_status, client_email_verified, terms_accepted,
            created_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
            'draft', 'not_started', FALSE, FALSE, $16, $16
        )
        "#,
    )
    .bind(proposal_id)
    .bind(owner_id)
    .bind(&client_name)
    .bind(&client_email)
    .bind(brief.client_company.as_deref())
    .bind(&project_title)
    .bind(brief.description.as_deref())
    .bind(&content.executive_summary)
    .bind(&content.scope_of_work)
    .bind(&content.pricing_breakdown)
    .bind(&content.timeline_details)
    .bind(&content.terms_and_conditions)
    .bind(payload.budget)
    .bind(&brief.currency)
    .bind(brief.timeline.as_deref())
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    insert_activity(
        &mut tx,
        proposal_id,
        ActivityKind::Created,
        &format!("Proposal created for {client_name}"),
        None,
        now,
    )
    .await?;

    tx.commit().await.map_err(internal_error)?;

    let detail = fetch_proposal_detail(&state.pool, proposal_id).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn list_proposals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ProposalListResponse>, (StatusCode, String)> {
    let owner_id = require_caller(&headers)?;

    let rows = sqlx::query(
        r#"
        SELECT id, project_title, client_name, budget, currency, status,
               signature_status, created_at
        FROM proposals
        WHERE owner_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(owner_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(ProposalSummary {
            proposal_id: row.try_get("id").map_err(internal_error)?,
            project_title: row.try_get("project_title").map_err(internal_error)?,
            client_name: row.try_get("client_name").map_err(internal_error)?,
            budget: row.try_get("budget").map_err(internal_error)?,
            currency: row.try_get("currency").map_err(internal_error)?,
            status: parse_proposal_status(&row)?,
            signature_status: parse_signature_status(&row)?,
            created_at: row.try_get("created_at").map_err(internal_error)?,
        });
    }

    Ok(Json(ProposalListResponse { items }))
}

async fn get_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(proposal_id): Path<Uuid>,
) -> Result<Json<ProposalDetail>, (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;
    let detail = fetch_proposal_detail(&state.pool, proposal_id).await?;
    axiom_signing::authorize_owner(detail.owner_id, caller_id).map_err(signing_error)?;
    Ok(Json(detail))
}

async fn share_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(proposal_id): Path<Uuid>,
) -> Result<Json<ShareResponse>, (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        "SELECT owner_id, access_token, status, client_name FROM proposals WHERE id = $1 FOR UPDATE",
    )
    .bind(proposal_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "proposal not found".to_string()));
    };

    let owner_id: Uuid = row.try_get("owner_id").map_err(internal_error)?;
    axiom_signing::authorize_owner(owner_id, caller_id).map_err(signing_error)?;

    let access_token: Option<String> = row.try_get("access_token").map_err(internal_error)?;
    let access_token = access_token.unwrap_or_else(axiom_signing::mint_access_token);
    let expires_at = now + state.share_link_ttl;
    let status: String = row.try_get("status").map_err(internal_error)?;
    let new_status = if status == "draft" { "sent" } else { status.as_str() };
    let client_name: String = row.try_get("client_name").map_err(internal_error)?;

    sqlx::query(
        r#"
        UPDATE proposals
        SET access_token = $2, access_expires_at = $3, status = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(proposal_id)
    .bind(&access_token)
    .bind(expires_at)
    .bind(new_status)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    insert_activity(
        &mut tx,
        proposal_id,
        ActivityKind::Sent,
        &format!("Proposal shared with {client_name}"),
        None,
        now,
    )
    .await?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ShareResponse {
        access_token,
        access_expires_at: expires_at,
    }))
}

async fn view_shared_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(access_token): Path<String>,
) -> Result<Json<SharedProposalView>, (StatusCode, String)> {
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        r#"
        SELECT id, client_name, client_company, project_title, executive_summary,
               scope_of_work, pricing_breakdown, timeline_details,
               terms_and_conditions, budget, currency, signature_status,
               freelancer_signed_at, client_signed_at, access_expires_at
        FROM proposals
        WHERE access_token = $1
        "#,
    )
    .bind(&access_token)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "share link not found".to_string()));
    };

    let expires_at: Option<DateTime<Utc>> =
        row.try_get("access_expires_at").map_err(internal_error)?;
    if matches!(expires_at, Some(expiry) if expiry < now) {
        return Err((StatusCode::GONE, "share link has expired".to_string()));
    }

    let proposal_id: Uuid = row.try_get("id").map_err(internal_error)?;
    let ip_address = client_ip_from_headers(&headers);
    let user_agent = header_value(&headers, "user-agent");
    let referer = header_value(&headers, "referer");

    sqlx::query(
        r#"
        INSERT INTO proposal_views (id, proposal_id, ip_address, user_agent, referer, viewed_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(proposal_id)
    .bind(&ip_address)
    .bind(user_agent.as_deref())
    .bind(referer.as_deref())
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    insert_activity(
        &mut tx,
        proposal_id,
        ActivityKind::Viewed,
        "Proposal viewed via share link",
        Some(json!({ "ip_address": ip_address })),
        now,
    )
    .await?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(SharedProposalView {
        proposal_id,
        client_name: row.try_get("client_name").map_err(internal_error)?,
        client_company: row.try_get("client_company").map_err(internal_error)?,
        project_title: row.try_get("project_title").map_err(internal_error)?,
        executive_summary: row.try_get("executive_summary").map_err(internal_error)?,
        scope_of_work: row.try_get("scope_of_work").map_err(internal_error)?,
        pricing_breakdown: row.try_get("pricing_breakdown").map_err(internal_error)?,
        timeline_details: row.try_get("timeline_details").map_err(internal_error)?,
        terms_and_conditions: row.try_get("terms_and_conditions").map_err(internal_error)?,
        budget: row.try_get("budget").map_err(internal_error)?,
        currency: row.try_get("currency").map_err(internal_error)?,
        signature_status: parse_signature_status(&row)?,
        freelancer_signed_at: row.try_get("freelancer_signed_at").map_err(internal_error)?,
        client_signed_at: row.try_get("client_signed_at").map_err(internal_error)?,
    }))
}

async fn list_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(proposal_id): Path<Uuid>,
) -> Result<Json<ActivityListResponse>, (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;

    let owner_row = sqlx::query("SELECT owner_id FROM proposals WHERE id = $1")
        .bind(proposal_id)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?;
    let Some(owner_row) = owner_row else {
        return Err((StatusCode::NOT_FOUND, "proposal not found".to_string()));
    };
    let owner_id: Uuid = owner_row.try_get("owner_id").map_err(internal_error)?;
    axiom_signing::authorize_owner(owner_id, caller_id).map_err(signing_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, kind, description, metadata, created_at
        FROM activities
        WHERE proposal_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(proposal_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(ActivityView {
            activity_id: row.try_get("id").map_err(internal_error)?,
            kind: row.try_get("kind").map_err(internal_error)?,
            description: row.try_get("description").map_err(internal_error)?,
            metadata: row.try_get("metadata").map_err(internal_error)?,
            created_at: row.try_get("created_at").map_err(internal_error)?,
        });
    }

    Ok(Json(ActivityListResponse { items }))
}

// --- signature workflow --------------------------------------------------

async fn freelancer_sign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(proposal_id): Path<Uuid>,
    Json(payload): Json<FreelancerSignRequest>,
) -> Result<Json<FreelancerSignResponse>, (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;
    if payload.signature_data.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "signature_data is required".to_string(),
        ));
    }

    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        r#"
        SELECT owner_id, executive_summary, scope_of_work, pricing_breakdown,
               timeline_details, terms_and_conditions, budget, project_title,
               signature_token, freelancer_signed_at, client_signed_at,
               client_email_verified, terms_accepted, verification_code,
               verification_code_expiry
        FROM proposals
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(proposal_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "proposal not found".to_string()));
    };

    let owner_id: Uuid = row.try_get("owner_id").map_err(internal_error)?;
    axiom_signing::authorize_owner(owner_id, caller_id).map_err(signing_error)?;

    let snapshot = signature_snapshot(&row)?;
    if snapshot.client_signed_at.is_some() {
        return Err(signing_error(SigningError::AlreadySigned));
    }

    let content = ContentSnapshot {
        executive_summary: row.try_get("executive_summary").map_err(internal_error)?,
        scope_of_work: row.try_get("scope_of_work").map_err(internal_error)?,
        pricing_breakdown: row.try_get("pricing_breakdown").map_err(internal_error)?,
        timeline_details: row.try_get("timeline_details").map_err(internal_error)?,
        terms_and_conditions: row.try_get("terms_and_conditions").map_err(internal_error)?,
        budget: row.try_get("budget").map_err(internal_error)?,
        project_title: row.try_get("project_title").map_err(internal_error)?,
    };

    let effects = axiom_signing::freelancer_sign_effects(&content, &snapshot, now);
    if effects.re_signed {
        warn!(
            "proposal {} re-signed by freelancer; previously issued verification code is invalidated",
            proposal_id
        );
    }

    sqlx::query(
        r#"
        UPDATE proposals
        SET freelancer_signature_type = $2,
            freelancer_signature_data = $3,
            freelancer_signed_at = $4,
            signature_status = 'pending_client',
            signature_token = $5,
            content_hash = $6,
            verification_code = $7,
            verification_code_expiry = $8,
            updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(proposal_id)
    .bind(payload.signature_type.as_str())
    .bind(payload.signature_data.trim())
    .bind(now)
    .bind(&effects.signature_token)
    .bind(&effects.content_hash)
    .bind(&effects.verification_code)
    .bind(effects.verification_code_expiry)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    publish_event(
        &state,
        CHANNEL_PROPOSAL_PENDING,
        &ProposalPendingEvent { proposal_id },
    )
    .await;

    Ok(Json(FreelancerSignResponse {
        proposal_id,
        signature_status: SignatureStatus::PendingClient,
        signature_token: effects.signature_token,
        content_hash: effects.content_hash,
        verification_code_expiry: effects.verification_code_expiry,
        freelancer_signed_at: now,
    }))
}

async fn verify_client_email(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(payload): Json<VerifyEmailRequest>,
) -> Result<Json<VerifyEmailResponse>, (StatusCode, String)> {
    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = lock_signature_row(&mut tx, proposal_id).await?;
    let snapshot = signature_snapshot(&row)?;

    axiom_signing::check_verify_email(&snapshot, &payload.token, payload.code.trim(), now)
        .map_err(signing_error)?;

    sqlx::query("UPDATE proposals SET client_email_verified = TRUE, updated_at = $2 WHERE id = $1")
        .bind(proposal_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(VerifyEmailResponse {
        proposal_id,
        client_email_verified: true,
    }))
}

async fn accept_terms(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(payload): Json<AcceptTermsRequest>,
) -> Result<Json<AcceptTermsResponse>, (StatusCode, String)> {
    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = lock_signature_row(&mut tx, proposal_id).await?;
    let snapshot = signature_snapshot(&row)?;

    axiom_signing::check_accept_terms(&snapshot, &payload.token).map_err(signing_error)?;

    sqlx::query("UPDATE proposals SET terms_accepted = TRUE, updated_at = $2 WHERE id = $1")
        .bind(proposal_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(AcceptTermsResponse {
        proposal_id,
        terms_accepted: true,
    }))
}

async fn client_sign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(proposal_id): Path<Uuid>,
    Json(payload): Json<ClientSignRequest>,
) -> Result<Json<ClientSignResponse>, (StatusCode, String)> {
    if payload.signature_data.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "signature_data is required".to_string(),
        ));
    }

    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = lock_signature_row(&mut tx, proposal_id).await?;
    let snapshot = signature_snapshot(&row)?;

    axiom_signing::check_client_sign(&snapshot, &payload.token).map_err(signing_error)?;

    apply_client_signature(
        &mut tx,
        proposal_id,
        payload.signature_type.as_str(),
        payload.signature_data.trim(),
        &headers,
        now,
    )
    .await?;

    tx.commit().await.map_err(internal_error)?;

    publish_event(
        &state,
        CHANNEL_PROPOSAL_SIGNED,
        &ProposalSignedEvent { proposal_id },
    )
    .await;

    Ok(Json(ClientSignResponse {
        proposal_id,
        signature_status: SignatureStatus::Signed,
        client_signed_at: now,
    }))
}

/// Direct shared-link signing. Weaker gate than the verified flow: token
/// match plus freelancer-signed plus not-already-signed, with no email or
/// terms check. Kept as its own endpoint so the two flows' guarantees
/// stay visibly distinct.
async fn direct_client_sign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(signature_token): Path<String>,
    Json(payload): Json<DirectSignRequest>,
) -> Result<Json<ClientSignResponse>, (StatusCode, String)> {
    if payload.signature_data.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "signature_data is required".to_string(),
        ));
    }

    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        r#"
        SELECT id, signature_token, freelancer_signed_at, client_signed_at,
               client_email_verified, terms_accepted, verification_code,
               verification_code_expiry
        FROM proposals
        WHERE signature_token = $1
        FOR UPDATE
        "#,
    )
    .bind(&signature_token)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(signing_error(SigningError::InvalidToken));
    };

    let proposal_id: Uuid = row.try_get("id").map_err(internal_error)?;
    let snapshot = signature_snapshot(&row)?;

    axiom_signing::check_direct_client_sign(&snapshot, &signature_token)
        .map_err(signing_error)?;

    apply_client_signature(
        &mut tx,
        proposal_id,
        payload.signature_type.as_str(),
        payload.signature_data.trim(),
        &headers,
        now,
    )
    .await?;

    tx.commit().await.map_err(internal_error)?;

    publish_event(
        &state,
        CHANNEL_PROPOSAL_SIGNED,
        &ProposalSignedEvent { proposal_id },
    )
    .await;

    Ok(Json(ClientSignResponse {
        proposal_id,
        signature_status: SignatureStatus::Signed,
        client_signed_at: now,
    }))
}

/// Writes the client signature, flips the workflow to signed, and appends
/// the single SIGNED activity. Runs inside the caller's transaction; the
/// ip/user-agent capture is audit-only.
async fn apply_client_signature(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    proposal_id: Uuid,
    signature_type: &str,
    signature_data: &str,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<(), (StatusCode, String)> {
    let ip_address = client_ip_from_headers(headers);
    let user_agent = header_value(headers, "user-agent");

    sqlx::query(
        r#"
        UPDATE proposals
        SET client_signature_type = $2,
            client_signature_data = $3,
            client_signed_at = $4,
            signature_status = 'signed',
            ip_address = $5,
            user_agent = $6,
            updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(proposal_id)
    .bind(signature_type)
    .bind(signature_data)
    .bind(now)
    .bind(&ip_address)
    .bind(user_agent.as_deref())
    .execute(&mut **tx)
    .await
    .map_err(internal_error)?;

    insert_activity(
        tx,
        proposal_id,
        ActivityKind::Signed,
        "Proposal signed by both parties",
        Some(json!({ "ip_address": ip_address })),
        now,
    )
    .await
}

// --- invoices ------------------------------------------------------------

async fn generate_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(proposal_id): Path<Uuid>,
    Json(payload): Json<GenerateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceDetail>), (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;
    if payload.tax_rate < Decimal::ZERO {
        return Err((
            StatusCode::BAD_REQUEST,
            "tax_rate must not be negative".to_string(),
        ));
    }

    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        r#"
        SELECT owner_id, client_name, client_email, client_company, project_title,
               budget, currency
        FROM proposals
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(proposal_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "proposal not found".to_string()));
    };

    let owner_id: Uuid = row.try_get("owner_id").map_err(internal_error)?;
    axiom_signing::authorize_owner(owner_id, caller_id).map_err(signing_error)?;

    let existing = sqlx::query("SELECT id FROM invoices WHERE proposal_id = $1")
        .bind(proposal_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;
    if existing.is_some() {
        return Err((
            StatusCode::CONFLICT,
            "an invoice already exists for this proposal".to_string(),
        ));
    }

    let client_name: String = row.try_get("client_name").map_err(internal_error)?;
    let client_email: String = row.try_get("client_email").map_err(internal_error)?;
    let client_company: Option<String> =
        row.try_get("client_company").map_err(internal_error)?;
    let project_title: String = row.try_get("project_title").map_err(internal_error)?;
    let budget: Decimal = row.try_get("budget").map_err(internal_error)?;
    let currency: String = row.try_get("currency").map_err(internal_error)?;

    let line_items: Vec<LineItem> = match &payload.line_items {
        Some(inputs) if !inputs.is_empty() => {
            for input in inputs {
                if input.quantity <= Decimal::ZERO || input.rate < Decimal::ZERO {
                    return Err((
                        StatusCode::BAD_REQUEST,
                        "line items need a positive quantity and a non-negative rate".to_string(),
                    ));
                }
            }
            inputs
                .iter()
                .map(|input| {
                    axiom_billing::line_item(input.description.trim(), input.quantity, input.rate)
                })
                .collect()
        }
        _ => vec![axiom_billing::line_item(&project_title, Decimal::ONE, budget)],
    };

    let totals = axiom_billing::compute_totals(&line_items, payload.tax_rate);
    let invoice_id = Uuid::new_v4();
    let invoice_number = axiom_billing::mint_invoice_number(now);
    let line_items_json = serde_json::to_value(&line_items).map_err(internal_error)?;

    sqlx::query(
        r#"
        INSERT INTO invoices (
            id, owner_id, proposal_id, invoice_number, client_name, client_email,
            client_company, line_items, subtotal, tax_rate, tax_amount, total,
            currency, paid_amount, remaining_amount, status, created_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
            $13, 0, $12, 'UNPAID', $14, $14
        )
        "#,
    )
    .bind(invoice_id)
    .bind(owner_id)
    .bind(proposal_id)
    .bind(&invoice_number)
    .bind(&client_name)
    .bind(&client_email)
    .bind(client_company.as_deref())
    .bind(&line_items_json)
    .bind(totals.subtotal)
    .bind(payload.tax_rate)
    .bind(totals.tax_amount)
    .bind(totals.total)
    .bind(&currency)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    insert_activity(
        &mut tx,
        proposal_id,
        ActivityKind::InvoiceGenerated,
        &format!("Invoice {invoice_number} generated"),
        Some(json!({ "invoice_id": invoice_id, "total": totals.total })),
        now,
    )
    .await?;

    tx.commit().await.map_err(internal_error)?;

    // A checkout failure degrades to a missing link; the invoice stands
    // and the owner can attach a link manually later.
    let payment_link = mint_checkout_link(
        &state,
        &CheckoutRequest {
            invoice_id,
            invoice_number: invoice_number.clone(),
            amount: totals.total,
            currency: currency.clone(),
            customer_name: client_name.clone(),
            customer_email: client_email.clone(),
            proposal_id,
        },
    )
    .await;

    if let Some(link) = &payment_link {
        sqlx::query("UPDATE invoices SET payment_link = $2, updated_at = $3 WHERE id = $1")
            .bind(invoice_id)
            .bind(link)
            .bind(Utc::now())
            .execute(&state.pool)
            .await
            .map_err(internal_error)?;
    }

    Ok((
        StatusCode::CREATED,
        Json(InvoiceDetail {
            invoice_id,
            proposal_id,
            invoice_number,
            client_name,
            client_email,
            client_company,
            line_items,
            subtotal: totals.subtotal,
            tax_rate: payload.tax_rate,
            tax_amount: totals.tax_amount,
            total: totals.total,
            currency,
            paid_amount: Decimal::ZERO,
            remaining_amount: totals.total,
            status: InvoiceStatus::Unpaid,
            payment_link,
            access_expires_at: None,
            created_at: now,
        }),
    ))
}

async fn get_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceDetail>, (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;

    let row = fetch_invoice_row(&state.pool, "id", invoice_id.to_string()).await?;
    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "invoice not found".to_string()));
    };

    let owner_id: Uuid = row.try_get("owner_id").map_err(internal_error)?;
    axiom_signing::authorize_owner(owner_id, caller_id).map_err(signing_error)?;

    Ok(Json(invoice_detail(&row)?))
}

async fn set_payment_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<SetPaymentLinkRequest>,
) -> Result<Json<InvoiceDetail>, (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;
    let payment_link = payload.payment_link.trim().to_string();
    if payment_link.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "payment_link is required".to_string(),
        ));
    }

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query("SELECT owner_id FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;
    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "invoice not found".to_string()));
    };
    let owner_id: Uuid = row.try_get("owner_id").map_err(internal_error)?;
    axiom_signing::authorize_owner(owner_id, caller_id).map_err(signing_error)?;

    sqlx::query("UPDATE invoices SET payment_link = $2, updated_at = $3 WHERE id = $1")
        .bind(invoice_id)
        .bind(&payment_link)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    let row = fetch_invoice_row(&state.pool, "id", invoice_id.to_string()).await?;
    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "invoice not found".to_string()));
    };
    Ok(Json(invoice_detail(&row)?))
}

async fn share_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<ShareResponse>, (StatusCode, String)> {
    let caller_id = require_caller(&headers)?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query("SELECT owner_id, access_token FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;
    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "invoice not found".to_string()));
    };

    let owner_id: Uuid = row.try_get("owner_id").map_err(internal_error)?;
    axiom_signing::authorize_owner(owner_id, caller_id).map_err(signing_error)?;

    let access_token: Option<String> = row.try_get("access_token").map_err(internal_error)?;
    let access_token = access_token.unwrap_or_else(axiom_signing::mint_access_token);
    let expires_at = now + state.share_link_ttl;

    sqlx::query(
        "UPDATE invoices SET access_token = $2, access_expires_at = $3, updated_at = $4 WHERE id = $1",
    )
    .bind(invoice_id)
    .bind(&access_token)
    .bind(expires_at)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ShareResponse {
        access_token,
        access_expires_at: expires_at,
    }))
}

async fn view_shared_invoice(
    State(state): State<AppState>,
    Path(access_token): Path<String>,
) -> Result<Json<InvoiceDetail>, (StatusCode, String)> {
    let row = fetch_invoice_row(&state.pool, "access_token", access_token).await?;
    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "share link not found".to_string()));
    };

    let expires_at: Option<DateTime<Utc>> =
        row.try_get("access_expires_at").map_err(internal_error)?;
    if matches!(expires_at, Some(expiry) if expiry < Utc::now()) {
        return Err((StatusCode::GONE, "share link has expired".to_string()));
    }

    Ok(Json(invoice_detail(&row)?))
}

// --- payment reconciliation ----------------------------------------------

async fn ingest_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<WebhookAck>), (StatusCode, String)> {
    let now = Utc::now();

    match &state.webhook_secret {
        Some(secret) => {
            let Some(header) = header_value(&headers, "webhook-signature") else {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    "webhook-signature header is required".to_string(),
                ));
            };
            axiom_billing::verify_signature(&header, body.as_bytes(), secret.as_bytes(), now)
                .map_err(webhook_error)?;
        }
        None => {
            warn!("accepting unsigned webhook delivery; PAYMENT_WEBHOOK_SECRET is not configured");
        }
    }

    let event = match axiom_billing::parse_event(body.as_bytes()).map_err(webhook_error)? {
        ParsedWebhook::Known(event) => event,
        ParsedWebhook::Unrecognized { event_type } => {
            warn!("unhandled webhook event type {event_type}");
            return Ok((
                StatusCode::OK,
                Json(ack_with_warning(format!(
                    "event type {event_type} is not handled"
                ))),
            ));
        }
    };

    if !event.drives_reconciliation() {
        info!("acknowledged {} event without effect", event.kind());
        return Ok((
            StatusCode::OK,
            Json(WebhookAck {
                received: true,
                handled: true,
                already_processed: false,
                warning: None,
                invoice: None,
            }),
        ));
    }

    reconcile_payment(&state, &event).await
}

/// Applies one succeeded payment to its invoice, exactly once. Business
/// misses (no invoice reference, no match) acknowledge with a warning so
/// the processor stops redelivering; infrastructure failures surface as
/// 500 so it retries.
async fn reconcile_payment(
    state: &AppState,
    event: &WebhookEvent,
) -> Result<(StatusCode, Json<WebhookAck>), (StatusCode, String)> {
    let metadata = event.metadata();

    let invoice_row = if let Some(proposal_id) = metadata.proposal_id {
        fetch_invoice_row(&state.pool, "proposal_id", proposal_id.to_string()).await?
    } else if let Some(invoice_number) = &metadata.invoice_number {
        fetch_invoice_row(&state.pool, "invoice_number", invoice_number.clone()).await?
    } else {
        warn!(
            "webhook {} carried no invoice reference; acknowledged without effect",
            event.external_payment_id()
        );
        return Ok((
            StatusCode::OK,
            Json(ack_with_warning(
                "event metadata carries no proposal_id or invoice_number".to_string(),
            )),
        ));
    };

    let Some(invoice_row) = invoice_row else {
        warn!(
            "webhook {} referenced an unknown invoice; acknowledged without effect",
            event.external_payment_id()
        );
        return Ok((
            StatusCode::OK,
            Json(ack_with_warning("no matching invoice".to_string())),
        ));
    };

    let invoice_id: Uuid = invoice_row.try_get("id").map_err(internal_error)?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        r#"
        SELECT proposal_id, invoice_number, currency, total, paid_amount, remaining_amount, status
        FROM invoices
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(invoice_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    let proposal_id: Uuid = row.try_get("proposal_id").map_err(internal_error)?;
    let invoice_number: String = row.try_get("invoice_number").map_err(internal_error)?;
    let invoice_currency: String = row.try_get("currency").map_err(internal_error)?;
    let total: Decimal = row.try_get("total").map_err(internal_error)?;
    let paid_amount: Decimal = row.try_get("paid_amount").map_err(internal_error)?;

    // The unique constraint on external_payment_id is the idempotency
    // guard; a concurrent duplicate delivery loses this insert.
    let inserted = sqlx::query(
        r#"
        INSERT INTO payments (
            id, invoice_id, external_payment_id, amount, currency, status,
            payment_method, metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (external_payment_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(invoice_id)
    .bind(event.external_payment_id())
    .bind(event.amount())
    .bind(event.currency().unwrap_or(invoice_currency.as_str()))
    .bind(event.status())
    .bind(event.payment_method())
    .bind(json!({ "event_type": event.kind() }))
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    if inserted.rows_affected() == 0 {
        info!(
            "payment {} already processed for invoice {invoice_number}",
            event.external_payment_id()
        );
        let remaining: Decimal = row.try_get("remaining_amount").map_err(internal_error)?;
        let status: String = row.try_get("status").map_err(internal_error)?;
        return Ok((
            StatusCode::OK,
            Json(WebhookAck {
                received: true,
                handled: true,
                already_processed: true,
                warning: None,
                invoice: Some(InvoiceBalance {
                    invoice_id,
                    invoice_number,
                    status: parse_invoice_status(&status)?,
                    paid_amount,
                    remaining_amount: remaining,
                }),
            }),
        ));
    }

    let applied = axiom_billing::apply_payment(paid_amount, total, event.amount());

    sqlx::query(
        r#"
        UPDATE invoices
        SET paid_amount = $2, remaining_amount = $3, status = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(invoice_id)
    .bind(applied.paid_amount)
    .bind(applied.remaining_amount)
    .bind(applied.status.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    insert_activity(
        &mut tx,
        proposal_id,
        ActivityKind::PaymentReceived,
        &format!(
            "Payment of {} {} received on invoice {invoice_number}",
            event.amount(),
            invoice_currency
        ),
        Some(json!({
            "invoice_id": invoice_id,
            "external_payment_id": event.external_payment_id(),
        })),
        now,
    )
    .await?;

    tx.commit().await.map_err(internal_error)?;

    info!(
        "applied payment {} to invoice {invoice_number}: paid {} remaining {} status {}",
        event.external_payment_id(),
        applied.paid_amount,
        applied.remaining_amount,
        applied.status.as_str()
    );

    if applied.status == InvoiceStatus::Paid {
        publish_event(
            state,
            CHANNEL_INVOICE_PAID,
            &InvoicePaidEvent {
                invoice_id,
                invoice_number: invoice_number.clone(),
                paid_amount: applied.paid_amount,
            },
        )
        .await;
    }

    Ok((
        StatusCode::OK,
        Json(WebhookAck {
            received: true,
            handled: true,
            already_processed: false,
            warning: None,
            invoice: Some(InvoiceBalance {
                invoice_id,
                invoice_number,
                status: applied.status,
                paid_amount: applied.paid_amount,
                remaining_amount: applied.remaining_amount,
            }),
        }),
    ))
}

// --- helpers -------------------------------------------------------------

async fn generate_content(state: &AppState, brief: &ProjectBrief) -> GeneratedContent {
    match tokio::time::timeout(state.collaborator_timeout, state.generator.generate(brief)).await {
        Ok(Ok(content)) => content,
        Ok(Err(err)) => {
            warn!("content generator failed, using template fallback: {err:#}");
            TemplateGenerator::render(brief)
        }
        Err(_) => {
            warn!("content generator timed out, using template fallback");
            TemplateGenerator::render(brief)
        }
    }
}

async fn mint_checkout_link(state: &AppState, request: &CheckoutRequest) -> Option<String> {
    let provider = state.checkout.as_ref()?;

    match tokio::time::timeout(
        state.collaborator_timeout,
        provider.create_checkout_session(request),
    )
    .await
    {
        Ok(Ok(session)) => Some(session.checkout_url),
        Ok(Err(err)) => {
            warn!(
                "checkout session creation failed for invoice {}: {err:#}",
                request.invoice_number
            );
            None
        }
        Err(_) => {
            warn!(
                "checkout session creation timed out for invoice {}",
                request.invoice_number
            );
            None
        }
    }
}

async fn publish_event<T: serde::Serialize>(state: &AppState, channel: &str, payload: &T) {
    if let Err(err) = state.redis.publish_json(channel, payload).await {
        warn!("failed to publish on {channel}: {err:#}");
    }
}

async fn lock_signature_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    proposal_id: Uuid,
) -> Result<PgRow, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        SELECT signature_token, freelancer_signed_at, client_signed_at,
               client_email_verified, terms_accepted, verification_code,
               verification_code_expiry
        FROM proposals
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(proposal_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(internal_error)?;

    row.ok_or((StatusCode::NOT_FOUND, "proposal not found".to_string()))
}

fn signature_snapshot(row: &PgRow) -> Result<SignatureSnapshot, (StatusCode, String)> {
    Ok(SignatureSnapshot {
        signature_token: row.try_get("signature_token").map_err(internal_error)?,
        freelancer_signed_at: row.try_get("freelancer_signed_at").map_err(internal_error)?,
        client_signed_at: row.try_get("client_signed_at").map_err(internal_error)?,
        client_email_verified: row.try_get("client_email_verified").map_err(internal_error)?,
        terms_accepted: row.try_get("terms_accepted").map_err(internal_error)?,
        verification_code: row.try_get("verification_code").map_err(internal_error)?,
        verification_code_expiry: row
            .try_get("verification_code_expiry")
            .map_err(internal_error)?,
    })
}

async fn fetch_proposal_detail(
    pool: &PgPool,
    proposal_id: Uuid,
) -> Result<ProposalDetail, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        SELECT id, owner_id, client_name, client_email, client_company, project_title,
               description, executive_summary, scope_of_work, pricing_breakdown,
               timeline_details, terms_and_conditions, budget, currency, timeline,
               status, signature_status, content_hash, freelancer_signed_at,
               client_signed_at, access_expires_at, created_at, updated_at
        FROM proposals
        WHERE id = $1
        "#,
    )
    .bind(proposal_id)
    .fetch_optional(pool)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err((StatusCode::NOT_FOUND, "proposal not found".to_string()));
    };

    Ok(ProposalDetail {
        proposal_id: row.try_get("id").map_err(internal_error)?,
        owner_id: row.try_get("owner_id").map_err(internal_error)?,
        client_name: row.try_get("client_name").map_err(internal_error)?,
        client_email: row.try_get("client_email").map_err(internal_error)?,
        client_company: row.try_get("client_company").map_err(internal_error)?,
        project_title: row.try_get("project_title").map_err(internal_error)?,
        description: row.try_get("description").map_err(internal_error)?,
        executive_summary: row.try_get("executive_summary").map_err(internal_error)?,
        scope_of_work: row.try_get("scope_of_work").map_err(internal_error)?,
        pricing_breakdown: row.try_get("pricing_breakdown").map_err(internal_error)?,
        timeline_details: row.try_get("timeline_details").map_err(internal_error)?,
        terms_and_conditions: row.try_get("terms_and_conditions").map_err(internal_error)?,
        budget: row.try_get("budget").map_err(internal_error)?,
        currency: row.try_get("currency").map_err(internal_error)?,
        timeline: row.try_get("timeline").map_err(internal_error)?,
        status: parse_proposal_status(&row)?,
        signature_status: parse_signature_status(&row)?,
        content_hash: row.try_get("content_hash").map_err(internal_error)?,
        freelancer_signed_at: row.try_get("freelancer_signed_at").map_err(internal_error)?,
        client_signed_at: row.try_get("client_signed_at").map_err(internal_error)?,
        access_expires_at: row.try_get("access_expires_at").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        updated_at: row.try_get("updated_at").map_err(internal_error)?,
    })
}

async fn fetch_invoice_row(
    pool: &PgPool,
    column: &str,
    value: String,
) -> Result<Option<PgRow>, (StatusCode, String)> {
    let sql = format!(
        r#"
        SELECT id, owner_id, proposal_id, invoice_number, client_name, client_email,
               client_company, line_items, subtotal, tax_rate, tax_amount, total,
               currency, paid_amount, remaining_amount, status, payment_link,
               access_token, access_expires_at, created_at, updated_at
        FROM invoices
        WHERE {column}::text = $1
        "#
    );

    sqlx::query(&sql)
        .bind(value)
        .fetch_optional(pool)
        .await
        .map_err(internal_error)
}

fn invoice_detail(row: &PgRow) -> Result<InvoiceDetail, (StatusCode, String)> {
    let line_items_json: serde_json::Value = row.try_get("line_items").map_err(internal_error)?;
    let line_items: Vec<LineItem> =
        serde_json::from_value(line_items_json).map_err(internal_error)?;
    let status: String = row.try_get("status").map_err(internal_error)?;

    Ok(InvoiceDetail {
        invoice_id: row.try_get("id").map_err(internal_error)?,
        proposal_id: row.try_get("proposal_id").map_err(internal_error)?,
        invoice_number: row.try_get("invoice_number").map_err(internal_error)?,
        client_name: row.try_get("client_name").map_err(internal_error)?,
        client_email: row.try_get("client_email").map_err(internal_error)?,
        client_company: row.try_get("client_company").map_err(internal_error)?,
        line_items,
        subtotal: row.try_get("subtotal").map_err(internal_error)?,
        tax_rate: row.try_get("tax_rate").map_err(internal_error)?,
        tax_amount: row.try_get("tax_amount").map_err(internal_error)?,
        total: row.try_get("total").map_err(internal_error)?,
        currency: row.try_get("currency").map_err(internal_error)?,
        paid_amount: row.try_get("paid_amount").map_err(internal_error)?,
        remaining_amount: row.try_get("remaining_amount").map_err(internal_error)?,
        status: parse_invoice_status(&status)?,
        payment_link: row.try_get("payment_link").map_err(internal_error)?,
        access_expires_at: row.try_get("access_expires_at").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
    })
}

async fn insert_activity(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    proposal_id: Uuid,
    kind: ActivityKind,
    description: &str,
    metadata: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<(), (StatusCode, String)> {
    sqlx::query(
        r#"
        INSERT INTO activities (id, proposal_id, kind, description, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(proposal_id)
    .bind(kind.as_str())
    .bind(description)
    .bind(metadata)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(internal_error)?;

    Ok(())
}

fn require_caller(headers: &HeaderMap) -> Result<Uuid, (StatusCode, String)> {
    let value = headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or((
            StatusCode::UNAUTHORIZED,
            format!("{CALLER_HEADER} header is required"),
        ))?;

    value.parse::<Uuid>().map_err(|_| {
        (
            StatusCode::UNAUTHORIZED,
            format!("{CALLER_HEADER} must be a UUID"),
        )
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn client_ip_from_headers(headers: &HeaderMap) -> String {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|value| value.to_str().ok());
    axiom_signing::client_ip(forwarded_for, real_ip)
}

fn parse_proposal_status(row: &PgRow) -> Result<ProposalStatus, (StatusCode, String)> {
    let raw: String = row.try_get("status").map_err(internal_error)?;
    ProposalStatus::parse(&raw)
        .ok_or_else(|| internal_error(format!("unknown proposal status {raw}")))
}

fn parse_signature_status(row: &PgRow) -> Result<SignatureStatus, (StatusCode, String)> {
    let raw: String = row.try_get("signature_status").map_err(internal_error)?;
    SignatureStatus::parse(&raw)
        .ok_or_else(|| internal_error(format!("unknown signature status {raw}")))
}

fn parse_invoice_status(raw: &str) -> Result<InvoiceStatus, (StatusCode, String)> {
    InvoiceStatus::parse(raw).ok_or_else(|| internal_error(format!("unknown invoice status {raw}")))
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn signing_error(err: SigningError) -> (StatusCode, String) {
    let status = match err.class() {
        ErrorClass::Identity => match err {
            SigningError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        },
        ErrorClass::Ordering => StatusCode::CONFLICT,
        ErrorClass::Input => StatusCode::BAD_REQUEST,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
    };
    (status, err.to_string())
}

fn webhook_error(err: WebhookError) -> (StatusCode, String) {
    let status = match err {
        WebhookError::InvalidSignature | WebhookError::ReplayTooOld { .. } => {
            StatusCode::UNAUTHORIZED
        }
        WebhookError::MalformedHeader | WebhookError::MalformedPayload(_) => {
            StatusCode::BAD_REQUEST
        }
    };
    (status, err.to_string())
}

fn ack_with_warning(warning: String) -> WebhookAck {
    WebhookAck {
        received: true,
        handled: false,
        already_processed: false,
        warning: Some(warning),
        invoice: None,
    }
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn caller_header_must_be_a_uuid() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            require_caller(&headers).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );

        headers.insert(CALLER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(
            require_caller(&headers).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );

        let id = Uuid::new_v4();
        headers.insert(
            CALLER_HEADER,
            HeaderValue::from_str(&id.to_string()).unwrap(),
        );
        assert_eq!(require_caller(&headers).unwrap(), id);
    }

    #[test]
    fn signing_errors_map_to_distinct_status_families() {
        assert_eq!(
            signing_error(SigningError::Forbidden).0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            signing_error(SigningError::InvalidToken).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            signing_error(SigningError::TermsNotAccepted).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            signing_error(SigningError::FreelancerMustSignFirst).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            signing_error(SigningError::CodeExpired).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            signing_error(SigningError::NotFound).0,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn webhook_auth_failures_are_not_acknowledged() {
        assert_eq!(
            webhook_error(WebhookError::InvalidSignature).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            webhook_error(WebhookError::ReplayTooOld {
                age_secs: 400,
                max_age_secs: 300
            })
            .0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            webhook_error(WebhookError::MalformedPayload("bad".to_string())).0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn forwarded_ip_extraction_order() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip_from_headers(&headers), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip_from_headers(&headers), "10.0.0.2");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip_from_headers(&headers), "203.0.113.7");
    }
}
