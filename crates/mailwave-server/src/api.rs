use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use mailwave_shared::constants::UNSUBSCRIBE_REASON_USER_REQUEST;
use mailwave_shared::{CampaignId, ContactStatus, QueueId, UserId};
use mailwave_store::{CreditBalance, EmailSend, SendQueue, StoreError, Unsubscribe};

use crate::auth::{self, AuthUser};
use crate::config::ServerConfig;
use crate::db::SharedDb;
use crate::dispatch::{Dispatcher, SendRequest, SendResponse};
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub dispatcher: Dispatcher,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/sends", post(initiate_send))
        .route("/credits", get(my_credits))
        .route("/campaigns/:id/queues", get(campaign_queues))
        .route("/queues/:id", get(queue_status))
        .route("/queues/:id/process", post(process_queue))
        .route("/queues/:id/sends", get(queue_sends))
        .route("/unsubscribe", get(unsubscribe))
        .route("/admin/credits", post(admin_add_credits))
        .route("/admin/tokens", post(admin_issue_token))
        .route("/admin/unsubscribes", get(admin_list_unsubscribes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueView {
    #[serde(flatten)]
    queue: SendQueue,
    progress: f64,
    stuck: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessResponse {
    queue_id: QueueId,
    submitted: bool,
}

#[derive(Deserialize)]
struct UnsubscribeQuery {
    email: String,
    #[serde(default)]
    campaign: Option<String>,
}

#[derive(Deserialize)]
struct EmailQuery {
    email: String,
}

#[derive(Deserialize)]
struct AdminCreditsRequest {
    user_id: UserId,
    paid_credits: i64,
}

#[derive(Deserialize)]
struct AdminTokenRequest {
    user_id: UserId,
}

#[derive(Serialize)]
struct AdminTokenResponse {
    token: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn initiate_send(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, ServerError> {
    let response = state.dispatcher.initiate_send(user_id, &request).await?;
    Ok(Json(response))
}

async fn my_credits(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<serde_json::Value>, ServerError> {
    let available = state.db.with(|db| db.available_credits(user_id))?;
    Ok(Json(serde_json::json!({ "available": available })))
}

/// Load a queue the caller owns. Someone else's queue is reported as
/// missing.
fn owned_queue(state: &AppState, user_id: UserId, id: QueueId) -> Result<SendQueue, ServerError> {
    let queue = state.db.with(|db| db.get_send_queue(id))?;
    if queue.user_id != user_id {
        return Err(ServerError::NotFound("queue not found".into()));
    }
    Ok(queue)
}

async fn queue_status(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<QueueId>,
) -> Result<Json<QueueView>, ServerError> {
    let queue = owned_queue(&state, user_id, id)?;
    let stuck_after = chrono::Duration::from_std(state.config.stuck_after)
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    Ok(Json(QueueView {
        progress: queue.progress_percent(),
        stuck: queue.is_stuck(chrono::Utc::now(), stuck_after),
        queue,
    }))
}

/// Send history of one campaign, newest first.
async fn campaign_queues(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<CampaignId>,
) -> Result<Json<Vec<SendQueue>>, ServerError> {
    let queues = state.db.with(|db| {
        let campaign = db.get_campaign(id)?;
        if campaign.user_id != Some(user_id) {
            return Err(StoreError::NotFound);
        }
        db.list_send_queues_for_campaign(id)
    })?;
    Ok(Json(queues))
}

/// Manual "retry worker": hand the queue to the background worker again.
/// Accepts the owner's token or the service token.
async fn process_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<QueueId>,
) -> Result<(StatusCode, Json<ProcessResponse>), ServerError> {
    if auth::is_admin(&headers, &state.config) {
        state.db.with(|db| db.get_send_queue(id))?;
    } else {
        let token = auth::bearer_token(&headers).ok_or(ServerError::Unauthorized)?;
        let digest = auth::hash_token(token);
        let user_id = state
            .db
            .with(|db| db.user_for_token_hash(&digest))?
            .ok_or(ServerError::Unauthorized)?;
        owned_queue(&state, user_id, id)?;
    }

    state.dispatcher.worker().submit(id)?;
    info!(queue_id = %id, "Queue re-submitted to worker");

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessResponse {
            queue_id: id,
            submitted: true,
        }),
    ))
}

async fn queue_sends(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<QueueId>,
) -> Result<Json<Vec<EmailSend>>, ServerError> {
    owned_queue(&state, user_id, id)?;
    let sends = state.db.with(|db| db.list_email_sends(id))?;
    Ok(Json(sends))
}

/// Target of the footer link in every email. Safe to hit repeatedly.
async fn unsubscribe(
    State(state): State<AppState>,
    Query(query): Query<UnsubscribeQuery>,
) -> Result<Html<&'static str>, ServerError> {
    let email = query.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ServerError::BadRequest("invalid email".into()));
    }
    let campaign_id = match query.campaign.as_deref().filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            raw.parse::<CampaignId>()
                .map_err(|_| ServerError::BadRequest("invalid campaign id".into()))?,
        ),
        None => None,
    };

    // Scoped opt-outs stay in the registry. Only a global one marks contacts.
    let (added, contacts) = state.db.with(|db| {
        let added =
            db.add_unsubscribe(email, campaign_id, Some(UNSUBSCRIBE_REASON_USER_REQUEST))?;
        let contacts = match campaign_id {
            Some(_) => 0,
            None => db.set_contact_status_by_email(email, ContactStatus::Unsubscribed)?,
        };
        Ok((added, contacts))
    })?;

    if added {
        info!(
            campaign_id = ?campaign_id,
            contacts,
            "Recipient unsubscribed"
        );
    }

    Ok(Html(
        "<!doctype html><html><body style=\"font-family:sans-serif;text-align:center\">\
         <h2>You have been unsubscribed</h2>\
         <p>You will not receive further emails from this campaign.</p>\
         </body></html>",
    ))
}

/// Billing hook: add purchased credits to a user's ledger.
async fn admin_add_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdminCreditsRequest>,
) -> Result<Json<CreditBalance>, ServerError> {
    auth::verify_admin_token(&headers, &state.config)?;
    if req.paid_credits <= 0 {
        return Err(ServerError::BadRequest(
            "paid_credits must be positive".into(),
        ));
    }

    let balance = state.db.with(|db| {
        db.get_user(req.user_id)?;
        db.add_paid_credits(req.user_id, req.paid_credits)
    })?;

    info!(user = %req.user_id, added = req.paid_credits, total = balance.total, "Admin added credits");
    Ok(Json(balance))
}

async fn admin_issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdminTokenRequest>,
) -> Result<Json<AdminTokenResponse>, ServerError> {
    auth::verify_admin_token(&headers, &state.config)?;
    let token = state.db.with(|db| {
        db.get_user(req.user_id)?;
        auth::issue_token(db, req.user_id)
    })?;
    info!(user = %req.user_id, "Admin issued API token");
    Ok(Json(AdminTokenResponse { token }))
}

/// Every opt-out on file for one address.
async fn admin_list_unsubscribes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EmailQuery>,
) -> Result<Json<Vec<Unsubscribe>>, ServerError> {
    auth::verify_admin_token(&headers, &state.config)?;
    let entries = state.db.with(|db| db.list_unsubscribes(&query.email))?;
    Ok(Json(entries))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
