use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};

use crate::{
    dto::loyalty::{CreditOutcome, CreditPointsRequest, LedgerSummary},
    error::AppResult,
    middleware::auth::{AuthUser, ensure_admin},
    response::{ApiResponse, Meta},
    services::loyalty_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/credits", post(credit_points))
        .route("/me", get(my_ledger))
}

#[utoipa::path(
    post,
    path = "/api/loyalty/credits",
    request_body = CreditPointsRequest,
    responses(
        (status = 200, description = "Credit applied (or already applied)", body = ApiResponse<CreditOutcome>),
        (status = 403, description = "Admin only")
    ),
    tag = "Loyalty"
)]
pub async fn credit_points(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreditPointsRequest>,
) -> AppResult<Json<ApiResponse<CreditOutcome>>> {
    ensure_admin(&user)?;
    let outcome = loyalty_service::credit_points(&state, payload).await?;
    let message = if outcome.already_credited {
        "Already credited"
    } else {
        "Points credited"
    };
    Ok(Json(ApiResponse::success(
        message,
        outcome,
        Some(Meta::empty()),
    )))
}

#[utoipa::path(
    get,
    path = "/api/loyalty/me",
    responses(
        (status = 200, description = "Ledger entries and balance", body = ApiResponse<LedgerSummary>)
    ),
    tag = "Loyalty"
)]
pub async fn my_ledger(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<LedgerSummary>>> {
    let resp = loyalty_service::ledger_summary(&state, user.user_id).await?;
    Ok(Json(resp))
}
