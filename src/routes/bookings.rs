use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, patch},
};
use uuid::Uuid;

use crate::{
    dto::bookings::{
        BookingList, BookingWithServices, CreateBookingRequest, UpdateBookingStatusRequest,
    },
    error::AppResult,
    middleware::auth::AuthUser,
    models::Booking,
    response::ApiResponse,
    routes::params::BookingListQuery,
    services::booking_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_bookings).post(create_booking))
        .route("/{id}", get(get_booking))
        .route("/{id}/status", patch(update_booking_status))
}

#[utoipa::path(
    post,
    path = "/api/bookings",
    request_body = CreateBookingRequest,
    responses(
        (status = 200, description = "Booking created", body = ApiResponse<BookingWithServices>),
        (status = 400, description = "Invalid booking payload"),
        (status = 409, description = "Requested staff/time window is already taken")
    ),
    tag = "Bookings"
)]
pub async fn create_booking(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateBookingRequest>,
) -> AppResult<Json<ApiResponse<BookingWithServices>>> {
    let resp = booking_service::create_booking(&state, &user, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/api/bookings",
    responses(
        (status = 200, description = "List bookings", body = ApiResponse<BookingList>)
    ),
    tag = "Bookings"
)]
pub async fn list_bookings(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<BookingListQuery>,
) -> AppResult<Json<ApiResponse<BookingList>>> {
    let resp = booking_service::list_bookings(&state, &user, query).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/api/bookings/{id}",
    responses(
        (status = 200, description = "Booking with services", body = ApiResponse<BookingWithServices>),
        (status = 404, description = "Unknown booking")
    ),
    tag = "Bookings"
)]
pub async fn get_booking(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<BookingWithServices>>> {
    let resp = booking_service::get_booking(&state, &user, id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    patch,
    path = "/api/bookings/{id}/status",
    request_body = UpdateBookingStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<Booking>),
        (status = 400, description = "Transition not allowed"),
        (status = 404, description = "Unknown booking")
    ),
    tag = "Bookings"
)]
pub async fn update_booking_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateBookingStatusRequest>,
) -> AppResult<Json<ApiResponse<Booking>>> {
    let resp = booking_service::update_booking_status(&state, &user, id, payload).await?;
    Ok(Json(resp))
}
