use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Booking, BookingService, BookingStatus};

/// One service line within a booking request. Windows are computed
/// server-side from the booking's scheduled start and the cumulative
/// durations of the preceding items.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BookingServiceInput {
    pub offering_id: Uuid,
    pub staff_id: Option<Uuid>,
    pub duration_minutes: i32,
    pub price: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateBookingRequest {
    pub provider_id: Uuid,
    pub scheduled_start_at: DateTime<Utc>,
    pub subtotal: i64,
    pub fees: i64,
    pub discounts: i64,
    pub total_amount: i64,
    pub currency: String,
    pub address: Option<String>,
    pub services: Vec<BookingServiceInput>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateBookingStatusRequest {
    pub status: BookingStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BookingWithServices {
    pub booking: Booking,
    pub services: Vec<BookingService>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BookingList {
    pub items: Vec<Booking>,
}
