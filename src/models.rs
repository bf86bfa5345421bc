use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// Booking lifecycle states. Stored as snake_case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    Started,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Started => "started",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "checked_in" => Some(BookingStatus::CheckedIn),
            "started" => Some(BookingStatus::Started),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "no_show" => Some(BookingStatus::NoShow),
            _ => None,
        }
    }

    /// Cancelled and no-show bookings release their time windows; every
    /// other state keeps the staff slot occupied.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::NoShow)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (*self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, CheckedIn)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (CheckedIn, Started)
                | (CheckedIn, Cancelled)
                | (Started, Completed)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub status: BookingStatus,
    pub scheduled_start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub subtotal: i64,
    pub fees: i64,
    pub discounts: i64,
    pub total_amount: i64,
    pub currency: String,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BookingService {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub offering_id: Uuid,
    pub staff_id: Option<Uuid>,
    pub duration_minutes: i32,
    pub price: i64,
    pub currency: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoyaltyLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reference_id: Uuid,
    pub reference_type: String,
    pub transaction_type: String,
    pub points: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::BookingStatus;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::CheckedIn,
            BookingStatus::Started,
            BookingStatus::Completed,
            BookingStatus::Cancelled,
            BookingStatus::NoShow,
        ] {
            assert_eq!(BookingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BookingStatus::parse("paid"), None);
    }

    #[test]
    fn cancelled_and_no_show_release_the_slot() {
        assert!(!BookingStatus::Cancelled.occupies_slot());
        assert!(!BookingStatus::NoShow.occupies_slot());
        assert!(BookingStatus::Pending.occupies_slot());
        assert!(BookingStatus::Completed.occupies_slot());
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(CheckedIn));
        assert!(CheckedIn.can_transition_to(Started));
        assert!(Started.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(NoShow));

        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Started.can_transition_to(Cancelled));
    }
}
