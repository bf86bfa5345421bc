use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, SqlErr};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    dto::loyalty::{CreditOutcome, CreditPointsRequest, LedgerSummary},
    entity::loyalty_ledger_entries::{
        ActiveModel as EntryActive, Column as EntryCol, Entity as LedgerEntries,
        Model as EntryModel,
    },
    error::{AppError, AppResult},
    models::LoyaltyLedgerEntry,
    response::{ApiResponse, Meta},
    state::AppState,
};

pub const REFERENCE_TYPE_BOOKING: &str = "booking";
pub const TRANSACTION_TYPE_EARNED: &str = "earned";

/// Points earned for a completed booking: one point per whole currency unit
/// of the total (amounts are stored in minor units).
pub fn points_for_total(total_amount: i64) -> i64 {
    total_amount / 100
}

/// Attempts to write a ledger entry. The unique index over
/// (user_id, reference_id, reference_type, transaction_type) is the
/// concurrency control: a duplicate attempt fails at the storage layer and
/// is reported as an already-credited no-op, never as an error.
pub async fn credit_points(state: &AppState, payload: CreditPointsRequest) -> AppResult<CreditOutcome> {
    if payload.points == 0 {
        return Err(AppError::BadRequest("Points must be nonzero".into()));
    }
    if payload.reference_type.trim().is_empty() || payload.transaction_type.trim().is_empty() {
        return Err(AppError::BadRequest(
            "Reference and transaction types are required".into(),
        ));
    }

    let attempt = EntryActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(payload.user_id),
        reference_id: Set(payload.reference_id),
        reference_type: Set(payload.reference_type.clone()),
        transaction_type: Set(payload.transaction_type.clone()),
        points: Set(payload.points),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await;

    match attempt {
        Ok(entry) => Ok(CreditOutcome {
            entry: Some(entry_from_entity(entry)),
            already_credited: false,
        }),
        Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            tracing::debug!(
                user_id = %payload.user_id,
                reference_id = %payload.reference_id,
                "duplicate ledger credit absorbed"
            );
            Ok(CreditOutcome {
                entry: None,
                already_credited: true,
            })
        }
        Err(err) => Err(err.into()),
    }
}

/// Side effect of a completed booking. Zero-point totals are skipped.
pub async fn credit_booking_completion(
    state: &AppState,
    customer_id: Uuid,
    booking_id: Uuid,
    total_amount: i64,
) -> AppResult<CreditOutcome> {
    let points = points_for_total(total_amount);
    if points == 0 {
        return Ok(CreditOutcome {
            entry: None,
            already_credited: false,
        });
    }
    credit_points(
        state,
        CreditPointsRequest {
            user_id: customer_id,
            reference_id: booking_id,
            reference_type: REFERENCE_TYPE_BOOKING.into(),
            transaction_type: TRANSACTION_TYPE_EARNED.into(),
            points,
        },
    )
    .await
}

pub async fn ledger_summary(
    state: &AppState,
    user_id: Uuid,
) -> AppResult<ApiResponse<LedgerSummary>> {
    let entries: Vec<LoyaltyLedgerEntry> = LedgerEntries::find()
        .filter(EntryCol::UserId.eq(user_id))
        .order_by_desc(EntryCol::CreatedAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(entry_from_entity)
        .collect();

    let balance = entries.iter().map(|e| e.points).sum();

    Ok(ApiResponse::success(
        "Ok",
        LedgerSummary { entries, balance },
        Some(Meta::empty()),
    ))
}

fn entry_from_entity(model: EntryModel) -> LoyaltyLedgerEntry {
    LoyaltyLedgerEntry {
        id: model.id,
        user_id: model.user_id,
        reference_id: model.reference_id,
        reference_type: model.reference_type,
        transaction_type: model.transaction_type,
        points: model.points,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

#[cfg(test)]
mod tests {
    use super::points_for_total;

    #[test]
    fn points_are_whole_currency_units() {
        assert_eq!(points_for_total(5500), 55);
        assert_eq!(points_for_total(99), 0);
        assert_eq!(points_for_total(0), 0);
    }
}
