use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::LoyaltyLedgerEntry;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreditPointsRequest {
    pub user_id: Uuid,
    pub reference_id: Uuid,
    pub reference_type: String,
    pub transaction_type: String,
    pub points: i64,
}

/// Outcome of a credit attempt. `already_credited` means the idempotency
/// guard found an existing row for the same key; no new row was written.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreditOutcome {
    pub entry: Option<LoyaltyLedgerEntry>,
    pub already_credited: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LedgerSummary {
    pub entries: Vec<LoyaltyLedgerEntry>,
    pub balance: i64,
}
