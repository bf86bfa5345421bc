use chrono::{DateTime, Duration, Utc};
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseTransaction, EntityTrait,
    JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set, Statement,
    TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::bookings::{
        BookingList, BookingServiceInput, BookingWithServices, CreateBookingRequest,
        UpdateBookingStatusRequest,
    },
    entity::{
        booking_services::{
            ActiveModel as ServiceActive, Column as ServiceCol, Entity as BookingServices,
            Model as ServiceModel, Relation as ServiceRel,
        },
        bookings::{
            ActiveModel as BookingActive, Column as BookingCol, Entity as Bookings,
            Model as BookingModel,
        },
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Booking, BookingService, BookingStatus},
    response::{ApiResponse, Meta},
    routes::params::{BookingListQuery, SortOrder},
    services::loyalty_service,
    state::AppState,
};

/// Statuses whose bookings no longer occupy their time windows.
const SLOT_RELEASING_STATUSES: [&str; 2] = ["cancelled", "no_show"];

pub async fn create_booking(
    state: &AppState,
    user: &AuthUser,
    payload: CreateBookingRequest,
) -> AppResult<ApiResponse<BookingWithServices>> {
    validate_request(&payload)?;

    let windows = compute_service_windows(payload.scheduled_start_at, &payload.services);
    let end_at = windows
        .last()
        .map(|(_, end)| *end)
        .ok_or_else(|| AppError::BadRequest("Booking needs at least one service".into()))?;

    // Walk-in bookings created by the provider start out confirmed;
    // customer checkouts start pending.
    let initial_status = if user.role == "provider" && user.user_id == payload.provider_id {
        BookingStatus::Confirmed
    } else {
        BookingStatus::Pending
    };

    let txn = state.orm.begin().await?;

    // Serialize concurrent creations per staff member. A FOR UPDATE over an
    // empty conflict set locks nothing, so without this two transactions
    // could both count zero conflicts and both insert overlapping windows.
    // Sorted order keeps multi-staff requests deadlock-free.
    let mut staff_ids: Vec<Uuid> = payload
        .services
        .iter()
        .filter_map(|s| s.staff_id)
        .collect();
    staff_ids.sort();
    staff_ids.dedup();
    for staff_id in &staff_ids {
        lock_staff_schedule(&txn, *staff_id).await?;
    }

    for (service, (start_at, item_end_at)) in payload.services.iter().zip(&windows) {
        let Some(staff_id) = service.staff_id else {
            // Unassigned services are not staff-bound and skip the check.
            continue;
        };
        let conflicts = count_conflicts(&txn, staff_id, *start_at, *item_end_at).await?;
        if conflicts > 0 {
            tracing::debug!(
                staff_id = %staff_id,
                start_at = %start_at,
                end_at = %item_end_at,
                conflicts,
                "slot conflict, aborting booking creation"
            );
            return Err(AppError::SlotConflict);
        }
    }

    let booking_id = Uuid::new_v4();
    let booking = BookingActive {
        id: Set(booking_id),
        customer_id: Set(user.user_id),
        provider_id: Set(payload.provider_id),
        status: Set(initial_status.as_str().into()),
        scheduled_start_at: Set(payload.scheduled_start_at.into()),
        end_at: Set(end_at.into()),
        subtotal: Set(payload.subtotal),
        fees: Set(payload.fees),
        discounts: Set(payload.discounts),
        total_amount: Set(payload.total_amount),
        currency: Set(payload.currency.clone()),
        address: Set(payload.address.clone()),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut services: Vec<BookingService> = Vec::with_capacity(payload.services.len());
    for (service, (start_at, item_end_at)) in payload.services.iter().zip(&windows) {
        let row = ServiceActive {
            id: Set(Uuid::new_v4()),
            booking_id: Set(booking.id),
            offering_id: Set(service.offering_id),
            staff_id: Set(service.staff_id),
            duration_minutes: Set(service.duration_minutes),
            price: Set(service.price),
            currency: Set(payload.currency.clone()),
            start_at: Set((*start_at).into()),
            end_at: Set((*item_end_at).into()),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        services.push(service_from_entity(row));
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "booking_created",
        Some("bookings"),
        Some(serde_json::json!({ "booking_id": booking.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Booking created",
        BookingWithServices {
            booking: booking_from_entity(booking)?,
            services,
        },
        Some(Meta::empty()),
    ))
}

/// Takes a transaction-scoped advisory lock keyed by the staff id. Released
/// automatically at commit or rollback.
async fn lock_staff_schedule(txn: &DatabaseTransaction, staff_id: Uuid) -> AppResult<()> {
    txn.execute(Statement::from_sql_and_values(
        txn.get_database_backend(),
        "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))",
        [staff_id.to_string().into()],
    ))
    .await?;
    Ok(())
}

/// Locks and counts existing active booking-service rows for `staff_id`
/// overlapping `[start_at, end_at)`. Half-open comparison: touching
/// endpoints do not conflict.
async fn count_conflicts(
    txn: &DatabaseTransaction,
    staff_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
) -> AppResult<usize> {
    // FOR UPDATE is incompatible with COUNT(*), so fetch the rows and count
    // in-process; the locked rows block concurrent writers until we resolve.
    let conflicting: Vec<ServiceModel> = BookingServices::find()
        .join(JoinType::InnerJoin, ServiceRel::Bookings.def())
        .filter(
            Condition::all()
                .add(ServiceCol::StaffId.eq(staff_id))
                .add(ServiceCol::StartAt.lt(end_at))
                .add(ServiceCol::EndAt.gt(start_at))
                .add(BookingCol::Status.is_not_in(SLOT_RELEASING_STATUSES)),
        )
        .lock(LockType::Update)
        .all(txn)
        .await?;
    Ok(conflicting.len())
}

pub async fn list_bookings(
    state: &AppState,
    user: &AuthUser,
    query: BookingListQuery,
) -> AppResult<ApiResponse<BookingList>> {
    let (page, limit, offset) = query.pagination.normalize();

    let owner_filter = if user.role == "provider" {
        BookingCol::ProviderId.eq(user.user_id)
    } else {
        BookingCol::CustomerId.eq(user.user_id)
    };
    let mut condition = Condition::all().add(owner_filter);
    if let Some(status) = query.status {
        condition = condition.add(BookingCol::Status.eq(status.as_str()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Bookings::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(BookingCol::ScheduledStartAt),
        SortOrder::Desc => finder.order_by_desc(BookingCol::ScheduledStartAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let bookings = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(booking_from_entity)
        .collect::<AppResult<Vec<Booking>>>()?;

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Ok",
        BookingList { items: bookings },
        Some(meta),
    ))
}

pub async fn get_booking(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<BookingWithServices>> {
    let booking = Bookings::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    ensure_booking_access(user, &booking)?;

    let services = BookingServices::find()
        .filter(ServiceCol::BookingId.eq(booking.id))
        .order_by_asc(ServiceCol::StartAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(service_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "Ok",
        BookingWithServices {
            booking: booking_from_entity(booking)?,
            services,
        },
        Some(Meta::empty()),
    ))
}

pub async fn update_booking_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateBookingStatusRequest,
) -> AppResult<ApiResponse<Booking>> {
    let txn = state.orm.begin().await?;

    let booking = Bookings::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    ensure_booking_access(user, &booking)?;

    let current = BookingStatus::parse(&booking.status)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown booking status")))?;
    let next = payload.status;

    // Customers may only cancel; the operational transitions belong to the
    // provider side (and admins).
    if user.role == "customer" && next != BookingStatus::Cancelled {
        return Err(AppError::Forbidden);
    }
    if !current.can_transition_to(next) {
        return Err(AppError::BadRequest(format!(
            "Cannot transition booking from {} to {}",
            current.as_str(),
            next.as_str()
        )));
    }

    let mut active: BookingActive = booking.into();
    active.status = Set(next.as_str().into());
    active.updated_at = Set(Utc::now().into());
    let booking = active.update(&txn).await?;

    txn.commit().await?;

    if next == BookingStatus::Completed {
        // At-most-once even when the completion event is replayed; the
        // ledger's unique index absorbs duplicates.
        if let Err(err) = loyalty_service::credit_booking_completion(
            state,
            booking.customer_id,
            booking.id,
            booking.total_amount,
        )
        .await
        {
            tracing::warn!(error = %err, booking_id = %booking.id, "loyalty credit failed");
        }
    }

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "booking_status_changed",
        Some("bookings"),
        Some(serde_json::json!({ "booking_id": booking.id, "status": next.as_str() })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Booking updated",
        booking_from_entity(booking)?,
        Some(Meta::empty()),
    ))
}

fn ensure_booking_access(user: &AuthUser, booking: &BookingModel) -> AppResult<()> {
    let is_party = booking.customer_id == user.user_id || booking.provider_id == user.user_id;
    if !is_party && user.role != "admin" {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

fn validate_request(payload: &CreateBookingRequest) -> AppResult<()> {
    if payload.services.is_empty() {
        return Err(AppError::BadRequest(
            "Booking needs at least one service".into(),
        ));
    }
    for service in &payload.services {
        if service.duration_minutes <= 0 {
            return Err(AppError::BadRequest(
                "Service duration must be positive".into(),
            ));
        }
        if service.price < 0 {
            return Err(AppError::BadRequest("Service price cannot be negative".into()));
        }
    }
    for (name, amount) in [
        ("subtotal", payload.subtotal),
        ("fees", payload.fees),
        ("discounts", payload.discounts),
        ("total_amount", payload.total_amount),
    ] {
        if amount < 0 {
            return Err(AppError::BadRequest(format!("{name} cannot be negative")));
        }
    }
    if payload.currency.trim().is_empty() {
        return Err(AppError::BadRequest("Currency is required".into()));
    }
    Ok(())
}

/// Each service starts where the previous one ends, beginning at the
/// booking's scheduled start.
fn compute_service_windows(
    scheduled_start_at: DateTime<Utc>,
    services: &[BookingServiceInput],
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::with_capacity(services.len());
    let mut cursor = scheduled_start_at;
    for service in services {
        let end = cursor + Duration::minutes(service.duration_minutes as i64);
        windows.push((cursor, end));
        cursor = end;
    }
    windows
}

fn booking_from_entity(model: BookingModel) -> AppResult<Booking> {
    let status = BookingStatus::parse(&model.status)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown booking status")))?;
    Ok(Booking {
        id: model.id,
        customer_id: model.customer_id,
        provider_id: model.provider_id,
        status,
        scheduled_start_at: model.scheduled_start_at.with_timezone(&Utc),
        end_at: model.end_at.with_timezone(&Utc),
        subtotal: model.subtotal,
        fees: model.fees,
        discounts: model.discounts,
        total_amount: model.total_amount,
        currency: model.currency,
        address: model.address,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}

fn service_from_entity(model: ServiceModel) -> BookingService {
    BookingService {
        id: model.id,
        booking_id: model.booking_id,
        offering_id: model.offering_id,
        staff_id: model.staff_id,
        duration_minutes: model.duration_minutes,
        price: model.price,
        currency: model.currency,
        start_at: model.start_at.with_timezone(&Utc),
        end_at: model.end_at.with_timezone(&Utc),
        created_at: model.created_at.with_timezone(&Utc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn input(duration_minutes: i32) -> BookingServiceInput {
        BookingServiceInput {
            offering_id: Uuid::new_v4(),
            staff_id: Some(Uuid::new_v4()),
            duration_minutes,
            price: 5000,
        }
    }

    fn request(services: Vec<BookingServiceInput>) -> CreateBookingRequest {
        CreateBookingRequest {
            provider_id: Uuid::new_v4(),
            scheduled_start_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            subtotal: 5000,
            fees: 500,
            discounts: 0,
            total_amount: 5500,
            currency: "AUD".into(),
            address: None,
            services,
        }
    }

    #[test]
    fn windows_are_cumulative_and_back_to_back() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let windows = compute_service_windows(start, &[input(30), input(45), input(15)]);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].0, start);
        assert_eq!(windows[0].1, start + Duration::minutes(30));
        // Each item begins exactly where the previous one ends.
        assert_eq!(windows[1].0, windows[0].1);
        assert_eq!(windows[2].0, windows[1].1);
        assert_eq!(windows[2].1, start + Duration::minutes(90));
    }

    #[test]
    fn rejects_empty_service_list() {
        let err = validate_request(&request(vec![])).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn rejects_non_positive_duration() {
        let err = validate_request(&request(vec![input(0)])).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn rejects_negative_money() {
        let mut req = request(vec![input(30)]);
        req.discounts = -100;
        let err = validate_request(&req).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let mut req = request(vec![input(30)]);
        req.services[0].price = -1;
        let err = validate_request(&req).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn accepts_well_formed_request() {
        assert!(validate_request(&request(vec![input(30), input(60)])).is_ok());
    }
}
