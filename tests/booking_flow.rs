use beautonomi_booking_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::bookings::{BookingServiceInput, CreateBookingRequest, UpdateBookingStatusRequest},
    entity::{
        booking_services::{Column as ServiceCol, Relation as ServiceRel},
        bookings::Column as BookingCol,
        loyalty_ledger_entries::Column as EntryCol,
        users::ActiveModel as UserActive,
        BookingServices, Bookings, LoyaltyLedgerEntries,
    },
    error::AppError,
    middleware::auth::AuthUser,
    models::BookingStatus,
    services::{booking_service, loyalty_service},
    state::AppState,
};
use chrono::{DateTime, TimeZone, Utc};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, JoinType, PaginatorTrait, QueryFilter,
    QuerySelect, RelationTrait, Set,
};
use uuid::Uuid;

// Integration flow: slot conflicts, the booking lifecycle, and the loyalty
// idempotency guard, end to end against a real database.
#[tokio::test]
async fn booking_conflict_and_lifecycle_flow() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let provider_id = create_user(&state, "provider", "provider@example.com").await?;
    let customer_id = create_user(&state, "customer", "customer@example.com").await?;
    let staff_id = Uuid::new_v4();

    let customer = AuthUser {
        user_id: customer_id,
        role: "customer".into(),
    };
    let provider = AuthUser {
        user_id: provider_id,
        role: "provider".into(),
    };

    let ten = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
    let eleven = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();

    // Customer books 10:00-11:00 with a specific staff member.
    let first = booking_service::create_booking(
        &state,
        &customer,
        request(provider_id, ten, vec![service(Some(staff_id), 60)]),
    )
    .await?
    .data
    .unwrap();
    assert_eq!(first.booking.status, BookingStatus::Pending);
    assert_eq!(first.booking.end_at, eleven);
    assert_eq!(first.services.len(), 1);
    assert_eq!(first.services[0].start_at, ten);
    assert_eq!(first.services[0].end_at, eleven);

    // A one-minute overlap (10:59-11:29) must be rejected...
    let overlap_start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 59, 0).unwrap();
    let second_customer = create_user(&state, "customer", "customer2@example.com").await?;
    let customer2 = AuthUser {
        user_id: second_customer,
        role: "customer".into(),
    };
    let err = booking_service::create_booking(
        &state,
        &customer2,
        request(provider_id, overlap_start, vec![service(Some(staff_id), 30)]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::SlotConflict));

    // ...and must leave no rows behind (no orphan header, no orphan items).
    let headers = Bookings::find()
        .filter(BookingCol::CustomerId.eq(second_customer))
        .count(&state.orm)
        .await?;
    assert_eq!(headers, 0, "failed creation must not persist a booking header");

    // Touching windows do not conflict: 11:00-11:30 right after 10:00-11:00.
    let touching = booking_service::create_booking(
        &state,
        &customer2,
        request(provider_id, eleven, vec![service(Some(staff_id), 30)]),
    )
    .await?
    .data
    .unwrap();
    assert_eq!(touching.booking.scheduled_start_at, eleven);

    // Unassigned-staff bookings never conflict, even fully overlapped.
    for email in ["walkin1@example.com", "walkin2@example.com"] {
        let id = create_user(&state, "customer", email).await?;
        let user = AuthUser {
            user_id: id,
            role: "customer".into(),
        };
        booking_service::create_booking(
            &state,
            &user,
            request(provider_id, ten, vec![service(None, 60)]),
        )
        .await?;
    }

    // Cancelling the first booking releases its window for rebooking.
    booking_service::update_booking_status(
        &state,
        &customer,
        first.booking.id,
        UpdateBookingStatusRequest {
            status: BookingStatus::Cancelled,
        },
    )
    .await?;
    let rebooked = booking_service::create_booking(
        &state,
        &customer2,
        request(provider_id, ten, vec![service(Some(staff_id), 60)]),
    )
    .await?
    .data
    .unwrap();

    // Active windows for the staff member stay pairwise non-overlapping.
    let windows: Vec<(DateTime<Utc>, DateTime<Utc>)> = BookingServices::find()
        .join(JoinType::InnerJoin, ServiceRel::Bookings.def())
        .filter(ServiceCol::StaffId.eq(staff_id))
        .filter(BookingCol::Status.is_not_in(["cancelled", "no_show"]))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(|s| (s.start_at.with_timezone(&Utc), s.end_at.with_timezone(&Utc)))
        .collect();
    for (i, a) in windows.iter().enumerate() {
        for b in windows.iter().skip(i + 1) {
            assert!(
                a.1 <= b.0 || b.1 <= a.0,
                "active windows overlap: {a:?} vs {b:?}"
            );
        }
    }

    // Provider drives the rebooked booking through its lifecycle; completion
    // credits loyalty points exactly once.
    for status in [
        BookingStatus::Confirmed,
        BookingStatus::CheckedIn,
        BookingStatus::Started,
        BookingStatus::Completed,
    ] {
        booking_service::update_booking_status(
            &state,
            &provider,
            rebooked.booking.id,
            UpdateBookingStatusRequest { status },
        )
        .await?;
    }

    let credited = LoyaltyLedgerEntries::find()
        .filter(EntryCol::UserId.eq(second_customer))
        .filter(EntryCol::ReferenceId.eq(rebooked.booking.id))
        .count(&state.orm)
        .await?;
    assert_eq!(credited, 1);

    // Replaying the completion event is absorbed by the idempotency guard.
    let outcome = loyalty_service::credit_booking_completion(
        &state,
        second_customer,
        rebooked.booking.id,
        rebooked.booking.total_amount,
    )
    .await?;
    assert!(outcome.already_credited);
    assert!(outcome.entry.is_none());

    let credited = LoyaltyLedgerEntries::find()
        .filter(EntryCol::UserId.eq(second_customer))
        .filter(EntryCol::ReferenceId.eq(rebooked.booking.id))
        .count(&state.orm)
        .await?;
    assert_eq!(credited, 1, "duplicate credit must not add a ledger row");

    Ok(())
}

// Two concurrent creations for the same staff member and overlapping windows:
// exactly one succeeds and the other sees a slot conflict.
#[tokio::test]
async fn concurrent_overlapping_creations_resolve_to_one() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let provider_id = create_user(&state, "provider", "race-provider@example.com").await?;
    let staff_id = Uuid::new_v4();
    let start = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();

    let a = create_user(&state, "customer", "race-a@example.com").await?;
    let b = create_user(&state, "customer", "race-b@example.com").await?;
    let user_a = AuthUser {
        user_id: a,
        role: "customer".into(),
    };
    let user_b = AuthUser {
        user_id: b,
        role: "customer".into(),
    };

    let state_a = state.clone();
    let state_b = state.clone();
    let (first, second) = tokio::join!(
        booking_service::create_booking(
            &state_a,
            &user_a,
            request(provider_id, start, vec![service(Some(staff_id), 45)]),
        ),
        booking_service::create_booking(
            &state_b,
            &user_b,
            request(provider_id, start, vec![service(Some(staff_id), 45)]),
        ),
    );

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one of the two racers may win the slot");

    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(loser.unwrap_err(), AppError::SlotConflict));

    let windows = BookingServices::find()
        .filter(ServiceCol::StaffId.eq(staff_id))
        .count(&state.orm)
        .await?;
    assert_eq!(windows, 1);

    Ok(())
}

fn service(staff_id: Option<Uuid>, duration_minutes: i32) -> BookingServiceInput {
    BookingServiceInput {
        offering_id: Uuid::new_v4(),
        staff_id,
        duration_minutes,
        price: 4500,
    }
}

fn request(
    provider_id: Uuid,
    scheduled_start_at: DateTime<Utc>,
    services: Vec<BookingServiceInput>,
) -> CreateBookingRequest {
    CreateBookingRequest {
        provider_id,
        scheduled_start_at,
        subtotal: 4500,
        fees: 500,
        discounts: 0,
        total_amount: 5000,
        currency: "AUD".into(),
        address: Some("1 Example St".into()),
        services,
    }
}

async fn setup_state() -> anyhow::Result<Option<AppState>> {
    // Allow skipping when no DB is configured in the environment.
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    let orm = create_orm_conn(&database_url).await?;
    run_migrations(&orm).await?;

    Ok(Some(AppState { pool, orm }))
}

// Emails are suffixed with a fresh id so parallel tests and repeated runs
// never collide on the unique index.
async fn create_user(state: &AppState, role: &str, email: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(format!("{}-{}", Uuid::new_v4(), email)),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(user.id)
}
