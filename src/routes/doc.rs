use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{LoginRequest, LoginResponse, RegisterRequest},
        bookings::{
            BookingList, BookingServiceInput, BookingWithServices, CreateBookingRequest,
            UpdateBookingStatusRequest,
        },
        loyalty::{CreditOutcome, CreditPointsRequest, LedgerSummary},
    },
    models::{Booking, BookingService, BookingStatus, LoyaltyLedgerEntry, User},
    response::{ApiResponse, Meta},
    routes::{auth, bookings, health, loyalty, params},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::register,
        auth::login,
        bookings::create_booking,
        bookings::list_bookings,
        bookings::get_booking,
        bookings::update_booking_status,
        loyalty::credit_points,
        loyalty::my_ledger
    ),
    components(
        schemas(
            User,
            Booking,
            BookingService,
            BookingStatus,
            LoyaltyLedgerEntry,
            RegisterRequest,
            LoginRequest,
            LoginResponse,
            CreateBookingRequest,
            BookingServiceInput,
            UpdateBookingStatusRequest,
            BookingWithServices,
            BookingList,
            CreditPointsRequest,
            CreditOutcome,
            LedgerSummary,
            params::Pagination,
            params::SortOrder,
            params::BookingListQuery,
            Meta,
            ApiResponse<BookingWithServices>,
            ApiResponse<BookingList>,
            ApiResponse<LedgerSummary>,
            ApiResponse<CreditOutcome>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Bookings", description = "Booking creation and lifecycle"),
        (name = "Loyalty", description = "Loyalty ledger endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
