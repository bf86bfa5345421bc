pub mod audit_logs;
pub mod booking_services;
pub mod bookings;
pub mod loyalty_ledger_entries;
pub mod users;

pub use audit_logs::Entity as AuditLogs;
pub use booking_services::Entity as BookingServices;
pub use bookings::Entity as Bookings;
pub use loyalty_ledger_entries::Entity as LoyaltyLedgerEntries;
pub use users::Entity as Users;
