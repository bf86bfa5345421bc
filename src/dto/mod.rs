pub mod auth;
pub mod bookings;
pub mod loyalty;
