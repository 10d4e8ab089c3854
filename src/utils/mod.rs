pub mod in_flight;
pub mod signal;
pub mod toast;
