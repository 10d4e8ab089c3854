pub mod analytics;
pub mod leave_request;
pub mod role;
pub mod task;
pub mod toast;
pub mod user;
