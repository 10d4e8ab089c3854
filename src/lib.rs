//! Client-side state for the employee portal: who is signed in, their tasks,
//! their leave requests, and transient notifications.

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod models;
pub mod routes;
pub mod utils;

pub use api::leave_request::LeaveManager;
pub use api::task::TaskManager;
pub use auth::session::Session;
pub use error::{PortalError, PortalResult};
pub use utils::toast::ToastQueue;
