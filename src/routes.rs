use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tokio::sync::watch;
use tracing::debug;

use crate::utils::signal::Signal;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Display, AsRefStr)]
pub enum Route {
    #[default]
    #[strum(serialize = "/login")]
    Login,
    #[strum(serialize = "/signup")]
    Signup,
    #[strum(serialize = "/dashboard")]
    Dashboard,
    #[strum(serialize = "/tasks")]
    Tasks,
    #[strum(serialize = "/leaves")]
    Leaves,
}

impl Route {
    /// Where a successful sign-in lands.
    pub const LANDING: Route = Route::Dashboard;
}

/// Current screen. Navigation goes through a watch channel, so every view
/// subscribed to it wakes up no matter which task requested the change.
#[derive(Debug, Default)]
pub struct Navigator {
    current: Signal<Route>,
}

impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn navigate(&self, route: Route) {
        debug!(route = %route, "Navigate");
        self.current.set(route);
    }

    pub fn current(&self) -> Route {
        self.current.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Route> {
        self.current.subscribe()
    }
}
