//! Seam to the hosted auth + table service.
//!
//! Managers only talk to [`Backend`]; `rest` speaks the real wire protocol and
//! the in-memory variant backs the unit tests.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{PortalError, PortalResult};
use crate::models::{AuthEvent, AuthIdentity, AuthSession, Credentials};

pub mod query;
pub mod rest;

#[cfg(test)]
pub(crate) mod memory;

pub use query::{FilterValue, Order, Query};

pub mod tables {
    pub const PROFILES: &str = "profiles";
    pub const TASKS: &str = "tasks";
    pub const LEAVES: &str = "leaves";
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Current session, renewed first if it has expired.
    async fn get_session(&self) -> PortalResult<Option<AuthSession>>;

    /// Creates a credential. `None` when the provider accepted the request but
    /// returned no identity.
    async fn sign_up(&self, credentials: &Credentials) -> PortalResult<Option<AuthIdentity>>;

    async fn sign_in_with_password(&self, credentials: &Credentials) -> PortalResult<AuthSession>;

    async fn sign_out(&self) -> PortalResult<()>;

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent>;
}

#[async_trait]
pub trait TableApi: Send + Sync {
    async fn select(&self, query: &Query) -> PortalResult<Vec<Value>>;

    /// Inserts one row and returns it as stored.
    async fn insert(&self, table: &str, row: Value) -> PortalResult<Value>;

    /// Patches the rows matched by `query`; `None` when nothing matched.
    async fn update(&self, query: &Query, patch: Value) -> PortalResult<Option<Value>>;

    async fn delete(&self, query: &Query) -> PortalResult<()>;
}

pub trait Backend: AuthApi + TableApi {}

impl<T: AuthApi + TableApi> Backend for T {}

pub fn encode<T: Serialize>(entity: &'static str, value: &T) -> PortalResult<Value> {
    serde_json::to_value(value).map_err(|e| PortalError::decode(entity, e))
}

pub fn decode_row<T: DeserializeOwned>(entity: &'static str, row: Value) -> PortalResult<T> {
    serde_json::from_value(row).map_err(|e| PortalError::decode(entity, e))
}

pub fn decode_rows<T: DeserializeOwned>(entity: &'static str, rows: Vec<Value>) -> PortalResult<Vec<T>> {
    rows.into_iter().map(|row| decode_row(entity, row)).collect()
}
