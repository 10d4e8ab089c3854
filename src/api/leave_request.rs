use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::session::Session;
use crate::backend::{self, Backend, Order, Query, tables};
use crate::error::{PortalError, PortalResult};
use crate::model::analytics::LeaveStats;
use crate::model::leave_request::{Leave, LeaveStatus, LeaveUpdate, NewLeave};
use crate::utils::in_flight::InFlight;
use crate::utils::signal::Signal;

#[derive(Serialize)]
struct LeaveInsert<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    fields: &'a NewLeave,
    status: LeaveStatus,
}

/// Cached leave requests, with the requester's name joined in.
pub struct LeaveManager {
    backend: Arc<dyn Backend>,
    session: Arc<Session>,
    leaves: Signal<Vec<Leave>>,
    loading: InFlight,
}

impl LeaveManager {
    pub fn new(backend: Arc<dyn Backend>, session: Arc<Session>) -> Self {
        Self {
            backend,
            session,
            leaves: Signal::new(Vec::new()),
            loading: InFlight::new(),
        }
    }

    pub async fn load_leaves(&self) {
        let _loading = self.loading.enter();

        match self.fetch_leaves().await {
            Ok(leaves) => {
                debug!(count = leaves.len(), "Leaves loaded");
                self.leaves.set(leaves);
            }
            Err(PortalError::NotAuthenticated) => {
                warn!("Skipping leave load: user not logged in");
            }
            Err(e) => error!(error = %e, "Error loading leaves"),
        }
    }

    async fn fetch_leaves(&self) -> PortalResult<Vec<Leave>> {
        let user = self.session.current_user().ok_or(PortalError::NotAuthenticated)?;

        let mut query = Query::table(tables::LEAVES)
            .select("*")
            .embed("profile", tables::PROFILES, "user_id", &["full_name"])
            .order("created_at", Order::Desc);
        if !user.is_admin() {
            query = query.eq("user_id", user.id.as_str());
        }

        let rows = self.backend.select(&query).await?;
        backend::decode_rows("leave", rows)
    }

    /// `Ok(None)` when nobody is signed in.
    pub async fn create_leave(&self, new_leave: &NewLeave) -> PortalResult<Option<Leave>> {
        let Some(user) = self.session.current_user() else {
            debug!("Ignoring create_leave: user not logged in");
            return Ok(None);
        };
        let _loading = self.loading.enter();

        let row = backend::encode(
            "leave",
            &LeaveInsert {
                user_id: &user.id,
                fields: new_leave,
                status: LeaveStatus::Pending,
            },
        )?;

        let created = self
            .backend
            .insert(tables::LEAVES, row)
            .await
            .and_then(|row| backend::decode_row::<Leave>("leave", row))
            .map_err(|e| {
                error!(error = %e, user_id = %user.id, "Error creating leave");
                e
            })?;

        info!(leave_id = %created.id, leave_type = %created.leave_type, "Leave requested");
        self.leaves.update(|leaves| leaves.insert(0, created.clone()));
        Ok(Some(created))
    }

    /// `Ok(None)` when no row has that id; the cache is then left alone.
    pub async fn update_leave(&self, id: &str, update: &LeaveUpdate) -> PortalResult<Option<Leave>> {
        let _loading = self.loading.enter();

        let patch = backend::encode("leave update", update)?;
        let query = Query::table(tables::LEAVES).eq("id", id);

        let row = self.backend.update(&query, patch).await.map_err(|e| {
            error!(error = %e, leave_id = id, "Error updating leave");
            e
        })?;
        let Some(row) = row else {
            debug!(leave_id = id, "Update matched no leave");
            return Ok(None);
        };
        let mut updated: Leave = backend::decode_row("leave", row)?;

        self.leaves.update(|leaves| {
            for leave in leaves.iter_mut().filter(|l| l.id == id) {
                // the write response carries no join
                if updated.profile.is_none() {
                    updated.profile = leave.profile.clone();
                }
                *leave = updated.clone();
            }
        });
        Ok(Some(updated))
    }

    pub async fn approve_leave(&self, id: &str) -> PortalResult<Option<Leave>> {
        self.update_leave(id, &LeaveUpdate::status(LeaveStatus::Approved))
            .await
    }

    pub async fn reject_leave(&self, id: &str) -> PortalResult<Option<Leave>> {
        self.update_leave(id, &LeaveUpdate::status(LeaveStatus::Rejected))
            .await
    }

    /// Only pending requests may be withdrawn.
    pub async fn delete_leave(&self, id: &str) -> PortalResult<()> {
        let decided = self
            .leaves
            .with(|leaves| leaves.iter().any(|l| l.id == id && !l.is_pending()));
        if decided {
            return Err(PortalError::InvalidState(
                "Only pending leave requests can be deleted".to_string(),
            ));
        }

        let _loading = self.loading.enter();
        let query = Query::table(tables::LEAVES).eq("id", id);
        self.backend.delete(&query).await.map_err(|e| {
            error!(error = %e, leave_id = id, "Error deleting leave");
            e
        })?;

        self.leaves.update(|leaves| leaves.retain(|l| l.id != id));
        Ok(())
    }

    pub fn leave_stats(&self) -> LeaveStats {
        self.leaves.with(|leaves| LeaveStats::from_leaves(leaves))
    }

    pub fn leaves(&self) -> Vec<Leave> {
        self.leaves.get()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_busy()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Leave>> {
        self.leaves.subscribe()
    }
}
