use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::auth::session::Session;
use crate::backend::{self, Backend, Order, Query, tables};
use crate::error::{PortalError, PortalResult};
use crate::model::analytics::TaskStats;
use crate::model::task::{NewTask, Task, TaskFilter, TaskStatus, TaskUpdate};
use crate::utils::in_flight::InFlight;
use crate::utils::signal::Signal;

/// Row sent on create; status is always `pending`.
#[derive(Serialize)]
struct TaskInsert<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    fields: &'a NewTask,
    status: TaskStatus,
}

/// Cached task list of the signed-in user (all users for admins).
pub struct TaskManager {
    backend: Arc<dyn Backend>,
    session: Arc<Session>,
    tasks: Signal<Vec<Task>>,
    filtered_tasks: Signal<Vec<Task>>,
    current_filter: Signal<TaskFilter>,
    loading: InFlight,
}

impl TaskManager {
    pub fn new(backend: Arc<dyn Backend>, session: Arc<Session>) -> Self {
        Self {
            backend,
            session,
            tasks: Signal::new(Vec::new()),
            filtered_tasks: Signal::new(Vec::new()),
            current_filter: Signal::new(TaskFilter::All),
            loading: InFlight::new(),
        }
    }

    /// Replaces the cache with the server's list. Errors are logged and the
    /// previous list is kept.
    pub async fn load_tasks(&self) {
        let _loading = self.loading.enter();

        match self.fetch_tasks().await {
            Ok(tasks) => {
                debug!(count = tasks.len(), "Tasks loaded");
                self.tasks.set(tasks);
                self.refresh_filtered();
            }
            Err(PortalError::NotAuthenticated) => {
                warn!("Skipping task load: user not logged in");
            }
            Err(e) => error!(error = %e, "Error loading tasks"),
        }
    }

    async fn fetch_tasks(&self) -> PortalResult<Vec<Task>> {
        let user = self.session.current_user().ok_or(PortalError::NotAuthenticated)?;

        let mut query = Query::table(tables::TASKS)
            .select("*")
            .order("created_at", Order::Desc);
        if !user.is_admin() {
            query = query.eq("user_id", user.id.as_str());
        }

        let rows = self.backend.select(&query).await?;
        backend::decode_rows("task", rows)
    }

    /// `Ok(None)` when nobody is signed in.
    pub async fn create_task(&self, new_task: &NewTask) -> PortalResult<Option<Task>> {
        let Some(user) = self.session.current_user() else {
            debug!("Ignoring create_task: user not logged in");
            return Ok(None);
        };
        let _loading = self.loading.enter();

        let row = backend::encode(
            "task",
            &TaskInsert {
                user_id: &user.id,
                fields: new_task,
                status: TaskStatus::Pending,
            },
        )?;

        let created = self
            .backend
            .insert(tables::TASKS, row)
            .await
            .and_then(|row| backend::decode_row::<Task>("task", row))
            .map_err(|e| {
                error!(error = %e, user_id = %user.id, "Error creating task");
                e
            })?;

        self.tasks.update(|tasks| tasks.insert(0, created.clone()));
        self.refresh_filtered();
        Ok(Some(created))
    }

    /// `Ok(None)` when no row has that id; the cache is then left alone.
    pub async fn update_task(&self, id: &str, update: &TaskUpdate) -> PortalResult<Option<Task>> {
        let _loading = self.loading.enter();

        let patch = backend::encode("task update", update)?;
        let query = Query::table(tables::TASKS).eq("id", id);

        let row = self.backend.update(&query, patch).await.map_err(|e| {
            error!(error = %e, task_id = id, "Error updating task");
            e
        })?;
        let Some(row) = row else {
            debug!(task_id = id, "Update matched no task");
            return Ok(None);
        };
        let updated: Task = backend::decode_row("task", row)?;

        self.tasks.update(|tasks| {
            for task in tasks.iter_mut().filter(|t| t.id == id) {
                *task = updated.clone();
            }
        });
        self.refresh_filtered();
        Ok(Some(updated))
    }

    pub async fn toggle_status(&self, task: &Task) -> PortalResult<Option<Task>> {
        self.update_task(&task.id, &TaskUpdate::status(task.status.toggled()))
            .await
    }

    pub async fn delete_task(&self, id: &str) -> PortalResult<()> {
        let _loading = self.loading.enter();

        let query = Query::table(tables::TASKS).eq("id", id);
        self.backend.delete(&query).await.map_err(|e| {
            error!(error = %e, task_id = id, "Error deleting task");
            e
        })?;

        self.tasks.update(|tasks| tasks.retain(|t| t.id != id));
        self.refresh_filtered();
        Ok(())
    }

    pub fn set_filter(&self, filter: TaskFilter) {
        self.current_filter.set(filter);
        self.refresh_filtered();
    }

    fn refresh_filtered(&self) {
        let filter = self.current_filter.get();
        let filtered = self.tasks.with(|tasks| filter.apply(tasks));
        self.filtered_tasks.set(filtered);
    }

    pub fn task_stats(&self) -> TaskStats {
        self.tasks.with(|tasks| TaskStats::from_tasks(tasks))
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.get()
    }

    pub fn filtered_tasks(&self) -> Vec<Task> {
        self.filtered_tasks.get()
    }

    pub fn current_filter(&self) -> TaskFilter {
        self.current_filter.get()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_busy()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Task>> {
        self.tasks.subscribe()
    }

    pub fn subscribe_filtered(&self) -> watch::Receiver<Vec<Task>> {
        self.filtered_tasks.subscribe()
    }
}
