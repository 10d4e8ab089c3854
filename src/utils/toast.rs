use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::signal::Signal;
use crate::error::PortalError;
use crate::model::toast::{Severity, Toast};

pub const DEFAULT_TOAST_TTL: Duration = Duration::from_millis(5000);

struct Inner {
    toasts: Signal<Vec<Toast>>,
    ttl: Duration,
}

/// Transient user notifications, each removed after a fixed delay.
///
/// Cheap to clone; clones share one queue. Enqueueing spawns the expiry timer,
/// so it must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct ToastQueue {
    inner: Arc<Inner>,
}

impl Default for ToastQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TOAST_TTL)
    }
}

impl ToastQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                toasts: Signal::new(Vec::new()),
                ttl,
            }),
        }
    }

    pub fn enqueue(&self, message: impl Into<String>, severity: Severity) -> Uuid {
        let toast = Toast::new(message, severity);
        let id = toast.id;
        debug!(%id, severity = %severity, "Toast shown");

        self.inner.toasts.update(|toasts| toasts.push(toast));

        let queue: Weak<Inner> = Arc::downgrade(&self.inner);
        let ttl = self.inner.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = queue.upgrade() {
                remove_from(&inner, id);
            }
        });

        id
    }

    /// Removing an id that is not queued is a no-op.
    pub fn remove(&self, id: Uuid) {
        remove_from(&self.inner, id);
    }

    pub fn show_success(&self, message: impl Into<String>) -> Uuid {
        self.enqueue(message, Severity::Success)
    }

    pub fn show_error(&self, message: impl Into<String>) -> Uuid {
        self.enqueue(message, Severity::Error)
    }

    pub fn show_info(&self, message: impl Into<String>) -> Uuid {
        self.enqueue(message, Severity::Info)
    }

    pub fn show_failure(&self, error: &PortalError) -> Uuid {
        self.show_error(error.user_message())
    }

    pub fn toasts(&self) -> Vec<Toast> {
        self.inner.toasts.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Toast>> {
        self.inner.toasts.subscribe()
    }
}

fn remove_from(inner: &Inner, id: Uuid) {
    let removed = inner.toasts.update_if(|toasts| {
        let before = toasts.len();
        toasts.retain(|t| t.id != id);
        toasts.len() != before
    });
    if removed {
        debug!(%id, "Toast removed");
    }
}
