use tokio::sync::watch;

use super::signal::Signal;

/// Counts outstanding calls of one operation family. Busy while any call is
/// still running, so overlapping calls cannot clear each other's flag.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Signal<usize>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> InFlightGuard<'_> {
        self.count.update(|c| *c += 1);
        InFlightGuard { owner: self }
    }

    pub fn is_busy(&self) -> bool {
        self.count.get() > 0
    }

    pub fn outstanding(&self) -> usize {
        self.count.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }
}

#[must_use = "the call is only counted while the guard is alive"]
pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.count.update(|c| *c = c.saturating_sub(1));
    }
}
