//! User Activity Monitor (§4.14, new): a single "when did the user last
//! interact" timestamp, updated on every user-sourced dispatch and read by
//! the Dream Driver (to avoid consolidating mid-conversation) and the
//! Scheduled Task Handler's logging path. New to this workspace — the
//! teacher's proactive-mode DND window used a config-only quiet period with
//! no live activity signal; this generalizes that idea into an observable
//! timestamp any component can await changes on via `tokio::sync::watch`.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

pub struct UserActivityMonitor {
    sender: watch::Sender<DateTime<Utc>>,
}

impl UserActivityMonitor {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(Utc::now());
        Self { sender }
    }

    /// Records that the user is active right now.
    pub fn touch(&self) {
        let _ = self.sender.send(Utc::now());
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        *self.sender.borrow()
    }

    pub fn idle_for(&self) -> chrono::Duration {
        Utc::now() - self.last_active_at()
    }

    pub fn subscribe(&self) -> watch::Receiver<DateTime<Utc>> {
        self.sender.subscribe()
    }
}

impl Default for UserActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
