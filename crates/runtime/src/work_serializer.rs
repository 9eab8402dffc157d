//! Work Serializer (spec §4.3): a single execution slot shared by the
//! user-driven loop and background (scheduled/dream) loops, with user
//! preemption of whatever background work currently holds the slot.
//!
//! New to this workspace — the teacher's single-process TUI never needed to
//! arbitrate between a user turn and a background loop, since it only ever
//! ran one loop at a time by construction. Grounded on the
//! `CancellationToken::child_token` cascade pattern used throughout this
//! crate (spec §5) for the preemption signal.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotKind {
    User,
    Background,
}

struct HeldSlot {
    kind: SlotKind,
    preempt: CancellationToken,
}

/// The single exclusive slot (spec §5: "a single exclusive slot (mutex + a
/// condition variable)"). `Notify` plays the role of the condition variable.
pub struct WorkSerializer {
    held: Mutex<Option<HeldSlot>>,
    notify: Notify,
    shutdown: CancellationToken,
}

/// A handle to an acquired slot. Dropping it releases the slot and wakes
/// any waiters.
pub struct SlotHandle {
    serializer: Arc<WorkSerializer>,
    kind: SlotKind,
    /// Fires on user preemption or host shutdown; pass this to the loop
    /// runner's cancellation parameter.
    pub token: CancellationToken,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.serializer.release(self.kind);
    }
}

impl WorkSerializer {
    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self { held: Mutex::new(None), notify: Notify::new(), shutdown })
    }

    /// Always succeeds, eventually. If a background slot is held, signals
    /// its preemption token and waits for it to release before taking the
    /// slot (spec §4.3, testable property 6: the background token has fired
    /// before this returns).
    pub async fn acquire_for_user(self: &Arc<Self>) -> SlotHandle {
        loop {
            {
                let mut held = self.held.lock().unwrap();
                match held.as_ref() {
                    None => {
                        let preempt = self.shutdown.child_token();
                        *held = Some(HeldSlot { kind: SlotKind::User, preempt: preempt.clone() });
                        return SlotHandle { serializer: self.clone(), kind: SlotKind::User, token: preempt };
                    }
                    Some(slot) if slot.kind == SlotKind::Background => {
                        slot.preempt.cancel();
                    }
                    Some(_) => {}
                }
            }
            self.notify.notified().await;
        }
    }

    /// Returns `None` immediately if any slot is currently held. The
    /// returned handle's token fires on user preemption or host shutdown.
    pub fn try_acquire_for_scheduled(self: &Arc<Self>) -> Option<SlotHandle> {
        let mut held = self.held.lock().unwrap();
        if held.is_some() {
            return None;
        }
        let preempt = self.shutdown.child_token();
        *held = Some(HeldSlot { kind: SlotKind::Background, preempt: preempt.clone() });
        Some(SlotHandle { serializer: self.clone(), kind: SlotKind::Background, token: preempt })
    }

    fn release(&self, kind: SlotKind) {
        let mut held = self.held.lock().unwrap();
        if let Some(slot) = held.as_ref() {
            if slot.kind == kind {
                *held = None;
            }
        }
        drop(held);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn scheduled_slot_is_refused_while_another_is_held() {
        let serializer = WorkSerializer::new(CancellationToken::new());
        let _first = serializer.try_acquire_for_scheduled().unwrap();
        assert!(serializer.try_acquire_for_scheduled().is_none());
    }

    #[tokio::test]
    async fn releasing_a_slot_frees_it_for_the_next_caller() {
        let serializer = WorkSerializer::new(CancellationToken::new());
        {
            let _slot = serializer.try_acquire_for_scheduled().unwrap();
        }
        assert!(serializer.try_acquire_for_scheduled().is_some());
    }

    #[tokio::test]
    async fn user_acquire_preempts_and_waits_for_background_release() {
        let serializer = WorkSerializer::new(CancellationToken::new());
        let background = serializer.try_acquire_for_scheduled().unwrap();
        let background_token = background.token.clone();

        let serializer_for_bg = serializer.clone();
        tokio::spawn(async move {
            background_token.cancelled().await;
            drop(background);
            let _ = &serializer_for_bg;
        });

        let user = tokio::time::timeout(Duration::from_secs(1), serializer.acquire_for_user()).await.unwrap();
        assert!(background_token.is_cancelled());
        drop(user);
    }

    #[tokio::test]
    async fn host_shutdown_cascades_into_every_held_slot_token() {
        let shutdown = CancellationToken::new();
        let serializer = WorkSerializer::new(shutdown.clone());
        let slot = serializer.try_acquire_for_scheduled().unwrap();
        shutdown.cancel();
        assert!(slot.token.is_cancelled());
    }
}
