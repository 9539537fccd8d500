//! Per-chat sliding-window suppressor for the canned system-error apology
//! (spec §4.8 "Failure and rate-limit", testable property 8): at most one
//! apology message is persisted and broadcast per chat per cooldown window.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone)]
pub struct AlertCooldown {
    window: Duration,
    last_sent: Arc<DashMap<Uuid, Instant>>,
}

impl AlertCooldown {
    pub fn new(window: Duration) -> Self {
        Self { window, last_sent: Arc::new(DashMap::new()) }
    }

    /// Returns `true` and records `now` iff no apology was sent for
    /// `chat_id` within the window — a test-and-set, not a read-only check,
    /// so concurrent callers for the same chat can't both pass.
    pub fn try_acquire(&self, chat_id: Uuid) -> bool {
        let now = Instant::now();
        match self.last_sent.entry(chat_id) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) >= self.window {
                    e.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_for_a_chat_is_allowed() {
        let cooldown = AlertCooldown::new(Duration::from_secs(15));
        assert!(cooldown.try_acquire(Uuid::new_v4()));
    }

    #[test]
    fn second_call_within_window_is_suppressed() {
        let cooldown = AlertCooldown::new(Duration::from_secs(15));
        let chat_id = Uuid::new_v4();
        assert!(cooldown.try_acquire(chat_id));
        assert!(!cooldown.try_acquire(chat_id));
    }

    #[test]
    fn distinct_chats_are_independent() {
        let cooldown = AlertCooldown::new(Duration::from_secs(15));
        assert!(cooldown.try_acquire(Uuid::new_v4()));
        assert!(cooldown.try_acquire(Uuid::new_v4()));
    }

    #[test]
    fn call_after_window_elapses_is_allowed_again() {
        let cooldown = AlertCooldown::new(Duration::from_millis(10));
        let chat_id = Uuid::new_v4();
        assert!(cooldown.try_acquire(chat_id));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cooldown.try_acquire(chat_id));
    }
}
