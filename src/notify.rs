//! Cross-platform native desktop notifications
//!
//! Uses notify-rust for native notifications on macOS, Linux, and BSD.
//! Agent errors and reservation conflicts are the only things worth
//! interrupting the user for; each key is throttled so a flapping agent
//! doesn't spam the desktop.

use notify_rust::Notification;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Minimum gap between two notifications with the same key
pub const NOTIFY_COOLDOWN: Duration = Duration::from_secs(60);

/// Send a desktop notification without blocking the caller
pub fn send(title: &str, message: &str) {
    let title = title.to_string();
    let message = message.to_string();

    std::thread::spawn(move || {
        if let Err(e) = Notification::new()
            .appname("ntm")
            .summary(&title)
            .body(&message)
            .timeout(5000) // 5 seconds
            .show()
        {
            tracing::debug!(error = %e, "Desktop notification failed");
        }
    });
}

/// Throttled notifier, disabled unless `[notifications] enabled = true`
#[derive(Debug)]
pub struct Notifier {
    enabled: bool,
    cooldown: Duration,
    last_sent: HashMap<String, Instant>,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            cooldown: NOTIFY_COOLDOWN,
            last_sent: HashMap::new(),
        }
    }

    /// Record `key` and report whether a notification may go out now
    pub fn should_send(&mut self, key: &str, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(last) = self.last_sent.get(key) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }
        self.last_sent.insert(key.to_string(), now);
        true
    }

    pub fn agent_error(&mut self, pane_id: &str, title: &str, detail: &str) {
        if self.should_send(&format!("error:{pane_id}"), Instant::now()) {
            send(&format!("{title} needs attention"), detail);
        }
    }

    pub fn conflict(&mut self, pattern: &str, holders: &[String]) {
        if self.should_send(&format!("conflict:{pattern}"), Instant::now()) {
            send(
                "File reservation conflict",
                &format!("{pattern} held by {}", holders.join(", ")),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_sends() {
        let mut n = Notifier::new(false);
        assert!(!n.should_send("error:%1", Instant::now()));
    }

    #[test]
    fn test_same_key_is_throttled() {
        let mut n = Notifier::new(true);
        let t0 = Instant::now();
        assert!(n.should_send("error:%1", t0));
        assert!(!n.should_send("error:%1", t0 + Duration::from_secs(10)));
        assert!(n.should_send("error:%2", t0 + Duration::from_secs(10)));
        assert!(n.should_send("error:%1", t0 + NOTIFY_COOLDOWN));
    }
}
