//! Per-source panel data with last-known-good semantics

use chrono::{DateTime, Utc};

use crate::errors::{ErrorKind, NtmError};

#[derive(Debug, Clone)]
pub struct PanelState<T> {
    pub data: Option<T>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub error: Option<NtmError>,
    /// The backing tool is not installed; render an inert placeholder
    pub unavailable: bool,
}

impl<T> Default for PanelState<T> {
    fn default() -> Self {
        Self {
            data: None,
            last_updated_at: None,
            error: None,
            unavailable: false,
        }
    }
}

impl<T> PanelState<T> {
    pub fn set(&mut self, data: T, now: DateTime<Utc>) {
        self.data = Some(data);
        self.last_updated_at = Some(now);
        self.error = None;
        self.unavailable = false;
    }

    /// Record a failed fetch
    ///
    /// Transport, timeout and auth failures keep the last good data on
    /// screen. Validation and not-found results mean the old data is wrong,
    /// so it is cleared. Canceled fetches never reach here.
    pub fn fail(&mut self, err: NtmError) {
        match err.kind() {
            ErrorKind::Canceled => return,
            ErrorKind::Unavailable => {
                self.unavailable = true;
                self.data = None;
            }
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Unauthorized => {}
            _ => self.data = None,
        }
        self.error = Some(err);
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Human "refreshed N ago" hint
    pub fn age_label(&self, now: DateTime<Utc>) -> Option<String> {
        let at = self.last_updated_at?;
        Some(format!("refreshed {} ago", format_age((now - at).num_seconds())))
    }
}

pub fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        _ => format!("{}h", secs / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_keeps_last_known_good() {
        let now = Utc::now();
        let mut p: PanelState<u32> = PanelState::default();
        p.set(7, now);
        p.fail(NtmError::Timeout {
            op: "beads".into(),
            after: Duration::from_secs(5),
        });
        assert_eq!(p.data, Some(7));
        assert!(p.has_error());
        assert_eq!(
            p.age_label(now + chrono::Duration::seconds(90)).as_deref(),
            Some("refreshed 1m ago")
        );
    }

    #[test]
    fn test_unavailable_collapses() {
        let mut p: PanelState<u32> = PanelState::default();
        p.set(1, Utc::now());
        p.fail(NtmError::unavailable("bv"));
        assert!(p.unavailable);
        assert!(p.data.is_none());

        p.set(2, Utc::now());
        assert!(!p.unavailable);
        assert!(!p.has_error());
    }

    #[test]
    fn test_canceled_is_ignored() {
        let mut p: PanelState<u32> = PanelState::default();
        p.set(3, Utc::now());
        p.fail(NtmError::Canceled);
        assert_eq!(p.data, Some(3));
        assert!(!p.has_error());
    }
}
