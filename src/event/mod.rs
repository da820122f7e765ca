//! Update-loop events
//!
//! Keys, fetch completions, coordinator events and finished user actions all
//! arrive on one channel and are handled strictly in order.

pub mod input;

use crate::coordination::CoordinatorEvent;
use crate::errors::NtmError;
use crate::refresh::Completion;

/// Application events
#[derive(Debug)]
pub enum Event {
    /// Keyboard input
    Key(crossterm::event::KeyEvent),
    /// Terminal resized; forces a redraw
    Resize,
    /// A refresh fetch finished (boxed to reduce enum size)
    Completion(Box<Completion>),
    /// Forwarded from the coordinator's bounded channel
    Coordinator(CoordinatorEvent),
    /// A user action that ran off the update loop
    ActionDone(ActionOutcome),
}

/// Result of a user action such as focus, recovery or force release
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: UserAction,
    pub pane_id: Option<String>,
    pub result: Result<String, NtmError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Focus,
    Recovery,
    ForceRelease,
    Acknowledge,
}

impl UserAction {
    pub fn label(self) -> &'static str {
        match self {
            UserAction::Focus => "focus",
            UserAction::Recovery => "recovery",
            UserAction::ForceRelease => "force release",
            UserAction::Acknowledge => "acknowledge",
        }
    }
}
