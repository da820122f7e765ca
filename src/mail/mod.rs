//! Agent Mail: the messaging substrate agents coordinate through
//!
//! - [`client`]: JSON-RPC tool calls over HTTP
//! - [`enroll`]: registering session panes and the coordinator
//! - [`registry`]: per-session pane → agent-name mapping on disk
//! - [`types`]: messages, reservations, inbox summaries

pub mod client;
pub mod enroll;
pub mod registry;
pub mod types;

pub use client::{AgentMail, HttpMailClient};
pub use registry::{FallbackMode, RegistryStore, SessionAgentInfo, SessionAgentRegistry};
pub use types::{
    AgentRegistration, FileReservation, Importance, InboxMessage, InboxSummary, MailStatus,
    OutgoingMessage, SendReceipt,
};
