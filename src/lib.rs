// Clippy configuration: enable pedantic but allow overly strict lints
#![allow(clippy::missing_errors_doc)] // Internal functions don't need # Errors docs
#![allow(clippy::missing_panics_doc)] // Internal functions don't need # Panics docs
#![allow(clippy::must_use_candidate)] // Not all getters need #[must_use]
#![allow(clippy::module_name_repetitions)] // e.g., MailStatus in mail module is fine
#![allow(clippy::doc_markdown)] // Don't require backticks around tmux, JSON, etc.
#![allow(clippy::too_many_lines)] // Some functions are naturally long
#![allow(clippy::struct_excessive_bools)] // Config structs can have multiple bool fields
#![allow(clippy::similar_names)] // Allow similar variable names like pane/panes
#![allow(clippy::cast_possible_truncation)] // We're careful with our casts
#![allow(clippy::cast_sign_loss)] // Timestamp conversions are safe
#![allow(clippy::cast_precision_loss)] // Duration to f64 precision loss is acceptable
#![allow(clippy::significant_drop_tightening)] // Lock guard drops are intentional
#![allow(clippy::redundant_closure_for_method_calls)] // Sometimes closures are clearer
#![allow(clippy::if_not_else)] // Negative conditions can be clearer for early returns
#![allow(clippy::match_same_arms)] // Explicit arms are clearer than combined patterns
#![allow(clippy::single_match_else)] // match with else is fine for Result handling
#![allow(clippy::manual_let_else)] // if-let is clearer for multi-line error handling
#![allow(clippy::items_after_statements)] // Helper closures can be defined inline
#![allow(clippy::option_if_let_else)] // if-let is more readable for Option handling
#![allow(clippy::unnecessary_wraps)] // Some functions return Result for consistency
#![allow(clippy::needless_pass_by_value)] // PathBuf by value is fine for config loading
#![allow(clippy::trivially_copy_pass_by_ref)] // &self on Copy types follows Rust conventions
#![allow(clippy::cast_possible_wrap)] // Timestamp u64->i64 won't overflow until year 292 billion
#![allow(clippy::assigning_clones)] // .clone() is clearer than .clone_from() in most cases

//! ntm - live dashboard and coordination engine for tmux sessions of AI coding agents
//!
//! Two loops share this crate:
//! - The dashboard: a refresh orchestrator polls ~16 data sources on independent
//!   cadences and folds their results into one view-model store ([`state`]).
//! - The coordinator: watches agent state, resolves file-reservation conflicts
//!   and hands work to idle agents through Agent Mail ([`coordination`]).
//!
//! External tools (tmux, bv, ubs, cass, dcg, git, Agent Mail) are reached
//! through traits so every loop can run against in-memory fakes in tests.

pub mod app;
pub mod beads;
pub mod capture;
pub mod cli;
pub mod config;
pub mod context;
pub mod coordination;
pub mod errors;
pub mod event;
pub mod mail;
pub mod notify;
pub mod panes;
pub mod refresh;
pub mod sources;
pub mod state;
pub mod status;
pub mod tmux;
pub mod tools;
pub mod tui;
pub mod ui;
