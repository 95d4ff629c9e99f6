//! Cubiz messaging: direct messages for the Cubiz platform.
//!
//! Conversation aggregation, unread bookkeeping, message-request gating
//! and live conversation sessions on top of a flat message log. The log
//! itself lives behind the [`store::MessageStore`] trait with local
//! (SQLite, in-memory) and remote (REST gateway) adapters.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod store;

pub mod messaging;
