//! Client-side orchestration for linking a bank and synchronizing its transactions.
//!
//! Two cooperating state machines make up the core:
//! - `wizard::ConnectionWizard` walks through bank lookup, credentials, TAN method selection,
//!   account discovery and import, then optionally runs the first sync.
//! - `tracker::SyncTracker` runs one synchronization job at a time, gates a first sync behind a
//!   chosen historical window and exposes the job's progress.
//!
//! Both talk to collaborators through the `api::BankApi` and `api::SyncApi` traits.

pub mod api;
pub mod args;
pub mod commands;
mod config;
mod error;
pub mod model;
pub mod tracker;
mod utils;
pub mod wizard;


pub use config::Config;
pub use error::{Error, ErrorType, Result};
