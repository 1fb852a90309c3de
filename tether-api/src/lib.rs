//! Tether API - shared transcript, configuration and event types.

mod config;
mod entry;
mod event;

pub use config::*;
pub use entry::*;
pub use event::*;
