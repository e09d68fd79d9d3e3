//! `ema-logd`: one shared sharded event log for all agents on a host.
//!
//! Serves a [`MemoryLog`](ema_bus::log::MemoryLog) over the JSON API that
//! [`HttpLog`](ema_bus::log::HttpLog) speaks. Records live in memory only.

pub mod error;
pub mod handlers;
pub mod router;
pub mod settings;

pub use router::build_router;
pub use settings::LogdSettings;
