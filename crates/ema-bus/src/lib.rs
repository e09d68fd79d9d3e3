//! Event bus client and agent runtime for EMA agents.
//!
//! Agents read a shared, sharded event log through [`EventBusClient`] and
//! react to events from inside an [`AgentRuntime`]. The log itself sits behind
//! the [`ShardedLog`](log::ShardedLog) trait: [`MemoryLog`](log::MemoryLog)
//! in-process, or [`HttpLog`](log::HttpLog) against an `ema-logd` service.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod policy;
pub mod runtime;

pub use client::{Delivered, Delivery, EventBusClient, Polled, PublishAck, ShardCursor};
pub use config::{BusSettings, Settings, SettingsError, ShardFailureMode};
pub use error::BusError;
pub use policy::{ReadPolicy, ShardFailurePolicy};
pub use runtime::{Agent, AgentContext, AgentFailure, AgentRuntime, Highlight, TimerId};
