//! Shared event definitions for EMA agents.
//!
//! Every agent reads and writes the same envelope: a named event carrying a
//! flat set of JSON fields. The vocabulary constants name the event types and
//! field keys that the core agents agree on.

pub mod event;
pub mod vocab;

pub use event::{Event, EventBuilder, WireError};
pub use vocab::{EventKey, EventName};
