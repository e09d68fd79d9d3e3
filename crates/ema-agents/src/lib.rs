//! Stateful EMA agents.
//!
//! - [`UserProfileManagerAgent`] correlates tags and store visits per person
//!   across anonymous sessions and logins, and advertises profiles.
//! - [`OfferCollectorAgent`] lets competing offers for a session settle for a
//!   few seconds before presenting a selection.
//! - [`EventStreamWatcher`] logs the whole stream.

pub mod clock;
pub mod offer_collector;
pub mod profile;
pub mod profile_manager;
pub mod watcher;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use offer_collector::{OFFER_COLLECTOR_NAME, OfferCollectorAgent, Selection};
pub use profile::{ProfileId, ProfileSnapshot, ProfileStore, UserProfile};
pub use profile_manager::{PROFILE_MANAGER_NAME, UserProfileManagerAgent};
pub use watcher::{EventStreamWatcher, WATCHER_NAME};
pub use window::{CollectionWindow, Scored, WindowUpdate};
