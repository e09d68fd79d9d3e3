use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ema_bus::{Agent, AgentContext};
use ema_protocol::{Event, EventKey, EventName};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::profile::{ProfileId, ProfileStore};

pub const PROFILE_MANAGER_NAME: &str = "UserProfileManagerAgent";

/// The events the profile manager acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProfileEvent {
    SessionStarted,
    StoreVisited { store_id: Option<String> },
    Tagged { tag: String, expires: Option<String> },
    Other,
}

impl ProfileEvent {
    fn classify(event: &Event) -> Self {
        match event.name() {
            EventName::USER_SESSION_START => ProfileEvent::SessionStarted,
            EventName::USER_VISITS_STORE => ProfileEvent::StoreVisited {
                store_id: event.str_field(EventKey::STORE_ID).map(str::to_string),
            },
            EventName::USER_TAGGED => match event.str_field(EventKey::USER_TAG) {
                Some(tag) => ProfileEvent::Tagged {
                    tag: tag.to_string(),
                    expires: event.str_field(EventKey::TAG_EXPIRES).map(str::to_string),
                },
                None => {
                    warn!(event = %event.describe(), "tag event without a tag");
                    ProfileEvent::Other
                }
            },
            _ => ProfileEvent::Other,
        }
    }
}

/// Keeps tags and store visits per user and session, and advertises the
/// accumulated profile when a session starts or a store is visited.
///
/// Profiles live in memory only.
pub struct UserProfileManagerAgent<C> {
    profiles: ProfileStore,
    clock: C,
}

impl<C: Clock> UserProfileManagerAgent<C> {
    pub fn new(clock: C) -> Self {
        Self::with_store(ProfileStore::new(), clock)
    }

    pub fn with_store(profiles: ProfileStore, clock: C) -> Self {
        Self { profiles, clock }
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    async fn advertise_profile(
        &self,
        id: ProfileId,
        session_id: Option<&str>,
        ctx: &AgentContext,
    ) -> anyhow::Result<()> {
        let event = self.profiles.snapshot(id, session_id).into_event();
        ctx.post(event).await?;
        Ok(())
    }
}

#[async_trait]
impl<C: Clock> Agent for UserProfileManagerAgent<C> {
    fn name(&self) -> &str {
        PROFILE_MANAGER_NAME
    }

    async fn on_event(
        &mut self,
        event: Event,
        _arrived: DateTime<Utc>,
        ctx: &mut AgentContext,
    ) -> anyhow::Result<()> {
        let now = self.clock.now();

        // Every event is an occasion to sweep.
        let purged = self.profiles.purge_expired(now);
        if purged > 0 {
            debug!(purged, "expired tags removed");
        }

        let session_id = event.session_id();
        let Some(id) = self.profiles.resolve_and_link(event.user_id(), session_id) else {
            return Ok(());
        };

        match ProfileEvent::classify(&event) {
            ProfileEvent::StoreVisited { store_id } => {
                if let Some(store_id) = store_id {
                    self.profiles.visit_store(id, &store_id);
                }
                self.advertise_profile(id, session_id, ctx).await?;
            }
            ProfileEvent::SessionStarted => {
                self.advertise_profile(id, session_id, ctx).await?;
            }
            ProfileEvent::Tagged { tag, expires } => {
                self.profiles.tag(id, &tag, expires.as_deref(), now);
                debug!(tag = %tag, "tag recorded");
            }
            ProfileEvent::Other => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let visit = Event::builder(EventName::USER_VISITS_STORE)
            .field(EventKey::STORE_ID, "store-1")
            .build();
        assert_eq!(
            ProfileEvent::classify(&visit),
            ProfileEvent::StoreVisited {
                store_id: Some("store-1".into())
            }
        );

        let tagged = Event::builder(EventName::USER_TAGGED)
            .field(EventKey::USER_TAG, "vip")
            .build();
        assert_eq!(
            ProfileEvent::classify(&tagged),
            ProfileEvent::Tagged {
                tag: "vip".into(),
                expires: None
            }
        );

        let untagged = Event::new(EventName::USER_TAGGED);
        assert_eq!(ProfileEvent::classify(&untagged), ProfileEvent::Other);

        let start = Event::new(EventName::USER_SESSION_START);
        assert_eq!(ProfileEvent::classify(&start), ProfileEvent::SessionStarted);
    }
}
