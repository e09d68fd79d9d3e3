//! Per-identity profiles keyed by user id and session id.
//!
//! A person is sometimes known only by an anonymous session and sometimes by
//! a user id as well. Both keys live in one index; whenever a call names both
//! and they point at different profiles, the two are merged and both keys are
//! repointed, so later lookups by either key converge on one profile.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use ema_protocol::{Event, EventKey, EventName};

/// Lifetime of a tag asserted without a usable expiry.
pub const DEFAULT_TAG_TTL_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProfileId(usize);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: Option<String>,
    pub sessions: BTreeSet<String>,
    /// Tag name to expiry.
    pub tags: BTreeMap<String, DateTime<Utc>>,
    /// Store ids in the order they were first visited.
    pub stores_visited: Vec<String>,
}

impl UserProfile {
    fn visit_store(&mut self, store_id: &str) {
        if !self.stores_visited.iter().any(|s| s == store_id) {
            self.stores_visited.push(store_id.to_string());
        }
    }

    /// Absorb another profile's tags and store visits. Its tags win on
    /// collision.
    fn absorb(&mut self, other: &UserProfile) {
        for (tag, expires) in &other.tags {
            self.tags.insert(tag.clone(), *expires);
        }
        for store in &other.stores_visited {
            self.visit_store(store);
        }
    }
}

#[derive(Debug)]
pub struct ProfileStore {
    /// Every profile ever created. A merge repoints only the keys it was given,
    /// so an absorbed profile stays reachable through any other key it had.
    profiles: Vec<UserProfile>,
    /// User ids and session ids share one key space.
    index: HashMap<String, ProfileId>,
    default_ttl: Duration,
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::with_default_ttl(Duration::milliseconds(DEFAULT_TAG_TTL_MS))
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            profiles: Vec::new(),
            index: HashMap::new(),
            default_ttl,
        }
    }

    pub fn get(&self, id: ProfileId) -> &UserProfile {
        &self.profiles[id.0]
    }

    pub fn lookup(&self, key: &str) -> Option<&UserProfile> {
        self.index.get(key).map(|id| self.get(*id))
    }

    /// Number of distinct profiles reachable through the index.
    pub fn len(&self) -> usize {
        self.index.values().collect::<HashSet<_>>().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Find the profile for this identity, creating it if needed, and make
    /// both keys point at it. Returns `None` when neither key is given.
    pub fn resolve_and_link(
        &mut self,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<ProfileId> {
        if user_id.is_none() && session_id.is_none() {
            return None;
        }

        let found = user_id
            .and_then(|u| self.index.get(u))
            .or_else(|| session_id.and_then(|s| self.index.get(s)))
            .copied();
        let id = match found {
            Some(id) => id,
            None => {
                self.profiles.push(UserProfile::default());
                ProfileId(self.profiles.len() - 1)
            }
        };

        for key in [user_id, session_id].into_iter().flatten() {
            self.link(key, id);
        }

        let profile = &mut self.profiles[id.0];
        if let Some(user_id) = user_id {
            profile.user_id = Some(user_id.to_string());
        }
        if let Some(session_id) = session_id {
            profile.sessions.insert(session_id.to_string());
        }
        Some(id)
    }

    /// Point `key` at `id`, merging whatever profile it pointed at before.
    fn link(&mut self, key: &str, id: ProfileId) {
        match self.index.insert(key.to_string(), id) {
            Some(previous) if previous != id => {
                let absorbed = self.profiles[previous.0].clone();
                self.profiles[id.0].absorb(&absorbed);
                tracing::debug!(key = %key, "merged profiles");
            }
            _ => {}
        }
    }

    /// Assert a tag. `expires` is an RFC 3339 timestamp; anything missing,
    /// unparseable or not after the epoch falls back to `now` plus the
    /// default TTL.
    pub fn tag(&mut self, id: ProfileId, tag: &str, expires: Option<&str>, now: DateTime<Utc>) {
        let expires = self.expiry(expires, now);
        self.profiles[id.0].tags.insert(tag.to_string(), expires);
    }

    pub fn visit_store(&mut self, id: ProfileId, store_id: &str) {
        self.profiles[id.0].visit_store(store_id);
    }

    fn expiry(&self, supplied: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
        supplied
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc))
            .filter(|t| t.timestamp_millis() > 0)
            .unwrap_or(now + self.default_ttl)
    }

    /// Drop every tag whose expiry is strictly before `now`. Returns how many
    /// were dropped.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for profile in &mut self.profiles {
            let before = profile.tags.len();
            profile.tags.retain(|_, expires| *expires >= now);
            purged += before - profile.tags.len();
        }
        purged
    }

    pub fn snapshot(&self, id: ProfileId, session_id: Option<&str>) -> ProfileSnapshot {
        let profile = self.get(id);
        ProfileSnapshot {
            user_id: profile.user_id.clone(),
            session_id: session_id.map(str::to_string),
            known_tags: profile.tags.keys().cloned().collect(),
            known_stores_visited: profile.stores_visited.clone(),
        }
    }
}

/// What the profile manager advertises about one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Sorted.
    pub known_tags: Vec<String>,
    pub known_stores_visited: Vec<String>,
}

impl ProfileSnapshot {
    pub fn into_event(self) -> Event {
        Event::builder(EventName::USER_SESSION_PROFILE)
            .optional_field(EventKey::USER_ID, self.user_id)
            .optional_field(EventKey::USER_SESSION_ID, self.session_id)
            .field(EventKey::USER_TAG_LIST, self.known_tags)
            .field(EventKey::USER_STORE_LIST, self.known_stores_visited)
            .build()
    }
}
