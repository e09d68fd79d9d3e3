/// Event names understood by the core agents.
///
/// A deployment is free to add its own names; agents ignore events they do
/// not recognise.
pub struct EventName;

impl EventName {
    // User activity
    pub const USER_SESSION_START: &str = "userSessionBecomesActive";
    pub const USER_NEAR_STORE: &str = "userNearStore";
    pub const USER_VISITS_STORE: &str = "userVisitsStore";

    // Derived state
    pub const USER_TAGGED: &str = "userTag";
    pub const USER_SESSION_PROFILE: &str = "userProfile";

    // Offers
    pub const OFFER: &str = "offer";
}

/// Field keys carried by events.
pub struct EventKey;

impl EventKey {
    // Envelope
    pub const EVENT_NAME: &str = "eventName";
    pub const EVENT_SOURCE: &str = "eventSource";

    // Identity
    pub const USER_SESSION_ID: &str = "userSessionId";
    pub const USER_ID: &str = "userId";

    // Profile
    pub const USER_TAG: &str = "tag";
    pub const TAG_EXPIRES: &str = "expires";
    pub const USER_TAG_LIST: &str = "knownTags";
    pub const USER_STORE_LIST: &str = "knownStoresVisited";
    pub const STORE_ID: &str = "storeId";

    // Offers
    pub const OFFER_DESC: &str = "offerDescription";
    pub const OFFER_CODE: &str = "offerCode";
    pub const OFFER_SCORE: &str = "offerScore";
}
