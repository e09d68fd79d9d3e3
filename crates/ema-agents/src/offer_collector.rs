use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ema_bus::{Agent, AgentContext};
use ema_protocol::{Event, EventKey, EventName};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::window::{CollectionWindow, DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW, WindowUpdate};

pub const OFFER_COLLECTOR_NAME: &str = "OfferCollectorAgent";

/// The offers picked for one session when its window closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub session_id: String,
    pub offers: Vec<Event>,
}

/// Collects offers per session for a short window, then presents the
/// selected ones by logging them.
pub struct OfferCollectorAgent {
    window: CollectionWindow<Event>,
    selections: Option<mpsc::UnboundedSender<Selection>>,
}

impl Default for OfferCollectorAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl OfferCollectorAgent {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW, DEFAULT_MAX_PER_WINDOW)
    }

    pub fn with_window(delay: Duration, max_per_window: usize) -> Self {
        Self {
            window: CollectionWindow::new(delay, max_per_window),
            selections: None,
        }
    }

    /// Also hand every selection to `sink`.
    pub fn with_selection_sink(mut self, sink: mpsc::UnboundedSender<Selection>) -> Self {
        self.selections = Some(sink);
        self
    }

    fn present(&self, session_id: &str, offers: &[Event]) {
        info!("User session {session_id} received these offers:");
        for offer in offers {
            let desc = offer.str_field(EventKey::OFFER_DESC).unwrap_or_default();
            let code = offer.str_field(EventKey::OFFER_CODE).unwrap_or_default();
            info!("  {desc} ({code})");
        }
    }
}

#[async_trait]
impl Agent for OfferCollectorAgent {
    fn name(&self) -> &str {
        OFFER_COLLECTOR_NAME
    }

    async fn on_event(
        &mut self,
        event: Event,
        _arrived: DateTime<Utc>,
        ctx: &mut AgentContext,
    ) -> anyhow::Result<()> {
        if event.name() != EventName::OFFER {
            return Ok(());
        }
        let Some(session_id) = event.session_id().map(str::to_string) else {
            warn!(event = %event.describe(), "offer without a session; ignored");
            return Ok(());
        };

        match self.window.offer(&session_id, event) {
            WindowUpdate::Opened => {
                ctx.schedule(session_id, self.window.delay());
            }
            WindowUpdate::Appended { pending } => {
                debug!(session_id = %session_id, pending, "another offer; waiting for more");
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self, key: String, _ctx: &mut AgentContext) -> anyhow::Result<()> {
        let Some(offers) = self.window.flush(&key) else {
            return Ok(());
        };

        self.present(&key, &offers);
        if let Some(sink) = &self.selections {
            let _ = sink.send(Selection {
                session_id: key,
                offers,
            });
        }
        Ok(())
    }
}
