use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ema_bus::{Agent, AgentContext, AgentFailure};
use ema_protocol::Event;
use tracing::{info, warn};

pub const WATCHER_NAME: &str = "EventStreamWatcher";

/// Logs every event on the stream. Records without a name or source never
/// get here; the shard reader drops them with a warning.
#[derive(Debug, Default)]
pub struct EventStreamWatcher {
    seen: u64,
}

impl EventStreamWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}

#[async_trait]
impl Agent for EventStreamWatcher {
    fn name(&self) -> &str {
        WATCHER_NAME
    }

    async fn on_event(
        &mut self,
        event: Event,
        arrived: DateTime<Utc>,
        _ctx: &mut AgentContext,
    ) -> anyhow::Result<()> {
        self.seen += 1;
        let json = event.to_wire()?;
        info!(arrived = %arrived.to_rfc3339(), "{json}");
        Ok(())
    }

    fn on_error(&mut self, failure: &AgentFailure) {
        warn!("error: {failure}");
    }
}
