//! Agent runtime.
//!
//! Binds one [`Agent`] to an [`EventBusClient`]. Shard readers and timers are
//! background tasks that only send messages; every agent callback runs on a
//! single sequential loop that owns the agent, so agent state needs no locks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ema_protocol::Event;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::client::{Delivery, EventBusClient, PublishAck};
use crate::error::BusError;

// ============================================================================
// Agent trait
// ============================================================================

/// Business logic of one agent process.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    /// Called once before any event is delivered.
    async fn on_start(&mut self, _ctx: &mut AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_event(
        &mut self,
        event: Event,
        arrived: DateTime<Utc>,
        ctx: &mut AgentContext,
    ) -> anyhow::Result<()>;

    /// Called when a timer armed with [`AgentContext::schedule`] fires.
    async fn on_timer(&mut self, _key: String, _ctx: &mut AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a failure has been logged. The runtime keeps going.
    fn on_error(&mut self, _failure: &AgentFailure) {}
}

#[derive(Debug, thiserror::Error)]
pub enum AgentFailure {
    #[error(transparent)]
    Consumption(#[from] BusError),

    #[error("{context} failed: {error:#}")]
    Callback {
        context: String,
        error: anyhow::Error,
    },
}

// ============================================================================
// Highlighting
// ============================================================================

/// The user and session whose log lines should stand out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Highlight {
    pub user: Option<String>,
    pub session: Option<String>,
}

impl Highlight {
    pub fn new(user: Option<String>, session: Option<String>) -> Self {
        Self {
            user: user.filter(|u| !u.is_empty()),
            session: session.filter(|s| !s.is_empty()),
        }
    }

    pub fn matches(&self, user: Option<&str>, session: Option<&str>) -> bool {
        let user_hit = matches!((&self.user, user), (Some(want), Some(got)) if want == got);
        let session_hit =
            matches!((&self.session, session), (Some(want), Some(got)) if want == got);
        user_hit || session_hit
    }

    /// Span carrying an event's identity, entered around its handling.
    pub fn span(&self, event: &Event) -> Span {
        let user = event.user_id();
        let session = event.session_id();
        info_span!(
            "event",
            name = %event.name(),
            user_id = user.unwrap_or("-"),
            session_id = session.unwrap_or("-"),
            highlight = self.matches(user, session)
        )
    }

    fn timer_span(&self, key: &str) -> Span {
        info_span!(
            "timer",
            key = %key,
            highlight = self.matches(None, Some(key))
        )
    }
}

// ============================================================================
// Context handed to callbacks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct ArmedTimer {
    id: TimerId,
    handle: AbortHandle,
}

struct TimerFired {
    key: String,
    id: TimerId,
}

pub struct AgentContext {
    agent_name: String,
    bus: EventBusClient,
    highlight: Highlight,
    timers: HashMap<String, ArmedTimer>,
    next_timer: u64,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
}

impl AgentContext {
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn highlight(&self) -> &Highlight {
        &self.highlight
    }

    pub fn bus(&self) -> &EventBusClient {
        &self.bus
    }

    /// Publish an event as this agent.
    pub async fn post(&self, mut event: Event) -> Result<PublishAck, BusError> {
        event.set_source(self.agent_name.clone());
        let span = self.highlight.span(&event);
        async {
            let ack = self.bus.publish(&event).await;
            match &ack {
                Ok(_) => debug!(event = %event.describe(), "posted"),
                Err(err) => warn!(event = %event.describe(), error = %err, "post failed"),
            }
            ack
        }
        .instrument(span)
        .await
    }

    /// Arm a one-shot timer that calls [`Agent::on_timer`] with `key` after
    /// `delay`. A key holds at most one timer: returns `None` and leaves the
    /// armed timer alone if one is already pending.
    pub fn schedule(&mut self, key: impl Into<String>, delay: Duration) -> Option<TimerId> {
        let key = key.into();
        if self.timers.contains_key(&key) {
            return None;
        }

        let id = TimerId(self.next_timer);
        self.next_timer += 1;

        let tx = self.timer_tx.clone();
        let fired = TimerFired {
            key: key.clone(),
            id,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired);
        })
        .abort_handle();

        debug!(key = %key, delay_ms = delay.as_millis() as u64, "timer armed");
        self.timers.insert(key, ArmedTimer { id, handle });
        Some(id)
    }

    /// Disarm the timer pending for `key`. Returns whether one was pending.
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.timers.contains_key(key)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Consume a fired timer. Stale firings (cancelled or re-armed) yield
    /// `None`.
    fn take_fired(&mut self, fired: TimerFired) -> Option<String> {
        match self.timers.get(&fired.key) {
            Some(armed) if armed.id == fired.id => {
                self.timers.remove(&fired.key);
                Some(fired.key)
            }
            _ => None,
        }
    }
}

impl Drop for AgentContext {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.handle.abort();
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

pub struct AgentRuntime<A> {
    agent: A,
    bus: EventBusClient,
    highlight: Highlight,
}

impl<A: Agent> AgentRuntime<A> {
    pub fn new(agent: A, bus: EventBusClient) -> Self {
        Self {
            agent,
            bus,
            highlight: Highlight::default(),
        }
    }

    pub fn with_highlight(mut self, highlight: Highlight) -> Self {
        self.highlight = highlight;
        self
    }

    pub fn bus(&self) -> &EventBusClient {
        &self.bus
    }

    /// Drive the agent until every shard reader has ended and no timer is
    /// pending, then hand the agent back.
    pub async fn run(self) -> A {
        let root = info_span!("agent", name = %self.agent.name());
        self.drive().instrument(root).await
    }

    async fn drive(self) -> A {
        let AgentRuntime {
            mut agent,
            bus,
            highlight,
        } = self;

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut ctx = AgentContext {
            agent_name: agent.name().to_string(),
            bus: bus.clone(),
            highlight,
            timers: HashMap::new(),
            next_timer: 0,
            timer_tx,
        };

        if let Err(error) = agent.on_start(&mut ctx).await {
            report(
                &mut agent,
                AgentFailure::Callback {
                    context: "startup".into(),
                    error,
                },
            );
        }

        let (sink, mut deliveries) = mpsc::channel(bus.policy().channel_capacity);
        let mut readers_open = match bus.consume(sink).await {
            Ok(shards) => {
                info!(stream = %bus.stream(), shards, "agent running");
                true
            }
            Err(err) => {
                report(&mut agent, AgentFailure::Consumption(err));
                false
            }
        };

        while readers_open || ctx.pending_timers() > 0 {
            tokio::select! {
                delivery = deliveries.recv(), if readers_open => match delivery {
                    Some(Delivery::Event(delivered)) => {
                        let span = ctx.highlight.span(&delivered.event);
                        let context = delivered.event.describe();
                        let result = agent
                            .on_event(delivered.event, delivered.arrived, &mut ctx)
                            .instrument(span.clone())
                            .await;
                        if let Err(error) = result {
                            span.in_scope(|| {
                                report(&mut agent, AgentFailure::Callback { context, error })
                            });
                        }
                    }
                    Some(Delivery::Failure(err)) => {
                        report(&mut agent, AgentFailure::Consumption(err));
                    }
                    None => {
                        info!("all shard readers have ended");
                        readers_open = false;
                    }
                },
                Some(fired) = timer_rx.recv() => {
                    let Some(key) = ctx.take_fired(fired) else {
                        continue;
                    };
                    let span = ctx.highlight.timer_span(&key);
                    let context = format!("timer '{key}'");
                    let result = agent
                        .on_timer(key, &mut ctx)
                        .instrument(span.clone())
                        .await;
                    if let Err(error) = result {
                        span.in_scope(|| {
                            report(&mut agent, AgentFailure::Callback { context, error })
                        });
                    }
                }
            }
        }

        info!("agent stopped");
        agent
    }
}

fn report<A: Agent>(agent: &mut A, failure: AgentFailure) {
    error!(error = %failure, "agent failure");
    agent.on_error(&failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{IteratorPosition, MemoryLog, ShardedLog};
    use crate::policy::ReadPolicy;
    use ema_protocol::EventKey;
    use std::sync::Arc;

    const STREAM: &str = "ema-event-stream";

    fn event(name: &str, session: &str) -> Event {
        Event::builder(name)
            .source("TestDriver")
            .field(EventKey::USER_SESSION_ID, session)
            .build()
    }

    #[test]
    fn test_highlight_matches_either_identity() {
        let highlight = Highlight::new(Some("u1".into()), Some(String::new()));
        assert!(highlight.matches(Some("u1"), None));
        assert!(highlight.matches(Some("u1"), Some("s9")));
        assert!(!highlight.matches(Some("u2"), Some("")));
        assert!(!Highlight::default().matches(Some("u1"), Some("s1")));
    }

    /// Replies to "ping" with "pong", fails on "bad", and reports what it saw.
    struct EchoAgent {
        seen: mpsc::UnboundedSender<String>,
        failures: Vec<String>,
        timers_fired: Vec<String>,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "EchoAgent"
        }

        async fn on_start(&mut self, ctx: &mut AgentContext) -> anyhow::Result<()> {
            assert!(ctx.schedule("warmup", Duration::from_secs(3)).is_some());
            assert!(ctx.schedule("warmup", Duration::from_secs(1)).is_none());
            Ok(())
        }

        async fn on_event(
            &mut self,
            event: Event,
            _arrived: DateTime<Utc>,
            ctx: &mut AgentContext,
        ) -> anyhow::Result<()> {
            match event.name() {
                "ping" => {
                    ctx.post(Event::builder("pong").build()).await?;
                }
                "bad" => anyhow::bail!("cannot handle this one"),
                _ => {}
            }
            let _ = self.seen.send(event.name().to_string());
            Ok(())
        }

        async fn on_timer(&mut self, key: String, _ctx: &mut AgentContext) -> anyhow::Result<()> {
            self.timers_fired.push(key);
            Ok(())
        }

        fn on_error(&mut self, failure: &AgentFailure) {
            self.failures.push(failure.to_string());
        }
    }

    fn echo_agent() -> (EchoAgent, mpsc::UnboundedReceiver<String>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (
            EchoAgent {
                seen,
                failures: Vec::new(),
                timers_fired: Vec::new(),
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_runtime_ends_after_pending_timers() {
        let (agent, _seen) = echo_agent();
        let bus = EventBusClient::offline(STREAM, ReadPolicy::default());

        let started = tokio::time::Instant::now();
        let agent = AgentRuntime::new(agent, bus).run().await;

        assert_eq!(agent.timers_fired, vec!["warmup"]);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_stamps_agent_name_and_errors_do_not_stop_processing() {
        let log = Arc::new(MemoryLog::with_stream(STREAM, 1));
        let bus = EventBusClient::online(log.clone(), STREAM, ReadPolicy::default());
        let (agent, mut seen) = echo_agent();

        let handle = tokio::spawn(AgentRuntime::new(agent, bus.clone()).run());
        // Let the reader open its iterator before anything is published.
        tokio::time::sleep(Duration::from_millis(100)).await;

        bus.publish(&event("bad", "s1")).await.unwrap();
        bus.publish(&event("ping", "s1")).await.unwrap();

        assert_eq!(seen.recv().await.as_deref(), Some("ping"));
        assert_eq!(seen.recv().await.as_deref(), Some("pong"));

        let iterator = log
            .shard_iterator(STREAM, "shardId-000000000000", IteratorPosition::TrimHorizon)
            .await
            .unwrap();
        let records = log.get_records(&iterator, 10).await.unwrap().records;
        let pong = Event::from_wire(records[2].data.as_bytes()).unwrap();
        assert_eq!(pong.name(), "pong");
        assert_eq!(pong.source(), Some("EchoAgent"));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_is_reported_not_fatal() {
        let log = Arc::new(MemoryLog::new());
        let bus = EventBusClient::online(log, "missing-stream", ReadPolicy::default());
        let (agent, _seen) = echo_agent();

        let agent = AgentRuntime::new(agent, bus).run().await;
        assert_eq!(agent.failures.len(), 1);
        assert!(agent.failures[0].contains("missing-stream"));
        assert_eq!(agent.timers_fired, vec!["warmup"]);
    }
}
