//! Shared entry point of the agent binaries.

use std::future::Future;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::runtime::{Agent, AgentRuntime};

#[derive(Debug, Parser)]
pub struct AgentCli {
    /// Print the agent's name and exit
    #[arg(long)]
    pub name: bool,

    /// Run without the event log: posts are only logged, nothing is consumed
    #[arg(long)]
    pub nokinesis: bool,
}

/// Install the global `fmt` subscriber. `RUST_LOG` wins, `info` otherwise.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, shutting down");
}

/// Run `runtime` until `shutdown` resolves.
///
/// An online agent outlives its shard readers: once they have all ended the
/// process idles until shutdown. An offline agent returns as soon as its
/// runtime has nothing left to do.
pub async fn supervise<A: Agent>(runtime: AgentRuntime<A>, shutdown: impl Future<Output = ()>) {
    let offline = runtime.bus().is_offline();
    tokio::pin!(shutdown);

    tokio::select! {
        _ = runtime.run() => {
            if offline {
                return;
            }
            warn!("no shard is being read any more; waiting for shutdown");
            shutdown.await;
        }
        _ = &mut shutdown => {}
    }
}

/// Parse the command line, load settings and run `agent` until the process
/// is told to stop.
pub async fn agent_main<A: Agent>(agent: A) -> anyhow::Result<()> {
    let cli = AgentCli::parse();
    if cli.name {
        println!("{}", agent.name());
        return Ok(());
    }

    init_tracing();

    let mut settings = Settings::load()?;
    if cli.nokinesis {
        settings.bus.offline = true;
    }

    info!(
        agent = %agent.name(),
        stream = %settings.bus.stream,
        endpoint = %settings.bus.endpoint,
        offline = settings.bus.offline,
        "agent starting"
    );

    let bus = settings.bus.connect();
    let runtime = AgentRuntime::new(agent, bus).with_highlight(settings.highlight());
    supervise(runtime, shutdown_signal()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EventBusClient;
    use crate::log::MemoryLog;
    use crate::policy::ReadPolicy;
    use crate::runtime::{AgentContext, AgentFailure};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use ema_protocol::Event;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    const STREAM: &str = "ema-event-stream";

    struct QuietAgent {
        failures: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Agent for QuietAgent {
        fn name(&self) -> &str {
            "QuietAgent"
        }

        async fn on_event(
            &mut self,
            _event: Event,
            _arrived: DateTime<Utc>,
            _ctx: &mut AgentContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_error(&mut self, failure: &AgentFailure) {
            let _ = self.failures.send(failure.to_string());
        }
    }

    fn quiet_agent() -> (QuietAgent, mpsc::UnboundedReceiver<String>) {
        let (failures, rx) = mpsc::unbounded_channel();
        (QuietAgent { failures }, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_agent_outlives_a_closed_shard() {
        let log = Arc::new(MemoryLog::with_stream(STREAM, 1));
        let bus = EventBusClient::online(log.clone(), STREAM, ReadPolicy::default());
        let (agent, _failures) = quiet_agent();
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(supervise(AgentRuntime::new(agent, bus), async move {
            let _ = stopped.await;
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The only shard closes, so its reader finishes.
        log.split_shard(STREAM, "shardId-000000000000").await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());

        stop.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_agent_outlives_a_discovery_failure() {
        let log = Arc::new(MemoryLog::new());
        let bus = EventBusClient::online(log, "missing-stream", ReadPolicy::default());
        let (agent, mut failures) = quiet_agent();
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(supervise(AgentRuntime::new(agent, bus), async move {
            let _ = stopped.await;
        }));

        let failure = failures.recv().await.unwrap();
        assert!(failure.contains("missing-stream"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());

        stop.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_agent_returns_when_idle() {
        let bus = EventBusClient::offline(STREAM, ReadPolicy::default());
        let (agent, _failures) = quiet_agent();

        supervise(AgentRuntime::new(agent, bus), std::future::pending()).await;
    }

    #[test]
    fn test_flags() {
        let cli = AgentCli::try_parse_from(["agent", "--nokinesis"]).unwrap();
        assert!(cli.nokinesis);
        assert!(!cli.name);

        let cli = AgentCli::try_parse_from(["agent", "--name"]).unwrap();
        assert!(cli.name);
    }

    #[test]
    fn test_unknown_flags_are_rejected() {
        assert!(AgentCli::try_parse_from(["agent", "--verbose"]).is_err());
    }
}
