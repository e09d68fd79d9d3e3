use ema_agents::EventStreamWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ema_bus::cli::agent_main(EventStreamWatcher::new()).await
}
