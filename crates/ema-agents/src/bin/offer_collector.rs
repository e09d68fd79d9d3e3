use ema_agents::OfferCollectorAgent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ema_bus::cli::agent_main(OfferCollectorAgent::new()).await
}
