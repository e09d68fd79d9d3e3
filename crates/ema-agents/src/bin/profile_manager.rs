use ema_agents::{SystemClock, UserProfileManagerAgent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ema_bus::cli::agent_main(UserProfileManagerAgent::new(SystemClock)).await
}
