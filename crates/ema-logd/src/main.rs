use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use ema_logd::{LogdSettings, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = LogdSettings::load()?;
    let log = Arc::new(settings.build_log());

    let addr = settings.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        stream = %settings.stream,
        shards = settings.shards,
        reads_per_second = ?settings.reads_per_second,
        "ema-logd listening"
    );

    axum::serve(listener, build_router(log)).await?;
    Ok(())
}
