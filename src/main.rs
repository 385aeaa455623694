use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use h2relay::config::Config;
use h2relay::server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut config = Config::from_env()?;
    config.apply_args(std::env::args().skip(1))?;

    info!(
        version = h2relay::VERSION,
        bind = %config.bind_addr(),
        upstream = %format!("{}:{}", config.upstream_host, config.upstream_port),
        "starting h2relay"
    );

    server::run(Arc::new(config)).await
}
