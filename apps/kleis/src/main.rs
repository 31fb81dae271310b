use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use kleis_common::{KleisConfig, now_ms};

#[derive(Debug, Parser)]
#[command(name = "kleis", version, about = "Multi-tenant LLM reverse proxy")]
struct Cli {
    #[arg(long, env = "KLEIS_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "KLEIS_PORT", default_value_t = 8787)]
    port: u16,
    /// Static bearer for the /admin surface.
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: String,
    #[arg(long, env = "KLEIS_DSN", default_value = "sqlite://kleis.db?mode=rwc")]
    dsn: String,
    /// Origin advertised in the model registry; defaults to host:port.
    #[arg(long, env = "KLEIS_PUBLIC_ORIGIN")]
    public_origin: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let public_origin = cli
        .public_origin
        .unwrap_or_else(|| format!("http://{}:{}", cli.host, cli.port));
    let config = KleisConfig {
        host: cli.host,
        port: cli.port,
        admin_token: cli.admin_token,
        dsn: cli.dsn,
        public_origin,
    };

    let app_state = kleis_core::bootstrap(config).await?;

    // Expired OAuth states are consumed on use; sweep the leftovers.
    let gc_repository = app_state.repository.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(600));
        loop {
            ticker.tick().await;
            match gc_repository.delete_expired_oauth_states(now_ms()).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "swept expired oauth states"),
                Err(err) => tracing::warn!(error = %err, "oauth state sweep failed"),
            }
        }
    });

    let bind = format!("{}:{}", app_state.config.host, app_state.config.port);
    let app = axum::Router::new()
        .merge(kleis_router::proxy_router(app_state.clone()))
        .nest("/admin", kleis_router::admin_router(app_state.clone()));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "kleis listening");
    axum::serve(listener, app).await?;
    Ok(())
}
