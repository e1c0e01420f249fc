use clap::Parser;
use cofund_adapters::MockGateway;
use cofund_core::StorageConfig;
use cofund_service::config::ServiceConfig;
use cofund_service::jobs::JobScheduler;
use cofund_service::{build_router, ServiceState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cofundd", version, about = "Co-funded server settlement service")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "COFUND_CONFIG")]
    config: Option<String>,

    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(short, long, env = "COFUND_LISTEN_ADDR")]
    listen: Option<SocketAddr>,

    /// PostgreSQL url; switches storage to postgres when set.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "COFUND_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,

    /// Log level
    #[arg(long, env = "COFUND_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "COFUND_LOG_JSON")]
    json: bool,

    /// Serve the API without the background jobs.
    #[arg(long, default_value_t = false)]
    no_jobs: bool,
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(level) = cli.log_level.clone() {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if let Some(database_url) = cli.database_url.clone() {
        config.engine.storage = StorageConfig::postgres(database_url, cli.pg_max_connections);
    }

    init_tracing(&config.logging.level, config.logging.json);

    let gateway = Arc::new(MockGateway::new(config.gateway.webhook_secret.clone()));
    tracing::warn!("using the in-process mock payment gateway");

    let state = ServiceState::bootstrap(
        config.engine.clone(),
        gateway,
        &config.server.admin_token,
    )
    .await?;
    info!(
        storage = config.engine.storage.label(),
        boost_cap = config.engine.boost_cap,
        "cofund engine ready"
    );

    let jobs = JobScheduler::new(state.engine.clone(), config.jobs.clone());
    let job_handles = if config.jobs.enabled && !cli.no_jobs {
        jobs.start()
    } else {
        Vec::new()
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!("cofund-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("shutting down background jobs");
    jobs.stop();
    for handle in job_handles {
        handle.await?;
    }

    Ok(())
}
