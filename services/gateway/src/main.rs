use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use gateway::{App, Backend, Config, build_backends, create_router};
use pipeline::PgScoreStore;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "Real-time leaderboard gateway")]
struct Args {
    /// Override LEADERBOARD_BACKEND
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Do not start the synthetic score generator
    #[arg(long)]
    no_generator: bool,

    /// Run database migrations and exit
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env().context("reading LEADERBOARD_* configuration")?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    init_tracing(config.is_production());

    if args.migrate {
        let store = PgScoreStore::connect(
            &config.database_url,
            config.database_max_connections,
            config.op_timeout(),
        )
        .await?;
        store.migrate().await?;
        info!("Migrations applied");
        return Ok(());
    }

    info!(backend = ?config.backend, "Starting leaderboard gateway");

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid listen address")?;
    let grace = config.shutdown_grace();

    let backends = build_backends(&config).await?;
    let app = App::start(config, backends, !args.no_generator).await?;
    let router = create_router(app.state.clone());

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    let trigger = app.trigger();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends open websocket sessions so the server can drain.
            trigger.trigger();
        })
        .await?;

    app.stop(grace).await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
