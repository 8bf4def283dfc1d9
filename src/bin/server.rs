use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::time::Instant;
use webcounter::config::AppConfig;
use webcounter::http::app_server::AppServer;
use webcounter::telemetry;
use webcounter::CounterEngine;

#[derive(Parser)]
#[command(name = "webcounter-server", about = "Webcounter HTTP Server")]
struct Cli {
    /// Path to config file (environment variables override it)
    #[arg(long)]
    config: Option<String>,

    /// Run one reconciliation cycle and exit instead of serving
    #[arg(long)]
    flush_now: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let now = Instant::now();
    telemetry::init_telemetry().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    config.validate()?;
    tracing::info!(
        config = cli.config.as_deref().unwrap_or("<env only>"),
        "Configuration loaded"
    );

    if cli.flush_now {
        let result = run_flush_now(config).await;
        telemetry::shutdown_telemetry();
        return result;
    }

    let engine = CounterEngine::from_config(&config).await?;
    tracing::info!("Engine initialized");

    let app = AppServer::new(engine);
    let engine = app.engine.clone();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server started in {}ms", now.elapsed().as_millis());
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown())
        .await?;

    if let Err(e) = engine.shutdown().await {
        tracing::error!("Error during engine shutdown: {}", e);
    }

    tracing::info!("Server shutdown complete");
    telemetry::shutdown_telemetry();

    Ok(())
}

async fn run_flush_now(mut config: AppConfig) -> Result<()> {
    config.flush.enabled = false;
    let engine = CounterEngine::from_config(&config).await?;

    let outcome = engine.flush(Utc::now()).await;
    engine.shutdown().await?;

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.sites_failed > 0 {
        anyhow::bail!("{} site(s) failed to reconcile", report.sites_failed);
    }
    Ok(())
}

async fn shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Shutdown signal received, stopping server...");
}
