// src/main.rs

use axum::serve;
use gemini_key_pool::{
    cli::{self, Cli, Commands, ConfigCommands, KeyCommands},
    run, AppError,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!(signal = "Ctrl+C", "Received signal. Initiating graceful shutdown...") },
        () = terminate => { info!(signal = "Terminate", "Received signal. Initiating graceful shutdown...") },
    }
}

fn init_tracing(log_level: &str, json_logs: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn serve_app(config_path: Option<PathBuf>) -> Result<(), AppError> {
    let (app, config) = run(config_path).await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| {
            AppError::config_validation(format!("Invalid listen address: {e}"), Some("server.host"))
        })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(server.address = %addr, error = ?e, "Failed to bind to address. Exiting.");
        AppError::from(e)
    })?;
    info!(server.address = %addr, "Server listening");

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = ?e, "Server run loop encountered an error. Exiting.");
            AppError::from(e)
        })?;

    info!("Server shut down gracefully.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse_args();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command() {
        Commands::Serve => serve_app(cli.config).await,
        Commands::Keys {
            action: KeyCommands::Status,
        } => {
            println!("{}", cli::keys_status(cli.config).await?);
            Ok(())
        }
        Commands::Keys {
            action: KeyCommands::Reset { yes },
        } => {
            if !yes {
                warn!("Refusing to reset counters without --yes");
                return Err(AppError::invalid_request("pass --yes to reset all key counters"));
            }
            let removed = cli::keys_reset(cli.config).await?;
            println!("Removed {removed} counter(s)");
            Ok(())
        }
        Commands::Config {
            action: ConfigCommands::Validate,
        } => {
            println!("{}", cli::config_validate(cli.config)?);
            Ok(())
        }
    }
}
