use flexpg_mcp_server::config::{Config, Transport};
use flexpg_mcp_server::server::McpServer;
use flexpg_mcp_server::Result;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get the log level
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            // Initialize basic tracing for error reporting
            tracing_subscriber::fmt().with_writer(std::io::stderr).init();
            error!("Failed to load configuration: {}", e.user_message());
            error!("Configuration error details: {}", e.detailed_message());
            return Err(e);
        }
    };

    let log_level = match config.server.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    // stdout carries the stdio transport, so logs always go to stderr
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Flexible Server MCP server");
    info!("Log level set to: {}", config.server.log_level);
    info!("Server: {} as {}", config.database.host, config.database.user);
    match &config.database.database {
        Some(database) => info!("Fixed database: {}", database),
        None => info!("No fixed database, tools take a database argument"),
    }
    match config.server.transport {
        Transport::Stdio => info!("Transport: stdio"),
        Transport::Http => info!("Transport: http on port {}", config.server.port),
    }

    let server = McpServer::new(config)?;

    let shutdown_signal = setup_shutdown_signal();
    let server_for_shutdown = server.clone();

    tokio::select! {
        result = server.start() => {
            match result {
                Ok(_) => {
                    info!("Server stopped normally");
                    Ok(())
                }
                Err(e) => {
                    error!("Server failed: {}", e.user_message());
                    error!("Server error details: {}", e.detailed_message());
                    Err(e)
                }
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received, stopping server gracefully");

            if let Err(e) = server_for_shutdown.shutdown().await {
                error!("Error during graceful shutdown: {}", e.user_message());
            }

            info!("Server shutdown complete");
            Ok(())
        }
    }
}

/// Set up graceful shutdown signal handling
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
