use clap::Parser;
use radius_aaa::{Config, Server, StaticLoader};
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// RADIUS AAA server with UDP, RPC and push-driven CoA listeners
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "radius_aaa")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit (doesn't start server)
    #[arg(long)]
    validate: bool,
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing("info");

            if cli.validate {
                eprintln!("Configuration validation failed: {}", e);
                process::exit(1);
            }

            warn!(path = %cli.config_path, error = %e, "Could not load config file");
            info!(path = %cli.config_path, "Creating example configuration");

            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!(error = %e, "Error creating example config");
                process::exit(1);
            }

            info!("Please edit {} and restart the server", cli.config_path);
            process::exit(0);
        }
    };

    if cli.validate {
        if let Err(e) = config.validate() {
            eprintln!("Configuration validation failed: {}", e);
            process::exit(1);
        }

        println!("Configuration validated successfully");
        println!("  Dedup window: {} ms", config.dedup_window_ms);
        println!("  Filters: {}", config.filters.join(", "));
        if config.uses_default_secret() {
            println!("  Warning: the default shared secret is in use");
        }
        for listener in &config.listeners {
            let modules: Vec<&str> = listener.modules.iter().map(|m| m.name.as_str()).collect();
            println!(
                "  Listener {} ({}): {}",
                listener.name,
                listener.listener_type,
                modules.join(" -> ")
            );
        }
        process::exit(0);
    }

    init_tracing(config.log_level.as_deref().unwrap_or("info"));

    info!("RADIUS AAA server v{}", env!("CARGO_PKG_VERSION"));
    info!(path = %cli.config_path, "Loaded configuration");
    if config.clients.is_empty() {
        warn!("No clients configured; the client allowlist accepts any address");
    }

    let server = match Server::new(config, &StaticLoader::with_builtins()) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "Failed to create server");
            process::exit(1);
        }
    };

    if server.start_and_wait().await {
        info!("Server started, press Ctrl+C to stop");
    } else {
        warn!("Server started with failed listeners");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    server.stop().await;
}
