use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tokio_util::sync::CancellationToken;
use viaduct::{
    GracefulShutdown, HostRefresher, OriginPool, RelayServer, RouteTable, Router, SessionContext,
    SessionSettings, SystemResolver, TcpConnector,
    adapters::FileConfigProvider,
    config::RelayConfigValidator,
    core::router::HostTarget,
    metrics,
    ports::config_provider::ConfigProvider,
    tracing_setup,
    utils::PairingTracker,
};

/// How long in-flight exchanges may finish after a shutdown signal
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "relay.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "relay.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "relay.yaml")]
        config: String,
    },
    /// Start the relay (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "relay.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    // Determine the command to run
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config), // Default to serve with config from args
    };

    match command {
        "validate" => {
            return validate_config_command(&config_path).await;
        }
        "init" => {
            return init_config_command(&config_path).await;
        }
        "serve" => {
            // Continue with normal relay startup
        }
        _ => unreachable!(),
    }

    tracing_setup::init_tracing().context("Failed to initialize tracing")?;
    metrics::init_metrics().context("Failed to initialize metrics")?;

    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(&config_path).context("Failed to create config provider")?,
    );

    let config = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    RelayConfigValidator::validate(&config).map_err(|e| eyre!("Configuration is invalid:\n{e}"))?;

    let settings = SessionSettings::from_config(&config)?;
    let refresh_interval = humantime::parse_duration(&config.refresh_interval)
        .context("refresh_interval is not a duration")?;

    let router = Arc::new(Router::from_config(&config)?);
    let ctx = Arc::new(SessionContext {
        router: router.clone(),
        connector: Arc::new(TcpConnector::new(settings.connect_timeout)),
        pool: OriginPool::new(),
        pairings: Arc::new(PairingTracker::new()),
        settings,
    });

    let background_cancel = CancellationToken::new();

    // Periodic re-resolution of symbolic origin hosts
    let refresher = HostRefresher::new(router.clone(), Arc::new(SystemResolver), refresh_interval);
    let refresher_cancel = background_cancel.clone();
    tokio::spawn(async move {
        refresher.run(refresher_cancel).await;
    });

    // Busy-origin gauge sampled from the live route table
    let gauge_router = router.clone();
    let gauge_cancel = background_cancel.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = gauge_cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let table = gauge_router.table();
            let busy: usize = table
                .hosts()
                .values()
                .map(|entry| match entry.target() {
                    HostTarget::Set(set) => set
                        .members()
                        .iter()
                        .map(|member| member.slot.in_flight())
                        .sum(),
                    HostTarget::Single(_) => 0,
                })
                .sum();
            metrics::set_busy_origins(busy as u64);
        }
    });

    // Config Watcher Task
    let watcher_router = router.clone();
    let running_listen = config.listen.clone();
    let running_strategy = config.strategy.clone();
    let debounce_duration = Duration::from_secs(2);

    let mut notify_rx = config_provider.watch();
    let config_provider_for_watcher = config_provider.clone();
    let config_path_for_watcher = config_path.clone();

    tokio::spawn(async move {
        tracing::info!("Config watcher task started.");
        let mut last_reload_attempt_time = tokio::time::Instant::now();
        last_reload_attempt_time = last_reload_attempt_time
            .checked_sub(debounce_duration)
            .unwrap_or(last_reload_attempt_time);

        while notify_rx.recv().await.is_some() {
            // Debounce
            if last_reload_attempt_time.elapsed() < debounce_duration {
                tracing::info!("Debouncing config reload event. Still within cooldown period.");
                while notify_rx.try_recv().is_ok() {}
                continue;
            }
            last_reload_attempt_time = tokio::time::Instant::now();

            tracing::info!(
                "Attempting to reload configuration from {}",
                config_path_for_watcher
            );

            match config_provider_for_watcher.load_config().await {
                Ok(new_config) => {
                    if let Err(e) = RelayConfigValidator::validate(&new_config) {
                        tracing::error!(
                            "Reloaded configuration is invalid: {e}. Keeping old configuration."
                        );
                        while notify_rx.try_recv().is_ok() {}
                        continue;
                    }
                    match RouteTable::build(&new_config) {
                        Ok(table) => {
                            watcher_router.install(table);
                            tracing::info!("Route table reloaded.");
                        }
                        Err(e) => {
                            tracing::error!(
                                "Failed to build route table from new configuration: {e}. \
                                Keeping old table."
                            );
                        }
                    }
                    if new_config.listen != running_listen
                        || new_config.strategy != running_strategy
                    {
                        tracing::warn!(
                            "listen and strategy changes require a restart; \
                            keeping the running values"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to reload configuration: {}. Keeping old configuration.",
                        e
                    );
                }
            }
            while notify_rx.try_recv().is_ok() {}
        }
        tracing::info!("Config watcher task is shutting down.");
    });

    // Create graceful shutdown manager
    let graceful_shutdown = Arc::new(GracefulShutdown::new());

    // Start signal handler for graceful shutdown
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let accept_cancel = CancellationToken::new();
    let conn_cancel = CancellationToken::new();
    let server = RelayServer::new(
        ctx.clone(),
        config.listen.clone(),
        accept_cancel.clone(),
        conn_cancel.clone(),
    );

    tracing::info!(
        "Starting Viaduct relay on {} (strategy: {}, reuse: {})",
        config.listen,
        config.strategy,
        config.reuse
    );
    println!(
        "Viaduct relay listening on {} (strategy: {}, reuse: {})",
        config.listen, config.strategy, config.reuse
    );

    tokio::select! {
        result = server.run() => {
            result.context("Server error")?;
        }
        shutdown_reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", shutdown_reason);
            accept_cancel.cancel();
            if server.drain(DRAIN_GRACE).await {
                tracing::info!("All exchanges drained");
            } else {
                tracing::warn!(grace = ?DRAIN_GRACE, "Drain grace elapsed with exchanges still active");
            }
            conn_cancel.cancel();
            background_cancel.cancel();
            tracing::info!("Graceful shutdown completed");
        }
    }

    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use viaduct::config::loader::load_config;

    println!("🔍 Validating configuration file: {config_path}");

    // First check if file exists and is readable
    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    // Try to parse the configuration
    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    // Validate the configuration
    match RelayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen);
            println!("   • Rules: {}", config.rules.len());
            println!("   • Hosts: {}", config.hosts.len());
            println!("   • Aliases: {}", config.aliases.len());
            println!("   • Strategy: {}", config.strategy);
            println!("   • Connection Reuse: {}", config.reuse);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all origin URLs start with http:// or https://");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            println!("   • Use humantime durations for timeouts (e.g., '10s', '5m')");
            println!("   • Set strategy to 'robin' or 'smart'");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Viaduct relay configuration

# The address the front listener binds
listen: "127.0.0.1:8080"

# Host map: request host -> origin URL, or a tuple balanced across
hosts:
  app.test: "http://127.0.0.1:3000"
  # tuple.test:
  #   - "http://127.0.0.1:3001"
  #   - "http://127.0.0.1:3002"

# Alternate names resolving to host entries (at most two hops)
# aliases:
#   www.app.test: "app.test"

# Ordered regex rules, consulted before host lookup; $1, $2... substitute captures
# rules:
#   - pattern: "^http://files\\.test/(.*)$"
#     target: "http://127.0.0.1:9000/$1"

# Static fallback origin when no rule or host matches
# forward: "http://127.0.0.1:3000"

# Balancing strategy for origin tuples: "robin" or "smart"
strategy: "robin"

# Pool finished backend connections for reuse
reuse: true

# Backend timeouts
connect_timeout: "10s"
recv_timeout: "90s"

# Re-resolve symbolic origin hosts at this interval; "0s" resolves once
refresh_interval: "5m"

# Re-encode eligible response bodies: "chunked", "gzip" or "deflate"
# compress: "gzip"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'viaduct serve --config {config_path}' to start the relay");
    Ok(())
}
