use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::config::Config;
use wakegate::dispatch::Dispatcher;
use wakegate::forward::{Forwarder, ForwarderConfig};
use wakegate::info::{PKG_NAME, VERSION};
use wakegate::proxy::ProxyServer;
use wakegate::wake::{Clock, MagicPacketSender, SystemClock, WakeGate};

/// Host-routed HTTP gateway that wakes sleeping backends with Wake-on-LAN
#[derive(Parser, Debug)]
#[command(name = "wakegate", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./wakegate.toml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Human-readable log lines instead of JSON
    #[arg(long)]
    no_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = Config::load(&args.config).map_err(|e| {
        error!(path = %args.config.display(), error = %e, "Failed to load configuration");
        e
    })?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let routes = config.validate(clock.now()).map_err(|e| {
        error!(path = %args.config.display(), error = %e, "Invalid configuration");
        e
    })?;

    info!(path = %args.config.display(), "Configuration loaded");

    print_startup_banner(&config);

    for route in routes.routes() {
        info!(
            service = route.id(),
            route = route.match_host(),
            proxy_to = %route.target(),
            wake = route.wake().is_some(),
            "Added proxy route"
        );
    }

    let broadcast = config
        .wake_broadcast_addr()
        .with_context(|| format!("invalid wake_broadcast '{}'", config.wake_broadcast))?;
    let gate = WakeGate::new(Arc::new(MagicPacketSender::new(broadcast)), clock);

    let forwarder = Forwarder::new(ForwarderConfig {
        max_idle_per_host: config.pool_max_idle_per_host,
        idle_timeout: config.pool_idle_timeout(),
        connect_timeout: config.connect_timeout(),
        request_timeout: config.request_timeout(),
    })?;

    let dispatcher = Arc::new(Dispatcher::new(routes, forwarder, gate).with_info_host(config.info_host()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(config.bind_addr(), dispatcher, shutdown_rx)
        .with_shutdown_timeout(config.shutdown_timeout())
        .bind()
        .await?;
    let server_handle = tokio::spawn(server.serve());

    shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    match server_handle.await? {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Shutdown did not complete cleanly");
            Err(e.into())
        }
    }
}

fn init_logging(args: &Args) {
    let directive = if args.verbose { "wakegate=debug" } else { "wakegate=info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive.parse().expect("valid log directive"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if args.no_json {
        subscriber.init();
    } else {
        subscriber.json().init();
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.bind_addr(),
        info_host = config.info_host().as_deref(),
        services = config.services.len(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        request_timeout_secs = config.request_timeout_secs,
        connect_timeout_secs = config.connect_timeout_secs,
        shutdown_timeout_secs = config.shutdown_timeout_secs,
        wake_broadcast = %config.wake_broadcast,
        "Timeouts and wake settings"
    );
}
