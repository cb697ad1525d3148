//! Entrypoint: parses the CLI, loads the configuration, wires the
//! NetworkManager/ModemManager D-Bus clients into an [`Engine`], and runs
//! the 5 s tick loop until a signal requests shutdown.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use wan_failover::config::{Config, CONFIG_PATH};
use wan_failover::engine::Engine;
use wan_failover::modem_client::ModemManagerClient;
use wan_failover::net_client::networkmanager::NetworkManagerClient;
use wan_failover::net_client::NetClient;
use wan_failover::EXIT_NOT_CONFIGURED;

const TICK_PERIOD: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "wan-failover", about = "Failover connection manager for multi-WAN gateways")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "WAN_FAILOVER_CONFIG", default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug logging regardless of the config file's `debug` flag.
    #[arg(long, env = "WAN_FAILOVER_DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let exit_code = run(&cli).await;
    std::process::exit(exit_code);
}

async fn run(cli: &Cli) -> i32 {
    let (resource, dbus_conn) = match dbus_tokio::connection::new_system_sync() {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to connect to the system D-Bus: {}", e);
            return EXIT_NOT_CONFIGURED;
        }
    };
    tokio::spawn(async move {
        let err = resource.await;
        error!("D-Bus connection lost: {}", err);
    });

    let net: Box<dyn NetClient> = Box::new(NetworkManagerClient::new(dbus_conn.clone()));

    let config = match Config::load(&cli.config, net.as_ref()).await {
        Ok(config) => config,
        Err(e) => {
            error!("loading {}: {}", cli.config.display(), e);
            return EXIT_NOT_CONFIGURED;
        }
    };

    if !config.has_connections() {
        info!("nothing to manage");
        return 0;
    }

    let modem = Box::new(ModemManagerClient::new(dbus_conn.clone()));
    let engine = Engine::new(net, modem, &config);

    let mut shutdown = shutdown_signal();
    let mut reload = reload_signal();

    let mut config = config;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK_PERIOD) => {
                engine.tick(&config).await;
            }
            _ = shutdown.recv() => {
                info!("shutting down");
                break;
            }
            _ = reload.recv() => {
                match Config::load(&cli.config, engine.net_client()).await {
                    Ok(new_config) => {
                        info!("configuration reloaded");
                        config = new_config;
                    }
                    Err(e) => error!("reload failed, keeping previous configuration: {}", e),
                }
            }
        }
    }

    0
}

fn init_logging(force_debug: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if force_debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

/// Wraps SIGINT/SIGTERM into a single-slot channel the select loop polls.
fn shutdown_signal() -> tokio::sync::mpsc::Receiver<()> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        let _ = tx.send(()).await;
    });
    rx
}

/// SIGHUP requests a configuration reload at the next tick boundary rather
/// than applying it immediately out-of-band.
fn reload_signal() -> tokio::sync::mpsc::Receiver<()> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler");
        loop {
            sighup.recv().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}
