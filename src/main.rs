use anyhow::{Context, Result};
use device_bringup::{
    api::Api,
    config::{AppConfig, NetworkSettings},
    server::ActixBackend,
    services::{
        certificate::{CredentialProvisioner, CredentialSet, TlsCredentialStore},
        lifecycle::{ServerConfig, ServiceController},
        network::{
            AcquisitionError, AcquisitionMode, AddressAcquisitionEngine, AddressingMode,
            NetworkConfig, NetworkdInterface,
        },
        store::{ConfigStore, FileKeyValueStore, StoreError},
    },
};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use rustls::crypto::{CryptoProvider, ring::default_provider};
use std::{io::Write, net::Ipv4Addr, sync::Arc};
use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    sync::broadcast,
    time,
};

type Store = ConfigStore<FileKeyValueStore>;
type Controller = ServiceController<
    NetworkdInterface,
    ActixBackend<NetworkdInterface, FileKeyValueStore>,
    TlsCredentialStore,
>;

enum ShutdownReason {
    Restart,
    Retry,
    Shutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Restart => write!(f, "restarting bring-up"),
            ShutdownReason::Retry => write!(f, "retrying bring-up"),
            ShutdownReason::Shutdown => write!(f, "shutting down"),
        }
    }
}

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    debug!("configuration: {config:?}");

    let (restart_tx, mut restart_rx) = broadcast::channel(1);
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let iface = Arc::new(NetworkdInterface::new(
        config.network.interface.clone(),
        config.network.network_dir.clone(),
    ));
    let engine = Arc::new(AddressAcquisitionEngine::new(iface));
    let store = Arc::new(ConfigStore::new(
        FileKeyValueStore::new(&config.paths.store_dir).context("failed to open config store")?,
    ));

    let api = Api::new(
        Arc::clone(&engine),
        Arc::clone(&store),
        restart_tx,
        config.paths.static_dir.clone(),
    );
    let controller = ServiceController::new(
        engine,
        ActixBackend::new(api),
        CredentialProvisioner::new(Arc::new(TlsCredentialStore::new())),
    );

    let credentials = if config.server.enable_https {
        Some(CredentialSet::load(&config.certificate).context("failed to load TLS credentials")?)
    } else {
        None
    };

    let server_config = ServerConfig {
        http_port: config.server.http_port,
        https_port: config.server.https_port,
        enable_http: config.server.enable_http,
        enable_https: config.server.enable_https,
        bind_address: config.server.bind_address,
        credentials,
    };

    while let ShutdownReason::Restart | ShutdownReason::Retry = run_until_shutdown(
        &config.network,
        &controller,
        &store,
        &server_config,
        &mut restart_rx,
        &mut sigterm,
    )
    .await?
    {}

    info!("shutdown complete");
    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    CryptoProvider::install_default(default_provider())
        .map_err(|_| anyhow::anyhow!("crypto provider already installed"))?;

    Ok(())
}

async fn run_until_shutdown(
    network: &NetworkSettings,
    controller: &Controller,
    store: &Store,
    server_config: &ServerConfig,
    restart_rx: &mut broadcast::Receiver<()>,
    sigterm: &mut Signal,
) -> Result<ShutdownReason> {
    info!("starting bring-up");

    let reason = match bring_up(network, controller, store, server_config).await {
        Ok(address) => {
            info!("services running on {address}");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    debug!("ctrl-c received");
                    ShutdownReason::Shutdown
                },
                _ = sigterm.recv() => {
                    debug!("SIGTERM received");
                    ShutdownReason::Shutdown
                },
                _ = restart_rx.recv() => {
                    debug!("restart requested");
                    ShutdownReason::Restart
                },
                _ = controller.wait_for_loss() => {
                    if network.reacquire_on_loss {
                        warn!("address lost, acquiring again");
                        ShutdownReason::Restart
                    } else {
                        error!("address lost");
                        ShutdownReason::Shutdown
                    }
                },
            }
        }
        Err(e) => {
            error!("bring-up failed: {e:#}");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownReason::Shutdown,
                _ = sigterm.recv() => ShutdownReason::Shutdown,
                _ = restart_rx.recv() => ShutdownReason::Restart,
                _ = time::sleep(network.retry_delay) => ShutdownReason::Retry,
            }
        }
    };

    info!("{reason}");

    if let Err(e) = controller.stop().await {
        error!("failed to stop services: {e:#}");
    }

    Ok(reason)
}

/// Acquire an address, persist it and start the listeners on it.
async fn bring_up(
    network: &NetworkSettings,
    controller: &Controller,
    store: &Store,
    server_config: &ServerConfig,
) -> Result<Ipv4Addr> {
    let engine = controller.engine();
    let mode = preferred_mode(network, store);

    let acquired = match (
        engine.acquire(mode, network.dhcp_timeout).await,
        &network.static_addressing,
    ) {
        (Ok(acquired), _) => {
            persist(store, &acquired);
            acquired
        }
        (Err(AcquisitionError::Timeout { .. }), Some(addressing)) if network.fallback_to_static => {
            warn!("DHCP timed out, falling back to static addressing");
            engine
                .acquire(
                    AcquisitionMode::Static(addressing.clone()),
                    network.dhcp_timeout,
                )
                .await
                .context("static fallback failed")?
        }
        (Err(e), _) => return Err(e).context("address acquisition failed"),
    };

    debug!("acquired network config: {acquired:?}");

    controller
        .start(server_config)
        .await
        .context("failed to start services")?;

    controller
        .bound_address()
        .await
        .context("failed to get bound address")
}

/// Stored configuration wins over the configured default mode.
fn preferred_mode(network: &NetworkSettings, store: &Store) -> AcquisitionMode {
    match store.load() {
        Ok(stored) => {
            info!("using stored {} configuration", stored.mode);
            AcquisitionMode::from(&stored)
        }
        Err(StoreError::NotFound) => default_mode(network),
        Err(e) => {
            warn!("ignoring stored network config: {e:#}");
            default_mode(network)
        }
    }
}

fn default_mode(network: &NetworkSettings) -> AcquisitionMode {
    match &network.static_addressing {
        Some(addressing) if network.mode == AddressingMode::Static => {
            AcquisitionMode::Static(addressing.clone())
        }
        _ => AcquisitionMode::Dhcp,
    }
}

fn persist(store: &Store, config: &NetworkConfig) {
    if let Err(e) = store.save(config) {
        warn!("failed to persist network config: {e:#}");
    }
}
