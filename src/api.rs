use crate::{
    http_client::{handle_service_result, json_response},
    services::{
        decoder::decode_network_config,
        lifecycle::{ServiceError, bound_address},
        network::{AddressAcquisitionEngine, BringupState, NetInterface, NetworkConfig},
        store::{ConfigStore, KeyValueStore},
    },
};
use actix_files::NamedFile;
use actix_web::{HttpResponse, Responder, web};
use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::{net::Ipv4Addr, path::PathBuf, sync::Arc};
use tokio::sync::broadcast;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthcheckInfo {
    pub version: &'static str,
    pub state: BringupState,
    pub address: Option<Ipv4Addr>,
}

pub struct Api<Iface, Store> {
    pub engine: Arc<AddressAcquisitionEngine<Iface>>,
    pub store: Arc<ConfigStore<Store>>,
    pub restart_tx: broadcast::Sender<()>,
    pub static_dir: PathBuf,
}

impl<Iface, Store> Clone for Api<Iface, Store> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            store: Arc::clone(&self.store),
            restart_tx: self.restart_tx.clone(),
            static_dir: self.static_dir.clone(),
        }
    }
}

impl<Iface, Store> Api<Iface, Store>
where
    Iface: NetInterface + Send + Sync + 'static,
    Store: KeyValueStore + 'static,
{
    pub fn new(
        engine: Arc<AddressAcquisitionEngine<Iface>>,
        store: Arc<ConfigStore<Store>>,
        restart_tx: broadcast::Sender<()>,
        static_dir: PathBuf,
    ) -> Self {
        Api {
            engine,
            store,
            restart_tx,
            static_dir,
        }
    }

    /// Register the handlers on an app or scope.
    pub fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/", web::get().to(Self::index))
            .route("/healthcheck", web::get().to(Self::healthcheck))
            .route("/network", web::get().to(Self::network_config))
            .route("/network", web::post().to(Self::set_network_config));
    }

    pub async fn index(api: web::Data<Self>) -> actix_web::Result<NamedFile> {
        debug!("index() called");

        Ok(NamedFile::open(api.static_dir.join("index.html"))?)
    }

    pub async fn healthcheck(api: web::Data<Self>) -> impl Responder {
        debug!("healthcheck() called");

        let info = HealthcheckInfo {
            version: env!("CARGO_PKG_VERSION"),
            state: api.engine.state(),
            address: bound_address(&api.engine).await.ok(),
        };

        match info.address {
            Some(_) => json_response(&info, "HealthcheckInfo"),
            None => HttpResponse::ServiceUnavailable().json(&info),
        }
    }

    pub async fn network_config(api: web::Data<Self>) -> impl Responder {
        debug!("network_config() called");

        handle_service_result(api.current_network_config().await, "network_config")
    }

    pub async fn set_network_config(body: String, api: web::Data<Self>) -> impl Responder {
        debug!("set_network_config() called");

        let config = match decode_network_config(&body) {
            Ok(config) => config,
            Err(e) => return handle_service_result::<(), _>(Err(e), "set_network_config"),
        };

        handle_service_result(api.apply_network_config(&config), "set_network_config")
    }

    async fn current_network_config(&self) -> Result<NetworkConfig, ServiceError> {
        bound_address(&self.engine).await?;
        self.engine.current_config().ok_or(ServiceError::NotBound)
    }

    /// Persist a requested configuration and restart the bring-up with it.
    fn apply_network_config(&self, config: &NetworkConfig) -> Result<()> {
        self.store
            .save(config)
            .context("failed to persist network config")?;

        info!("network config changed to {}, restarting bring-up", config.mode);

        self.restart_tx
            .send(())
            .context("failed to send restart signal")?;

        Ok(())
    }
}
