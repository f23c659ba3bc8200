//! actix-web implementation of the listener backend.

use crate::{
    api::Api,
    services::{
        lifecycle::{ListenerBackend, ListenerKind},
        network::NetInterface,
        store::KeyValueStore,
    },
};
use actix_files::Files;
use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, info};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::task::JoinHandle;

type ServerTask = JoinHandle<Result<(), io::Error>>;

pub struct ActixBackend<Iface, Store> {
    api: Api<Iface, Store>,
    servers: Mutex<HashMap<ListenerKind, (ServerHandle, ServerTask)>>,
}

impl<Iface, Store> ActixBackend<Iface, Store>
where
    Iface: NetInterface + Send + Sync + 'static,
    Store: KeyValueStore + 'static,
{
    pub fn new(api: Api<Iface, Store>) -> Self {
        Self {
            api,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self, kind: ListenerKind) -> bool {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    fn run_server(
        &self,
        address: SocketAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<(SocketAddr, ServerHandle, ServerTask)> {
        let api = self.api.clone();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(Data::new(api.clone()))
                .configure(Api::<Iface, Store>::routes)
                .service(Files::new("/static", api.static_dir.clone()))
        })
        .disable_signals();

        let server = match tls {
            Some(tls) => server
                .bind_rustls_0_23(address, Arc::unwrap_or_clone(tls))
                .with_context(|| format!("failed to bind {address} with tls"))?,
            None => server
                .bind(address)
                .with_context(|| format!("failed to bind {address}"))?,
        };

        let local_addr = server
            .addrs()
            .first()
            .copied()
            .ok_or_else(|| anyhow!("no address bound for {address}"))?;

        let server = server.run();
        let handle = server.handle();

        Ok((local_addr, handle, tokio::spawn(server)))
    }
}

impl<Iface, Store> ListenerBackend for ActixBackend<Iface, Store>
where
    Iface: NetInterface + Send + Sync + 'static,
    Store: KeyValueStore + 'static,
{
    async fn start_listener(
        &self,
        kind: ListenerKind,
        address: SocketAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<SocketAddr> {
        ensure!(!self.is_running(kind), "{kind} listener already running");
        ensure!(
            (kind == ListenerKind::Https) == tls.is_some(),
            "{kind} listener needs {} tls config",
            if tls.is_some() { "no" } else { "a" }
        );

        let (local_addr, handle, task) = self.run_server(address, tls)?;

        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, (handle, task));

        info!("{kind} server bound to {local_addr}");
        Ok(local_addr)
    }

    async fn stop_listener(&self, kind: ListenerKind) -> Result<()> {
        let server = self
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);

        let Some((handle, task)) = server else {
            debug!("{kind} server not running");
            return Ok(());
        };

        handle.stop(true).await;

        match task.await {
            Ok(Ok(())) => debug!("{kind} server stopped normally"),
            Ok(Err(e)) => return Err(e).context(format!("{kind} server stopped with error")),
            Err(e) => return Err(anyhow!("{kind} server task panicked: {e}")),
        }

        Ok(())
    }
}
