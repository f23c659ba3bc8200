//! Service lifecycle controller.
//!
//! Starts the HTTP and HTTPS listeners once the interface is bound and tears
//! them down again on shutdown, reconfiguration or loss of the address.
//! Starting is all-or-nothing: if one requested listener cannot be brought up
//! the ones already started are stopped again.

use crate::services::{
    certificate::{CredentialError, CredentialProvisioner, CredentialSet, CredentialStore},
    network::{AddressAcquisitionEngine, BringupState, NetInterface},
};
use anyhow::Result;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use trait_variant::make;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenerKind {
    Http,
    Https,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Http => f.write_str("HTTP"),
            ListenerKind::Https => f.write_str("HTTPS"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub enable_http: bool,
    pub enable_https: bool,
    pub bind_address: IpAddr,
    /// Required when HTTPS is enabled.
    pub credentials: Option<CredentialSet>,
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ServiceError> {
        let invalid = |reason: &str| {
            Err(ServiceError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if !self.enable_http && !self.enable_https {
            return invalid("neither HTTP nor HTTPS is enabled");
        }
        if (self.enable_http && self.http_port == 0) || (self.enable_https && self.https_port == 0)
        {
            return invalid("listener port must not be 0");
        }
        if self.enable_http && self.enable_https && self.http_port == self.https_port {
            return invalid("HTTP and HTTPS must listen on different ports");
        }
        if self.enable_https && self.credentials.is_none() {
            return invalid("HTTPS requires TLS credentials");
        }

        Ok(())
    }
}

/// One listener as seen by the controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHandle {
    pub kind: ListenerKind,
    pub port: u16,
    pub enabled: bool,
    /// Address the listener is bound to, `None` while not running.
    pub local_addr: Option<SocketAddr>,
}

/// The serving layer that owns the actual listeners.
#[make(Send)]
pub trait ListenerBackend {
    /// Bind and start serving, returns the address actually bound.
    async fn start_listener(
        &self,
        kind: ListenerKind,
        address: SocketAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<SocketAddr>;

    /// Stop serving. Stopping a listener that is not running succeeds.
    async fn stop_listener(&self, kind: ListenerKind) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControllerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Stopped => "STOPPED",
            ControllerState::Starting => "STARTING",
            ControllerState::Running => "RUNNING",
            ControllerState::Stopping => "STOPPING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("network not ready (bring-up state {state})")]
    NotReady { state: BringupState },

    #[error("no usable address bound to the interface")]
    NotBound,

    #[error("services are {state}")]
    StateConflict { state: ControllerState },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("{kind} listener failed: {reason}")]
    Listener { kind: ListenerKind, reason: String },

    #[error("invalid server config: {reason}")]
    InvalidConfig { reason: String },
}

/// Address the interface is bound to, provided the bring-up is BOUND and the
/// address is still present and usable on the interface.
pub async fn bound_address<I>(engine: &AddressAcquisitionEngine<I>) -> Result<Ipv4Addr, ServiceError>
where
    I: NetInterface + Send + Sync + 'static,
{
    let address = engine
        .current_config()
        .and_then(|config| config.address())
        .ok_or(ServiceError::NotBound)?;

    let entries = engine.interface().unicast_addresses().await.map_err(|e| {
        warn!("failed to read addresses of {}: {e:#}", engine.interface().name());
        ServiceError::NotBound
    })?;

    entries
        .iter()
        .find(|entry| entry.address == address && entry.is_usable())
        .map(|entry| entry.address)
        .ok_or(ServiceError::NotBound)
}

struct ControllerInner {
    state: ControllerState,
    services: Vec<ServiceHandle>,
}

/// Puts the controller back into STOPPED if a start or stop does not finish.
struct Transition<'a> {
    inner: &'a Mutex<ControllerInner>,
    committed: bool,
}

impl Transition<'_> {
    fn commit(mut self, state: ControllerState, services: Vec<ServiceHandle>) {
        let mut inner = lock(self.inner);
        inner.state = state;
        inner.services = services;
        self.committed = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut inner = lock(self.inner);
            inner.state = ControllerState::Stopped;
            inner.services.clear();
        }
    }
}

fn lock(inner: &Mutex<ControllerInner>) -> MutexGuard<'_, ControllerInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ServiceController<I, B, S> {
    engine: Arc<AddressAcquisitionEngine<I>>,
    backend: B,
    provisioner: CredentialProvisioner<S>,
    inner: Mutex<ControllerInner>,
}

impl<I, B, S> ServiceController<I, B, S>
where
    I: NetInterface + Send + Sync + 'static,
    B: ListenerBackend + Sync,
    S: CredentialStore,
{
    pub fn new(
        engine: Arc<AddressAcquisitionEngine<I>>,
        backend: B,
        provisioner: CredentialProvisioner<S>,
    ) -> Self {
        Self {
            engine,
            backend,
            provisioner,
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Stopped,
                services: Vec::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<AddressAcquisitionEngine<I>> {
        &self.engine
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> ControllerState {
        lock(&self.inner).state
    }

    pub fn services(&self) -> Vec<ServiceHandle> {
        lock(&self.inner).services.clone()
    }

    pub async fn bound_address(&self) -> Result<Ipv4Addr, ServiceError> {
        bound_address(&self.engine).await
    }

    pub async fn wait_for_loss(&self) {
        self.engine.wait_for_loss().await
    }

    /// Start the requested listeners.
    ///
    /// Requires a BOUND interface. With HTTPS enabled the credentials are
    /// provisioned first; a provisioning failure starts no listener at all.
    pub async fn start(&self, config: &ServerConfig) -> Result<(), ServiceError> {
        let transition = self.enter(ControllerState::Starting)?;

        let bringup = self.engine.state();
        if bringup != BringupState::Bound || self.engine.current_config().is_none() {
            return Err(ServiceError::NotReady { state: bringup });
        }

        config.validate()?;

        let tls = match (config.enable_https, &config.credentials) {
            (true, Some(credentials)) => {
                self.provisioner.provision(credentials)?;
                Some(Arc::new(self.provisioner.server_config()?))
            }
            _ => None,
        };

        let mut services = Vec::with_capacity(2);
        for (kind, port, enabled) in [
            (ListenerKind::Http, config.http_port, config.enable_http),
            (ListenerKind::Https, config.https_port, config.enable_https),
        ] {
            if !enabled {
                services.push(ServiceHandle {
                    kind,
                    port,
                    enabled,
                    local_addr: None,
                });
                continue;
            }

            let tls = (kind == ListenerKind::Https).then(|| tls.clone()).flatten();
            let address = SocketAddr::new(config.bind_address, port);

            match self.backend.start_listener(kind, address, tls).await {
                Ok(local_addr) => {
                    info!("{kind} listener started on {local_addr}");
                    services.push(ServiceHandle {
                        kind,
                        port,
                        enabled,
                        local_addr: Some(local_addr),
                    });
                }
                Err(e) => {
                    error!("failed to start {kind} listener on {address}: {e:#}");
                    self.stop_listeners(&services).await;
                    return Err(ServiceError::Listener {
                        kind,
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        transition.commit(ControllerState::Running, services);
        Ok(())
    }

    /// Stop all listeners and release the interface.
    ///
    /// Stopping stopped services succeeds.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let running = {
            let mut inner = lock(&self.inner);

            match inner.state {
                ControllerState::Stopped => None,
                ControllerState::Running => {
                    inner.state = ControllerState::Stopping;
                    Some(std::mem::take(&mut inner.services))
                }
                state => return Err(ServiceError::StateConflict { state }),
            }
        };

        let Some(services) = running else {
            debug!("services already stopped");
            self.engine.stop().await;
            return Ok(());
        };

        let transition = Transition {
            inner: &self.inner,
            committed: false,
        };
        let failed = self.stop_listeners(&services).await;
        self.engine.stop().await;
        transition.commit(ControllerState::Stopped, Vec::new());

        match failed {
            Some((kind, reason)) => Err(ServiceError::Listener { kind, reason }),
            None => {
                info!("services stopped");
                Ok(())
            }
        }
    }

    fn enter(&self, to: ControllerState) -> Result<Transition<'_>, ServiceError> {
        let mut inner = lock(&self.inner);

        if inner.state != ControllerState::Stopped {
            return Err(ServiceError::StateConflict { state: inner.state });
        }

        inner.state = to;
        Ok(Transition {
            inner: &self.inner,
            committed: false,
        })
    }

    /// Stops every running listener, reports the first failure.
    async fn stop_listeners(&self, services: &[ServiceHandle]) -> Option<(ListenerKind, String)> {
        let mut failed = None;

        for service in services.iter().rev().filter(|s| s.local_addr.is_some()) {
            match self.backend.stop_listener(service.kind).await {
                Ok(()) => debug!("{} listener stopped", service.kind),
                Err(e) => {
                    error!("failed to stop {} listener: {e:#}", service.kind);
                    failed.get_or_insert((service.kind, format!("{e:#}")));
                }
            }
        }

        failed
    }
}
