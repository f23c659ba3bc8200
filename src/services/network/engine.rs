//! Address acquisition engine.
//!
//! Coordinates DHCP lifecycle events, the bounded wait for a lease and static
//! assignment. The bring-up state is the only state shared between the event
//! dispatch task and the caller of [`AddressAcquisitionEngine::acquire`]; every
//! transition happens under one mutex so that a lease arriving at the same time
//! as the timeout is resolved exactly once.

use super::{
    event::NetEvent,
    interface::NetInterface,
    model::{AcquisitionMode, AddressingMode, Ipv4Settings, NetworkConfig, StaticAddressing},
};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast::error::RecvError, oneshot, watch},
    task::AbortHandle,
    time,
};

pub const DEFAULT_DHCP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BringupState {
    Unconfigured,
    Acquiring,
    Bound,
    Lost,
    Failed,
}

impl fmt::Display for BringupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BringupState::Unconfigured => "UNCONFIGURED",
            BringupState::Acquiring => "ACQUIRING",
            BringupState::Bound => "BOUND",
            BringupState::Lost => "LOST",
            BringupState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("invalid {field} address: \"{value}\"")]
    InvalidAddress { field: &'static str, value: String },

    #[error("DHCP did not bind within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("address acquisition already in progress")]
    Busy,

    #[error("address acquisition cancelled")]
    Cancelled,

    #[error("interface request failed: {reason}")]
    Interface { reason: String },
}

struct Subscription {
    generation: u64,
    task: AbortHandle,
}

struct Inner {
    state: BringupState,
    config: Option<NetworkConfig>,
    in_flight: bool,
    generation: u64,
    subscription: Option<Subscription>,
    waiter: Option<oneshot::Sender<NetworkConfig>>,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<BringupState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, to: BringupState) {
        if inner.state != to {
            info!("bring-up state: {} -> {to}", inner.state);
            inner.state = to;
            self.state_tx.send_replace(to);
        }
    }

    fn unsubscribe(inner: &mut Inner) {
        if let Some(subscription) = inner.subscription.take() {
            subscription.task.abort();
            debug!(
                "unregistered network events (generation {})",
                subscription.generation
            );
        }
    }

    fn dispatch(&self, generation: u64, event: NetEvent) {
        let mut inner = self.lock();

        if inner.subscription.as_ref().map(|s| s.generation) != Some(generation) {
            debug!("ignoring {} from stale subscription", event.name());
            return;
        }

        match event {
            NetEvent::DhcpBound(binding) => {
                if inner.state != BringupState::Acquiring {
                    debug!("ignoring DHCP_BOUND in state {}", inner.state);
                    return;
                }

                let Some(entry) = binding.dhcp_address() else {
                    warn!("DHCP_BOUND without a DHCP assigned address, still waiting");
                    return;
                };

                let config = NetworkConfig::dhcp_bound(
                    Ipv4Settings {
                        address: entry.address,
                        netmask: entry.netmask,
                        gateway: binding.gateway.filter(|gw| !gw.is_unspecified()),
                    },
                    binding.lease_time_secs,
                );

                info!(
                    "DHCP bound: address {} netmask {} gateway {:?} lease {}s",
                    entry.address, entry.netmask, binding.gateway, binding.lease_time_secs
                );

                inner.config = Some(config);
                self.transition(&mut inner, BringupState::Bound);

                if let Some(waiter) = inner.waiter.take() {
                    let _ = waiter.send(config);
                }
            }
            NetEvent::AddressRemoved(entry) => {
                let bound_address = inner.config.and_then(|config| config.address());

                if inner.state == BringupState::Bound && bound_address == Some(entry.address) {
                    warn!("bound address {} removed from interface", entry.address);
                    self.transition(&mut inner, BringupState::Lost);
                } else {
                    debug!("address {} removed in state {}", entry.address, inner.state);
                }
            }
            NetEvent::AddressAdded(entry) => {
                debug!("address {} added ({:?})", entry.address, entry.origin)
            }
            NetEvent::DhcpStarted => debug!("DHCP started"),
            NetEvent::DhcpStopped => debug!("DHCP stopped"),
        }
    }
}

/// Clears the in-flight flag on every exit path, including a dropped future.
struct InFlight {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.in_flight = false;

        if inner.generation == self.generation && inner.state == BringupState::Acquiring {
            warn!("address acquisition abandoned by caller");
            inner.waiter = None;
            Shared::unsubscribe(&mut inner);
            self.shared.transition(&mut inner, BringupState::Failed);
        }
    }
}

/// Owns the bring-up state of one interface.
pub struct AddressAcquisitionEngine<I> {
    iface: Arc<I>,
    shared: Arc<Shared>,
}

impl<I> AddressAcquisitionEngine<I>
where
    I: NetInterface + Send + Sync + 'static,
{
    pub fn new(iface: Arc<I>) -> Self {
        let (state_tx, _) = watch::channel(BringupState::Unconfigured);

        Self {
            iface,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: BringupState::Unconfigured,
                    config: None,
                    in_flight: false,
                    generation: 0,
                    subscription: None,
                    waiter: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn interface(&self) -> &Arc<I> {
        &self.iface
    }

    pub fn state(&self) -> BringupState {
        self.shared.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<BringupState> {
        self.shared.state_tx.subscribe()
    }

    /// Configuration of the current binding, `None` unless BOUND.
    pub fn current_config(&self) -> Option<NetworkConfig> {
        let inner = self.shared.lock();
        (inner.state == BringupState::Bound)
            .then_some(inner.config)
            .flatten()
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.lock().subscription.is_some()
    }

    /// Resolves once the bound address has been lost.
    pub async fn wait_for_loss(&self) {
        let mut state_rx = self.watch_state();
        let _ = state_rx
            .wait_for(|state| *state == BringupState::Lost)
            .await;
    }

    /// Acquire an IPv4 address.
    ///
    /// Static addressing is validated and applied immediately. DHCP blocks the
    /// calling task until a lease is bound or `timeout` elapses, whichever
    /// happens first. Only one acquisition may be in flight; a concurrent call
    /// fails with [`AcquisitionError::Busy`].
    pub async fn acquire(
        &self,
        mode: AcquisitionMode,
        timeout: Duration,
    ) -> Result<NetworkConfig, AcquisitionError> {
        match mode {
            AcquisitionMode::Static(addressing) => self.acquire_static(&addressing).await,
            AcquisitionMode::Dhcp => self.acquire_dhcp(timeout).await,
        }
    }

    /// Cancel a pending acquisition and release the interface.
    ///
    /// Notifications are unregistered before this returns, a late event can
    /// no longer change the state. Calling it on a stopped engine is a no-op.
    pub async fn stop(&self) {
        let release_dhcp = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            Shared::unsubscribe(&mut inner);
            inner.waiter = None;

            let release_dhcp = inner.state == BringupState::Acquiring
                || (inner.state == BringupState::Bound
                    && inner
                        .config
                        .is_some_and(|config| config.mode == AddressingMode::Dhcp));

            inner.config = None;
            self.shared
                .transition(&mut inner, BringupState::Unconfigured);
            release_dhcp
        };

        if release_dhcp {
            self.stop_dhcp().await;
        }
    }

    fn begin(&self) -> Result<InFlight, AcquisitionError> {
        let mut inner = self.shared.lock();

        if inner.in_flight {
            return Err(AcquisitionError::Busy);
        }

        inner.in_flight = true;
        inner.generation += 1;
        Shared::unsubscribe(&mut inner);

        Ok(InFlight {
            shared: Arc::clone(&self.shared),
            generation: inner.generation,
        })
    }

    /// Register for interface events on behalf of acquisition `generation`.
    ///
    /// Fails with [`AcquisitionError::Cancelled`] if the engine was stopped
    /// while registering; nothing stays registered in that case.
    fn subscribe(&self, generation: u64) -> Result<(), AcquisitionError> {
        let mut events = self.iface.subscribe();
        let shared = Arc::clone(&self.shared);

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => shared.dispatch(generation, event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("missed {skipped} network events")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut inner = self.shared.lock();
        if inner.generation != generation {
            task.abort();
            debug!("engine stopped while registering network events");
            return Err(AcquisitionError::Cancelled);
        }

        Shared::unsubscribe(&mut inner);
        inner.subscription = Some(Subscription {
            generation,
            task: task.abort_handle(),
        });
        debug!(
            "registered network events on {} (generation {generation})",
            self.iface.name()
        );
        Ok(())
    }

    async fn acquire_static(
        &self,
        addressing: &StaticAddressing,
    ) -> Result<NetworkConfig, AcquisitionError> {
        let ipv4 = addressing.parse()?;
        let in_flight = self.begin()?;
        self.subscribe(in_flight.generation)?;

        let applied = self.iface.apply_static(&ipv4).await;

        let config = NetworkConfig::static_ip(ipv4);
        {
            let mut inner = self.shared.lock();

            if inner.generation != in_flight.generation {
                return Err(AcquisitionError::Cancelled);
            }

            if let Err(e) = applied {
                Shared::unsubscribe(&mut inner);
                self.shared.transition(&mut inner, BringupState::Failed);
                return Err(AcquisitionError::Interface {
                    reason: format!("{e:#}"),
                });
            }

            inner.config = Some(config);
            self.shared.transition(&mut inner, BringupState::Bound);
        }

        info!(
            "static IPv4 configuration applied on {}: {}/{}",
            self.iface.name(),
            ipv4.address,
            ipv4.prefix_len()
        );

        Ok(config)
    }

    async fn acquire_dhcp(&self, timeout: Duration) -> Result<NetworkConfig, AcquisitionError> {
        let in_flight = self.begin()?;
        let generation = in_flight.generation;
        self.subscribe(generation)?;

        let (waiter, mut bound_rx) = oneshot::channel();
        {
            let mut inner = self.shared.lock();
            if inner.generation != generation {
                return Err(AcquisitionError::Cancelled);
            }

            inner.config = None;
            inner.waiter = Some(waiter);
            self.shared
                .transition(&mut inner, BringupState::Acquiring);
        }

        if let Err(e) = self.iface.start_dhcp().await {
            let mut inner = self.shared.lock();
            if inner.generation == generation {
                inner.waiter = None;
                Shared::unsubscribe(&mut inner);
                self.shared.transition(&mut inner, BringupState::Failed);
            }
            return Err(AcquisitionError::Interface {
                reason: format!("failed to start DHCP client: {e:#}"),
            });
        }

        info!(
            "DHCP client started on {}, waiting up to {timeout:?} for a lease",
            self.iface.name()
        );

        let result = match time::timeout(timeout, &mut bound_rx).await {
            Ok(Ok(config)) => Ok(config),
            Ok(Err(_)) => Err(AcquisitionError::Cancelled),
            Err(_) => self.expire(generation, timeout, &mut bound_rx),
        };

        if let Err(e) = &result {
            debug!("DHCP acquisition ended: {e}");
        }
        self.stop_dhcp().await;

        drop(in_flight);
        result
    }

    /// Resolve the race between the timer and a lease arriving in parallel.
    fn expire(
        &self,
        generation: u64,
        timeout: Duration,
        bound_rx: &mut oneshot::Receiver<NetworkConfig>,
    ) -> Result<NetworkConfig, AcquisitionError> {
        let mut inner = self.shared.lock();

        if inner.generation == generation && inner.state == BringupState::Acquiring {
            warn!("DHCP timeout after {timeout:?}");
            inner.waiter = None;
            Shared::unsubscribe(&mut inner);
            self.shared.transition(&mut inner, BringupState::Failed);
            return Err(AcquisitionError::Timeout { timeout });
        }

        drop(inner);
        bound_rx
            .try_recv()
            .map_err(|_| AcquisitionError::Cancelled)
    }

    async fn stop_dhcp(&self) {
        if let Err(e) = self.iface.stop_dhcp().await {
            warn!("failed to stop DHCP client on {}: {e:#}", self.iface.name());
        }
    }
}
