#![allow(dead_code)]

use anyhow::{Result, bail};
use device_bringup::services::{
    certificate::{CredentialKind, CredentialSet, CredentialStore, SecTag},
    lifecycle::{ListenerBackend, ListenerKind},
    network::{
        AddressAcquisitionEngine, AddressOrigin, BringupState, DhcpBinding, Ipv4Settings,
        NetEvent, NetInterface, UnicastAddress,
    },
};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::broadcast, time};

pub const CERT_PEM: &[u8] = include_bytes!("../fixtures/server-cert.pem");
pub const KEY_PEM: &[u8] = include_bytes!("../fixtures/server-key.pem");

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    StartDhcp,
    StopDhcp,
    ApplyStatic(Ipv4Settings),
}

/// Scriptable interface: records requests and publishes events on demand.
pub struct FakeInterface {
    events: broadcast::Sender<NetEvent>,
    calls: Mutex<Vec<Call>>,
    addresses: Mutex<Vec<UnicastAddress>>,
    binding_on_start: Mutex<Option<DhcpBinding>>,
    fail_start_dhcp: Mutex<bool>,
    subscribe_delay: Mutex<Option<Duration>>,
}

impl FakeInterface {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);

        Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
            addresses: Mutex::new(Vec::new()),
            binding_on_start: Mutex::new(None),
            fail_start_dhcp: Mutex::new(false),
            subscribe_delay: Mutex::new(None),
        })
    }

    /// Bind `binding` as soon as the DHCP client is started.
    pub fn bind_on_start(&self, binding: DhcpBinding) {
        *self.binding_on_start.lock().unwrap() = Some(binding);
    }

    pub fn fail_start_dhcp(&self) {
        *self.fail_start_dhcp.lock().unwrap() = true;
    }

    /// Block the calling thread for `delay` whenever someone subscribes.
    pub fn delay_subscribe(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn publish(&self, event: NetEvent) {
        if let NetEvent::DhcpBound(binding) = &event {
            self.addresses
                .lock()
                .unwrap()
                .extend(binding.unicast.iter().copied());
        }

        let _ = self.events.send(event);
    }

    pub fn remove_address(&self, address: Ipv4Addr) {
        let removed: Vec<_> = {
            let mut addresses = self.addresses.lock().unwrap();
            let removed = addresses
                .iter()
                .filter(|entry| entry.address == address)
                .copied()
                .collect();
            addresses.retain(|entry| entry.address != address);
            removed
        };

        for entry in removed {
            let _ = self.events.send(NetEvent::AddressRemoved(entry));
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl NetInterface for FakeInterface {
    fn name(&self) -> &str {
        "fake0"
    }

    fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        let delay = *self.subscribe_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        self.events.subscribe()
    }

    async fn start_dhcp(&self) -> Result<()> {
        self.record(Call::StartDhcp);

        if *self.fail_start_dhcp.lock().unwrap() {
            bail!("DHCP client unavailable");
        }

        let _ = self.events.send(NetEvent::DhcpStarted);

        let binding = self.binding_on_start.lock().unwrap().clone();
        if let Some(binding) = binding {
            self.publish(NetEvent::DhcpBound(binding));
        }

        Ok(())
    }

    async fn stop_dhcp(&self) -> Result<()> {
        self.record(Call::StopDhcp);
        let _ = self.events.send(NetEvent::DhcpStopped);
        Ok(())
    }

    async fn apply_static(&self, ipv4: &Ipv4Settings) -> Result<()> {
        self.record(Call::ApplyStatic(*ipv4));

        let entry = UnicastAddress {
            address: ipv4.address,
            netmask: ipv4.netmask,
            origin: AddressOrigin::Manual,
        };
        self.addresses.lock().unwrap().push(entry);
        let _ = self.events.send(NetEvent::AddressAdded(entry));

        Ok(())
    }

    async fn unicast_addresses(&self) -> Result<Vec<UnicastAddress>> {
        Ok(self.addresses.lock().unwrap().clone())
    }
}

/// Listener backend that only records what it was asked to do.
#[derive(Default)]
pub struct FakeBackend {
    running: Mutex<HashMap<ListenerKind, (SocketAddr, bool)>>,
    fail_start: Mutex<Option<ListenerKind>>,
    stopped: Mutex<Vec<ListenerKind>>,
}

impl FakeBackend {
    pub fn fail_start(&self, kind: ListenerKind) {
        *self.fail_start.lock().unwrap() = Some(kind);
    }

    pub fn running(&self) -> Vec<ListenerKind> {
        let mut kinds: Vec<_> = self.running.lock().unwrap().keys().copied().collect();
        kinds.sort_by_key(|kind| *kind == ListenerKind::Https);
        kinds
    }

    /// Whether `kind` was started with a TLS config.
    pub fn has_tls(&self, kind: ListenerKind) -> bool {
        self.running
            .lock()
            .unwrap()
            .get(&kind)
            .is_some_and(|(_, tls)| *tls)
    }

    pub fn stopped(&self) -> Vec<ListenerKind> {
        self.stopped.lock().unwrap().clone()
    }
}

impl ListenerBackend for FakeBackend {
    async fn start_listener(
        &self,
        kind: ListenerKind,
        address: SocketAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<SocketAddr> {
        if *self.fail_start.lock().unwrap() == Some(kind) {
            bail!("address in use: {address}");
        }

        self.running
            .lock()
            .unwrap()
            .insert(kind, (address, tls.is_some()));
        Ok(address)
    }

    async fn stop_listener(&self, kind: ListenerKind) -> Result<()> {
        self.running.lock().unwrap().remove(&kind);
        self.stopped.lock().unwrap().push(kind);
        Ok(())
    }
}

/// Credential store refusing every entry.
pub struct RejectingStore;

impl CredentialStore for RejectingStore {
    fn add(&self, tag: SecTag, kind: CredentialKind, _data: &[u8]) -> Result<()> {
        bail!("credential storage full, cannot add {kind} under tag {tag}")
    }

    fn get(&self, _tag: SecTag, _kind: CredentialKind) -> Option<Vec<u8>> {
        None
    }
}

pub fn credentials() -> CredentialSet {
    CredentialSet {
        certificate: CERT_PEM.to_vec(),
        private_key: KEY_PEM.to_vec(),
        psk: None,
    }
}

pub fn dhcp_entry(address: Ipv4Addr) -> UnicastAddress {
    UnicastAddress {
        address,
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        origin: AddressOrigin::Dhcp,
    }
}

pub fn binding(address: Ipv4Addr) -> DhcpBinding {
    DhcpBinding {
        unicast: vec![dhcp_entry(address)],
        gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
        lease_time_secs: 3600,
    }
}

/// Wait until the engine reaches `state`, fails the test after a second.
pub async fn wait_for_state<I>(engine: &AddressAcquisitionEngine<I>, state: BringupState)
where
    I: NetInterface + Send + Sync + 'static,
{
    let mut state_rx = engine.watch_state();

    time::timeout(Duration::from_secs(1), state_rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("engine did not reach {state}"))
        .expect("state channel closed");
}
