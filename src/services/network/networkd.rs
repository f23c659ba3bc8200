//! systemd-networkd backed network interface.
//!
//! DHCP and static addressing are requested by writing a `.network` file and
//! reloading networkd. Lifecycle events are derived from the kernel address
//! table, which is polled and diffed against the previous snapshot.

use super::{
    event::{AddressOrigin, DhcpBinding, NetEvent, UnicastAddress},
    interface::NetInterface,
    model::{Ipv4Settings, netmask_from_prefix},
};
use anyhow::{Context, Result, ensure};
use ini::Ini;
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{process::Command, sync::broadcast, task::AbortHandle, time};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 32;

macro_rules! network_config_file {
    ($dir:expr, $name:expr) => {
        Path::new($dir).join(format!("10-{}.network", $name))
    };
}

enum NetworkFile<'a> {
    Dhcp,
    DhcpStopped,
    Static(&'a Ipv4Settings),
}

#[derive(Deserialize)]
struct IpLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
    #[serde(default)]
    dynamic: bool,
    #[serde(default)]
    valid_life_time: Option<u64>,
}

#[derive(Deserialize)]
struct IpRoute {
    dst: String,
    gateway: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct AddressEntry {
    unicast: UnicastAddress,
    valid_lifetime: Option<u32>,
}

struct NetworkdShared {
    name: String,
    network_dir: PathBuf,
    events: broadcast::Sender<NetEvent>,
    dhcp_active: AtomicBool,
    poller: Mutex<Option<AbortHandle>>,
}

pub struct NetworkdInterface {
    shared: Arc<NetworkdShared>,
}

impl NetworkdInterface {
    pub fn new(name: impl Into<String>, network_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(NetworkdShared {
                name: name.into(),
                network_dir: network_dir.into(),
                events,
                dhcp_active: AtomicBool::new(false),
                poller: Mutex::new(None),
            }),
        }
    }

    fn ensure_poller(&self) {
        let mut poller = self
            .shared
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if poller.is_none() {
            let shared = Arc::clone(&self.shared);
            *poller = Some(tokio::spawn(shared.poll()).abort_handle());
            debug!("address poller started for {}", self.shared.name);
        }
    }

    fn publish(&self, event: NetEvent) {
        self.shared.publish(event);
    }
}

impl Drop for NetworkdInterface {
    fn drop(&mut self) {
        if let Some(poller) = self
            .shared
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            poller.abort();
        }
    }
}

impl NetInterface for NetworkdInterface {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.shared.events.subscribe()
    }

    async fn start_dhcp(&self) -> Result<()> {
        self.shared.write_network_file(NetworkFile::Dhcp)?;
        self.shared.reload().await?;
        self.shared.dhcp_active.store(true, Ordering::SeqCst);
        self.publish(NetEvent::DhcpStarted);
        self.ensure_poller();
        Ok(())
    }

    async fn stop_dhcp(&self) -> Result<()> {
        self.shared.dhcp_active.store(false, Ordering::SeqCst);
        self.shared.write_network_file(NetworkFile::DhcpStopped)?;
        self.shared.reload().await?;
        self.publish(NetEvent::DhcpStopped);
        Ok(())
    }

    async fn apply_static(&self, ipv4: &Ipv4Settings) -> Result<()> {
        self.shared.dhcp_active.store(false, Ordering::SeqCst);
        self.shared
            .write_network_file(NetworkFile::Static(ipv4))?;
        self.shared.reload().await?;
        self.ensure_poller();
        Ok(())
    }

    async fn unicast_addresses(&self) -> Result<Vec<UnicastAddress>> {
        Ok(self
            .shared
            .snapshot()
            .await?
            .into_iter()
            .map(|entry| entry.unicast)
            .collect())
    }
}

impl NetworkdShared {
    fn publish(&self, event: NetEvent) {
        debug!("{}: {}", self.name, event.name());
        // fails only without receivers
        let _ = self.events.send(event);
    }

    fn write_network_file(&self, file: NetworkFile<'_>) -> Result<()> {
        let ini = network_file(&self.name, file);
        let path = network_config_file!(&self.network_dir, &self.name);

        info!("write network config to {path:?}");

        ini.write_to_file(&path)
            .context(format!("failed to write network config: {path:?}"))
    }

    async fn reload(&self) -> Result<()> {
        run("networkctl", &["reload"]).await?;
        run("networkctl", &["reconfigure", self.name.as_str()]).await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<AddressEntry>> {
        let output = run("ip", &["-j", "-4", "addr", "show", "dev", self.name.as_str()]).await?;
        parse_addresses(&output)
    }

    async fn default_gateway(&self) -> Result<Option<Ipv4Addr>> {
        let output = run(
            "ip",
            &["-j", "-4", "route", "show", "default", "dev", self.name.as_str()],
        )
        .await?;
        parse_default_gateway(&output)
    }

    async fn poll(self: Arc<Self>) {
        let mut known: Vec<AddressEntry> = Vec::new();
        let mut announced = false;
        let mut interval = time::interval(POLL_INTERVAL);

        loop {
            interval.tick().await;

            let snapshot = match self.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("failed to read addresses of {}: {e:#}", self.name);
                    continue;
                }
            };

            for entry in &snapshot {
                if !known.iter().any(|k| k.unicast.address == entry.unicast.address) {
                    self.publish(NetEvent::AddressAdded(entry.unicast));
                }
            }

            for entry in &known {
                if !snapshot.iter().any(|s| s.unicast.address == entry.unicast.address) {
                    self.publish(NetEvent::AddressRemoved(entry.unicast));
                }
            }

            let lease = snapshot
                .iter()
                .find(|entry| entry.unicast.origin == AddressOrigin::Dhcp)
                .copied();

            let lease = match lease {
                Some(lease) if self.dhcp_active.load(Ordering::SeqCst) => lease,
                _ => {
                    announced = false;
                    known = snapshot;
                    continue;
                }
            };

            if !announced {
                let gateway = self.default_gateway().await.unwrap_or_else(|e| {
                    warn!("failed to read default gateway of {}: {e:#}", self.name);
                    None
                });

                self.publish(NetEvent::DhcpBound(DhcpBinding {
                    unicast: snapshot.iter().map(|entry| entry.unicast).collect(),
                    gateway,
                    lease_time_secs: lease.valid_lifetime.unwrap_or(u32::MAX),
                }));
                announced = true;
            }

            known = snapshot;
        }
    }
}

fn network_file(name: &str, file: NetworkFile<'_>) -> Ini {
    let mut ini = Ini::new();

    ini.with_section(Some("Match")).set("Name", name);

    let mut network_section = ini.with_section(Some("Network"));

    match file {
        NetworkFile::Dhcp => {
            network_section.set("DHCP", "ipv4");
        }
        NetworkFile::DhcpStopped => {
            // keep an acquired lease on the interface but stop renewing it
            network_section
                .set("DHCP", "no")
                .set("KeepConfiguration", "dynamic");
        }
        NetworkFile::Static(ipv4) => {
            network_section
                .set("DHCP", "no")
                .set("Address", format!("{}/{}", ipv4.address, ipv4.prefix_len()));

            if let Some(gateway) = ipv4.gateway {
                network_section.set("Gateway", gateway.to_string());
            }
        }
    }

    ini
}

async fn run(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .context(format!("failed to spawn {program}"))?;

    ensure!(
        output.status.success(),
        "{program} {} failed with {}: {}",
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(output.stdout)
}

fn parse_addresses(json: &[u8]) -> Result<Vec<AddressEntry>> {
    let links: Vec<IpLink> =
        serde_json::from_slice(json).context("failed to parse address list")?;

    Ok(links
        .into_iter()
        .flat_map(|link| link.addr_info)
        .filter(|info| info.family == "inet")
        .filter_map(|info| {
            let address = info.local.parse::<Ipv4Addr>().ok()?;
            let origin = if info.dynamic {
                AddressOrigin::Dhcp
            } else if address.is_link_local() {
                AddressOrigin::Overridable
            } else {
                AddressOrigin::Manual
            };

            Some(AddressEntry {
                unicast: UnicastAddress {
                    address,
                    netmask: netmask_from_prefix(info.prefixlen),
                    origin,
                },
                valid_lifetime: info
                    .valid_life_time
                    .map(|secs| u32::try_from(secs).unwrap_or(u32::MAX)),
            })
        })
        .collect())
}

fn parse_default_gateway(json: &[u8]) -> Result<Option<Ipv4Addr>> {
    let routes: Vec<IpRoute> =
        serde_json::from_slice(json).context("failed to parse route list")?;

    Ok(routes
        .into_iter()
        .filter(|route| route.dst == "default")
        .find_map(|route| route.gateway?.parse().ok()))
}
