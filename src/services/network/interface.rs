use super::{event::NetEvent, event::UnicastAddress, model::Ipv4Settings};
use anyhow::Result;
use tokio::sync::broadcast;
use trait_variant::make;

/// Network interface collaborator driven by the bring-up engine.
///
/// The DHCP client and the address table live behind this seam; the engine
/// only requests start/stop and reacts to the lifecycle events it publishes.
#[make(Send)]
pub trait NetInterface {
    fn name(&self) -> &str;

    /// Register for lifecycle notifications. Dropping the receiver unregisters.
    fn subscribe(&self) -> broadcast::Receiver<NetEvent>;

    async fn start_dhcp(&self) -> Result<()>;
    async fn stop_dhcp(&self) -> Result<()>;
    async fn apply_static(&self, ipv4: &Ipv4Settings) -> Result<()>;
    async fn unicast_addresses(&self) -> Result<Vec<UnicastAddress>>;
}
