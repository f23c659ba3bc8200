use serde::Serialize;
use std::net::Ipv4Addr;

/// Who assigned a unicast address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressOrigin {
    Dhcp,
    Manual,
    /// Placeholder entries that are not usable for serving.
    Overridable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnicastAddress {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub origin: AddressOrigin,
}

impl UnicastAddress {
    pub fn is_usable(&self) -> bool {
        matches!(self.origin, AddressOrigin::Dhcp | AddressOrigin::Manual)
            && !self.address.is_unspecified()
    }
}

/// Snapshot of the interface when a DHCP lease was bound.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhcpBinding {
    pub unicast: Vec<UnicastAddress>,
    pub gateway: Option<Ipv4Addr>,
    pub lease_time_secs: u32,
}

impl DhcpBinding {
    /// First unicast entry assigned by DHCP, other entries are ignored.
    pub fn dhcp_address(&self) -> Option<&UnicastAddress> {
        self.unicast
            .iter()
            .find(|entry| entry.origin == AddressOrigin::Dhcp)
    }
}

/// Interface lifecycle notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetEvent {
    DhcpStarted,
    DhcpStopped,
    AddressAdded(UnicastAddress),
    AddressRemoved(UnicastAddress),
    DhcpBound(DhcpBinding),
}

impl NetEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NetEvent::DhcpStarted => "DHCP_STARTED",
            NetEvent::DhcpStopped => "DHCP_STOPPED",
            NetEvent::AddressAdded(_) => "ADDRESS_ADDED",
            NetEvent::AddressRemoved(_) => "ADDRESS_REMOVED",
            NetEvent::DhcpBound(_) => "DHCP_BOUND",
        }
    }
}
