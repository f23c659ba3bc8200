use serde::Serialize;
use std::{fmt, net::Ipv4Addr, str::FromStr};

use super::engine::AcquisitionError;

/// How the interface obtains its IPv4 address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    Dhcp,
    Static,
}

impl AddressingMode {
    pub(crate) const fn tag(self) -> u8 {
        match self {
            AddressingMode::Dhcp => 0,
            AddressingMode::Static => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(AddressingMode::Dhcp),
            1 => Some(AddressingMode::Static),
            _ => None,
        }
    }
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingMode::Dhcp => write!(f, "dhcp"),
            AddressingMode::Static => write!(f, "static"),
        }
    }
}

impl FromStr for AddressingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dhcp" | "on" => Ok(AddressingMode::Dhcp),
            "static" | "off" => Ok(AddressingMode::Static),
            other => Err(format!("unknown addressing mode: {other}")),
        }
    }
}

/// Address, netmask and optional gateway applied to an interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipv4Settings {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl Ipv4Settings {
    /// Number of leading one bits in the netmask.
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).leading_ones()
    }

    /// Same rules [`StaticAddressing::parse`] applies to untrusted input.
    pub fn is_valid(&self) -> bool {
        is_host_address(self.address)
            && is_netmask(self.netmask)
            && self.gateway.is_none_or(|gw| !gw.is_unspecified())
    }
}

fn netmask_is_contiguous(netmask: Ipv4Addr) -> bool {
    let bits = u32::from(netmask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

fn is_host_address(address: Ipv4Addr) -> bool {
    !(address.is_unspecified() || address.is_broadcast() || address.is_multicast())
}

fn is_netmask(netmask: Ipv4Addr) -> bool {
    netmask_is_contiguous(netmask) && !netmask.is_unspecified()
}

pub(crate) fn netmask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    match prefix_len {
        0 => Ipv4Addr::UNSPECIFIED,
        n if n >= 32 => Ipv4Addr::BROADCAST,
        n => Ipv4Addr::from(u32::MAX << (32 - u32::from(n))),
    }
}

/// Network configuration record.
///
/// In `Static` mode `ipv4` is always present. In `Dhcp` mode `ipv4` and
/// `lease_time_secs` are only present after a successful bind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub mode: AddressingMode,
    pub ipv4: Option<Ipv4Settings>,
    pub lease_time_secs: Option<u32>,
}

impl NetworkConfig {
    pub const fn dhcp_unbound() -> Self {
        Self {
            mode: AddressingMode::Dhcp,
            ipv4: None,
            lease_time_secs: None,
        }
    }

    pub const fn dhcp_bound(ipv4: Ipv4Settings, lease_time_secs: u32) -> Self {
        Self {
            mode: AddressingMode::Dhcp,
            ipv4: Some(ipv4),
            lease_time_secs: Some(lease_time_secs),
        }
    }

    pub const fn static_ip(ipv4: Ipv4Settings) -> Self {
        Self {
            mode: AddressingMode::Static,
            ipv4: Some(ipv4),
            lease_time_secs: None,
        }
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.ipv4.map(|ipv4| ipv4.address)
    }

    pub fn is_valid(&self) -> bool {
        match (self.mode, self.ipv4, self.lease_time_secs) {
            (AddressingMode::Static, Some(ipv4), None) => ipv4.is_valid(),
            (AddressingMode::Dhcp, None, None) => true,
            (AddressingMode::Dhcp, Some(ipv4), Some(_)) => ipv4.is_valid(),
            _ => false,
        }
    }
}

/// Untrusted textual static addressing, validated by the engine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StaticAddressing {
    pub address: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
}

impl StaticAddressing {
    pub fn new(address: &str, netmask: &str, gateway: Option<&str>) -> Self {
        Self {
            address: Some(address.to_string()),
            netmask: Some(netmask.to_string()),
            gateway: gateway.map(str::to_string),
        }
    }

    /// Parse all fields as dotted-quad values.
    ///
    /// `address` and `netmask` are required, `gateway` is optional but must be
    /// well-formed when given.
    pub fn parse(&self) -> Result<Ipv4Settings, AcquisitionError> {
        let address = parse_dotted_quad("address", self.address.as_deref())?;
        let netmask = parse_dotted_quad("netmask", self.netmask.as_deref())?;
        let gateway = self
            .gateway
            .as_deref()
            .map(|gw| parse_dotted_quad("gateway", Some(gw)))
            .transpose()?;

        if !is_host_address(address) {
            return Err(AcquisitionError::InvalidAddress {
                field: "address",
                value: address.to_string(),
            });
        }

        if !is_netmask(netmask) {
            return Err(AcquisitionError::InvalidAddress {
                field: "netmask",
                value: netmask.to_string(),
            });
        }

        if let Some(gateway) = gateway.filter(Ipv4Addr::is_unspecified) {
            return Err(AcquisitionError::InvalidAddress {
                field: "gateway",
                value: gateway.to_string(),
            });
        }

        Ok(Ipv4Settings {
            address,
            netmask,
            gateway,
        })
    }
}

impl From<Ipv4Settings> for StaticAddressing {
    fn from(ipv4: Ipv4Settings) -> Self {
        Self {
            address: Some(ipv4.address.to_string()),
            netmask: Some(ipv4.netmask.to_string()),
            gateway: ipv4.gateway.map(|gw| gw.to_string()),
        }
    }
}

fn parse_dotted_quad(field: &'static str, value: Option<&str>) -> Result<Ipv4Addr, AcquisitionError> {
    let value = value.ok_or(AcquisitionError::InvalidAddress {
        field,
        value: String::new(),
    })?;

    value
        .parse::<Ipv4Addr>()
        .map_err(|_| AcquisitionError::InvalidAddress {
            field,
            value: value.to_string(),
        })
}

/// Requested bring-up mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AcquisitionMode {
    Dhcp,
    Static(StaticAddressing),
}

impl AcquisitionMode {
    pub fn addressing_mode(&self) -> AddressingMode {
        match self {
            AcquisitionMode::Dhcp => AddressingMode::Dhcp,
            AcquisitionMode::Static(_) => AddressingMode::Static,
        }
    }
}

impl From<&NetworkConfig> for AcquisitionMode {
    fn from(config: &NetworkConfig) -> Self {
        match (config.mode, config.ipv4) {
            (AddressingMode::Static, Some(ipv4)) => AcquisitionMode::Static(ipv4.into()),
            (AddressingMode::Static, None) => AcquisitionMode::Static(StaticAddressing::default()),
            (AddressingMode::Dhcp, _) => AcquisitionMode::Dhcp,
        }
    }
}
