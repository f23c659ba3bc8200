//! Network bring-up: configuration model, interface events and the address
//! acquisition engine.

pub mod engine;
pub mod event;
pub mod interface;
pub mod model;
pub mod networkd;

pub use engine::{AcquisitionError, AddressAcquisitionEngine, BringupState, DEFAULT_DHCP_TIMEOUT};
pub use event::{AddressOrigin, DhcpBinding, NetEvent, UnicastAddress};
pub use interface::NetInterface;
pub use model::{AcquisitionMode, AddressingMode, Ipv4Settings, NetworkConfig, StaticAddressing};
pub use networkd::NetworkdInterface;
