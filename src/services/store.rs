//! Persistence of the network configuration record.
//!
//! The record is stored under one fixed id as a fixed-size binary blob:
//!
//! | offset | size | content                            |
//! |--------|------|------------------------------------|
//! | 0      | 1    | format version                     |
//! | 1      | 1    | addressing mode (0 DHCP, 1 STATIC) |
//! | 2      | 4    | IPv4 address                       |
//! | 6      | 4    | gateway                            |
//! | 10     | 4    | netmask                            |
//! | 14     | 4    | lease time, little endian          |
//!
//! Absent addresses are stored as `0.0.0.0`. A record whose length or version
//! does not match is rejected instead of being reinterpreted.

use crate::services::network::{AddressingMode, Ipv4Settings, NetworkConfig};
use log::{debug, info};
use std::{
    fs,
    io::{self, ErrorKind},
    net::Ipv4Addr,
    path::PathBuf,
};
use thiserror::Error;

pub const DHCP_CONFIG_ID: u16 = 1;
pub const RECORD_VERSION: u8 = 1;
pub const RECORD_LEN: usize = 18;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no network configuration stored")]
    NotFound,

    #[error("config store i/o failure: {0}")]
    IoFailure(#[from] io::Error),
}

/// Key/value storage addressed by numeric id.
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` if nothing was ever written under `id`.
    fn read(&self, id: u16) -> io::Result<Option<Vec<u8>>>;
    fn write(&self, id: u16, data: &[u8]) -> io::Result<()>;
}

/// One file per id inside a directory, replaced atomically on write.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: u16) -> PathBuf {
        self.dir.join(format!("{id:04x}"))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn read(&self, id: u16) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, id: u16, data: &[u8]) -> io::Result<()> {
        let path = self.path(id);
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)
    }
}

pub struct ConfigStore<S> {
    backend: S,
}

impl<S: KeyValueStore> ConfigStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn save(&self, config: &NetworkConfig) -> Result<(), StoreError> {
        if !config.is_valid() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("refusing to persist invalid network config: {config:?}"),
            )
            .into());
        }

        self.backend.write(DHCP_CONFIG_ID, &encode(config))?;
        info!("network config saved: {config:?}");
        Ok(())
    }

    pub fn load(&self) -> Result<NetworkConfig, StoreError> {
        let record = self
            .backend
            .read(DHCP_CONFIG_ID)?
            .ok_or(StoreError::NotFound)?;

        let config = decode(&record)?;
        debug!("network config loaded: {config:?}");
        Ok(config)
    }
}

pub fn encode(config: &NetworkConfig) -> [u8; RECORD_LEN] {
    let (address, gateway, netmask) = match config.ipv4 {
        Some(ipv4) => (
            ipv4.address,
            ipv4.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            ipv4.netmask,
        ),
        None => (
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        ),
    };

    let mut record = [0u8; RECORD_LEN];
    record[0] = RECORD_VERSION;
    record[1] = config.mode.tag();
    record[2..6].copy_from_slice(&address.octets());
    record[6..10].copy_from_slice(&gateway.octets());
    record[10..14].copy_from_slice(&netmask.octets());
    record[14..18].copy_from_slice(&config.lease_time_secs.unwrap_or(0).to_le_bytes());
    record
}

pub fn decode(record: &[u8]) -> Result<NetworkConfig, StoreError> {
    let invalid = |reason: String| StoreError::IoFailure(io::Error::new(ErrorKind::InvalidData, reason));

    let record: &[u8; RECORD_LEN] = record.try_into().map_err(|_| {
        invalid(format!(
            "stored record has {} bytes, expected {RECORD_LEN}",
            record.len()
        ))
    })?;

    if record[0] != RECORD_VERSION {
        return Err(invalid(format!(
            "stored record version {} is not supported",
            record[0]
        )));
    }

    let mode = AddressingMode::from_tag(record[1])
        .ok_or_else(|| invalid(format!("unknown addressing mode tag {}", record[1])))?;

    let octets = |offset: usize| {
        Ipv4Addr::new(
            record[offset],
            record[offset + 1],
            record[offset + 2],
            record[offset + 3],
        )
    };
    let address = octets(2);
    let gateway = octets(6);
    let netmask = octets(10);
    let lease_time_secs = u32::from_le_bytes([record[14], record[15], record[16], record[17]]);

    let ipv4 = Ipv4Settings {
        address,
        netmask,
        gateway: (!gateway.is_unspecified()).then_some(gateway),
    };

    let config = match mode {
        AddressingMode::Dhcp if address.is_unspecified() => NetworkConfig::dhcp_unbound(),
        AddressingMode::Dhcp => NetworkConfig::dhcp_bound(ipv4, lease_time_secs),
        AddressingMode::Static => NetworkConfig::static_ip(ipv4),
    };

    if !config.is_valid() {
        return Err(invalid(format!("stored record is inconsistent: {config:?}")));
    }

    Ok(config)
}
