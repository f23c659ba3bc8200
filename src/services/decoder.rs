//! Decoding of the device configuration payload.
//!
//! The payload is a flat JSON object. Every key is required; a missing or
//! mistyped key is reported as [`DecodeError::Malformed`], nothing is
//! defaulted.

use crate::services::network::{AcquisitionMode, NetworkConfig, StaticAddressing};
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_valid::Validate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed configuration payload: {reason}")]
    Malformed { reason: String },
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DhcpSwitch {
    #[serde(rename = "on")]
    On,
    #[serde(rename = "off")]
    Off,
}

/// Enablement of the eight CAN channels (two buses with four channels each).
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CanChannels {
    #[serde(rename = "isEnabled_CAN_1_0", deserialize_with = "flag")]
    pub can_1_0: bool,
    #[serde(rename = "isEnabled_CAN_1_1", deserialize_with = "flag")]
    pub can_1_1: bool,
    #[serde(rename = "isEnabled_CAN_1_2", deserialize_with = "flag")]
    pub can_1_2: bool,
    #[serde(rename = "isEnabled_CAN_1_3", deserialize_with = "flag")]
    pub can_1_3: bool,
    #[serde(rename = "isEnabled_CAN_2_0", deserialize_with = "flag")]
    pub can_2_0: bool,
    #[serde(rename = "isEnabled_CAN_2_1", deserialize_with = "flag")]
    pub can_2_1: bool,
    #[serde(rename = "isEnabled_CAN_2_2", deserialize_with = "flag")]
    pub can_2_2: bool,
    #[serde(rename = "isEnabled_CAN_2_3", deserialize_with = "flag")]
    pub can_2_3: bool,
}

impl CanChannels {
    pub fn as_array(&self) -> [bool; 8] {
        [
            self.can_1_0,
            self.can_1_1,
            self.can_1_2,
            self.can_1_3,
            self.can_2_0,
            self.can_2_1,
            self.can_2_2,
            self.can_2_3,
        ]
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, Validate)]
pub struct ConfigPayload {
    #[serde(rename = "DHCP")]
    pub dhcp: DhcpSwitch,
    #[serde(rename = "IP4Address")]
    #[validate(max_length = 15)]
    pub ip4_address: String,
    #[serde(rename = "NetMask")]
    #[validate(max_length = 15)]
    pub netmask: String,
    #[serde(flatten)]
    pub can: CanChannels,
}

impl ConfigPayload {
    pub fn acquisition_mode(&self) -> AcquisitionMode {
        match self.dhcp {
            DhcpSwitch::On => AcquisitionMode::Dhcp,
            DhcpSwitch::Off => AcquisitionMode::Static(StaticAddressing::new(
                &self.ip4_address,
                &self.netmask,
                None,
            )),
        }
    }

    /// Network configuration requested by the payload.
    ///
    /// With DHCP on the address fields are not used until a lease is bound.
    pub fn network_config(&self) -> Result<NetworkConfig, DecodeError> {
        match self.acquisition_mode() {
            AcquisitionMode::Dhcp => Ok(NetworkConfig::dhcp_unbound()),
            AcquisitionMode::Static(addressing) => addressing
                .parse()
                .map(NetworkConfig::static_ip)
                .map_err(|e| DecodeError::Malformed {
                    reason: e.to_string(),
                }),
        }
    }
}

pub fn decode(text: &str) -> Result<ConfigPayload, DecodeError> {
    let payload: ConfigPayload =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed {
            reason: e.to_string(),
        })?;

    payload.validate().map_err(|e| DecodeError::Malformed {
        reason: e.to_string(),
    })?;

    Ok(payload)
}

pub fn decode_network_config(text: &str) -> Result<NetworkConfig, DecodeError> {
    decode(text)?.network_config()
}

/// Accept `0`/`1` as well as `false`/`true`.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(u64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Number(0) => Ok(false),
        Flag::Number(1) => Ok(true),
        Flag::Number(other) => Err(D::Error::custom(format!(
            "flag must be 0 or 1, got {other}"
        ))),
    }
}
