//! Bring-up and service orchestration
//!
//! The network engine, configuration persistence and decoding, TLS credential
//! provisioning and the service lifecycle. Nothing in here knows about HTTP
//! request handling.

pub mod certificate;
pub mod decoder;
pub mod lifecycle;
pub mod network;
pub mod store;
