pub mod api;
pub mod config;
pub mod http_client;
pub mod server;
pub mod services;

pub use services::network;
