use crate::services::network::{AddressingMode, DEFAULT_DHCP_TIMEOUT, StaticAddressing};
use anyhow::{Context, Result, anyhow};
use std::{env, fmt, net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Interface and address acquisition
    pub network: NetworkSettings,

    /// HTTP(S) listener configuration
    pub server: ServerSettings,

    /// TLS credential locations
    pub certificate: CertificateConfig,

    /// Path configuration
    pub paths: PathConfig,
}

#[derive(Clone, Debug)]
pub struct NetworkSettings {
    pub interface: String,
    pub network_dir: PathBuf,
    /// Preferred mode when no configuration has been stored yet.
    pub mode: AddressingMode,
    pub static_addressing: Option<StaticAddressing>,
    pub dhcp_timeout: Duration,
    pub fallback_to_static: bool,
    pub reacquire_on_loss: bool,
    pub retry_delay: Duration,
}

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub http_port: u16,
    pub https_port: u16,
    pub enable_http: bool,
    pub enable_https: bool,
    pub bind_address: IpAddr,
}

#[derive(Clone, Debug)]
pub struct CertificateConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub psk_path: Option<PathBuf>,
    pub psk_identity: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub store_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl AppConfig {
    /// Load all configuration from environment variables
    ///
    /// Unset variables fall back to their defaults, malformed values are an
    /// error.
    pub fn load() -> Result<Self> {
        let network = NetworkSettings::load()?;
        let server = ServerSettings::load()?;
        let certificate = CertificateConfig::load()?;
        let paths = PathConfig::load()?;

        Ok(Self {
            network,
            server,
            certificate,
            paths,
        })
    }
}

impl NetworkSettings {
    fn load() -> Result<Self> {
        let interface = env::var("NET_INTERFACE").unwrap_or_else(|_| "eth0".to_string());
        let network_dir = env::var("NETWORK_DIR")
            .unwrap_or_else(|_| "/etc/systemd/network".to_string())
            .into();
        let mode = parse_var("BRINGUP_MODE", AddressingMode::Dhcp)?;

        let static_addressing = match env::var("STATIC_IP4_ADDRESS") {
            Ok(address) => {
                let netmask = env::var("STATIC_NETMASK")
                    .context("failed to get STATIC_NETMASK: required with STATIC_IP4_ADDRESS")?;
                let gateway = env::var("STATIC_GATEWAY").ok();
                let addressing = StaticAddressing::new(&address, &netmask, gateway.as_deref());

                addressing
                    .parse()
                    .context("failed to parse static addressing")?;
                Some(addressing)
            }
            Err(_) => None,
        };

        anyhow::ensure!(
            mode != AddressingMode::Static || static_addressing.is_some(),
            "BRINGUP_MODE=static requires STATIC_IP4_ADDRESS and STATIC_NETMASK"
        );

        let dhcp_timeout = Duration::from_secs(parse_var(
            "DHCP_TIMEOUT_SECS",
            DEFAULT_DHCP_TIMEOUT.as_secs(),
        )?);
        let fallback_to_static = parse_var("DHCP_FALLBACK_TO_STATIC", true)?;
        let reacquire_on_loss = parse_var("REACQUIRE_ON_LOSS", true)?;
        let retry_delay = Duration::from_secs(parse_var("RETRY_DELAY_SECS", 5)?);

        Ok(Self {
            interface,
            network_dir,
            mode,
            static_addressing,
            dhcp_timeout,
            fallback_to_static,
            reacquire_on_loss,
            retry_delay,
        })
    }
}

impl ServerSettings {
    fn load() -> Result<Self> {
        Ok(Self {
            http_port: parse_var("HTTP_PORT", 80)?,
            https_port: parse_var("HTTPS_PORT", 443)?,
            enable_http: parse_var("ENABLE_HTTP", true)?,
            enable_https: parse_var("ENABLE_HTTPS", false)?,
            bind_address: parse_var("BIND_ADDRESS", IpAddr::from([0, 0, 0, 0]))?,
        })
    }
}

impl CertificateConfig {
    fn load() -> Result<Self> {
        let cert_path = env::var("CERT_PATH")
            .unwrap_or_else(|_| "/cert/cert.pem".to_string())
            .into();

        let key_path = env::var("KEY_PATH")
            .unwrap_or_else(|_| "/cert/key.pem".to_string())
            .into();

        let psk_path = env::var("PSK_PATH").ok().map(PathBuf::from);
        let psk_identity = env::var("PSK_IDENTITY").ok();

        Ok(Self {
            cert_path,
            key_path,
            psk_path,
            psk_identity,
        })
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "/data".to_string()));
        let store_dir = data_dir.join("nvs");
        let static_dir = env::var("STATIC_DIR")
            .unwrap_or_else(|_| "static".to_string())
            .into();

        Ok(Self {
            data_dir,
            store_dir,
            static_dir,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("failed to parse {name}: invalid format \"{value}\" ({e})")),
        Err(_) => Ok(default),
    }
}
