//! TLS credential registration.
//!
//! Credentials are registered once per process under numeric security tags and
//! later turned into the rustls configuration of the HTTPS listener. The store
//! is append-only: an entry cannot be replaced, and a failed provisioning run
//! leaves the entries registered so far in place.

use crate::config::CertificateConfig;
use anyhow::{Context, Result, bail, ensure};
use log::{debug, error, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use rustls::{
    crypto::ring::default_provider,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use std::{
    collections::HashMap,
    fmt, fs,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;

pub type SecTag = u32;

pub const SERVER_CERTIFICATE_TAG: SecTag = 1;
pub const PSK_TAG: SecTag = 2;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CredentialKind {
    ServerCertificate,
    PrivateKey,
    Psk,
    PskId,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CredentialKind::ServerCertificate => "server certificate",
            CredentialKind::PrivateKey => "private key",
            CredentialKind::Psk => "PSK",
            CredentialKind::PskId => "PSK identity",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to register {kind} (tag {tag}): {reason}")]
    RegistrationFailed {
        tag: SecTag,
        kind: CredentialKind,
        reason: String,
    },

    #[error("registered credentials are not usable for TLS: {reason}")]
    Unusable { reason: String },
}

/// Tagged credential storage consulted by the TLS layer.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CredentialStore: Send + Sync {
    fn add(&self, tag: SecTag, kind: CredentialKind, data: &[u8]) -> Result<()>;
    fn get(&self, tag: SecTag, kind: CredentialKind) -> Option<Vec<u8>>;
}

/// In-process credential store that validates PEM material on registration.
#[derive(Default)]
pub struct TlsCredentialStore {
    entries: Mutex<HashMap<(SecTag, CredentialKind), Vec<u8>>>,
}

impl TlsCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for TlsCredentialStore {
    fn add(&self, tag: SecTag, kind: CredentialKind, data: &[u8]) -> Result<()> {
        ensure!(!data.is_empty(), "empty {kind}");

        match kind {
            CredentialKind::ServerCertificate => {
                parse_certificates(data)?;
            }
            CredentialKind::PrivateKey => {
                parse_private_key(data)?;
            }
            CredentialKind::PskId => {
                std::str::from_utf8(data).context("PSK identity is not valid UTF-8")?;
            }
            CredentialKind::Psk => {}
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        ensure!(
            !entries.contains_key(&(tag, kind)),
            "{kind} already registered under tag {tag}"
        );
        entries.insert((tag, kind), data.to_vec());

        debug!("registered {kind} under tag {tag}");
        Ok(())
    }

    fn get(&self, tag: SecTag, kind: CredentialKind) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(tag, kind))
            .cloned()
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct PskCredential {
    pub identity: String,
    pub secret: Vec<u8>,
}

impl fmt::Debug for PskCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskCredential")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct CredentialSet {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
    pub psk: Option<PskCredential>,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("psk", &self.psk)
            .finish_non_exhaustive()
    }
}

impl CredentialSet {
    pub fn load(config: &CertificateConfig) -> Result<Self> {
        let certificate = fs::read(&config.cert_path)
            .with_context(|| format!("failed to read certificate {:?}", config.cert_path))?;
        let private_key = fs::read(&config.key_path)
            .with_context(|| format!("failed to read private key {:?}", config.key_path))?;

        let psk = match (&config.psk_path, &config.psk_identity) {
            (Some(path), Some(identity)) => Some(PskCredential {
                identity: identity.clone(),
                secret: fs::read(path)
                    .with_context(|| format!("failed to read PSK {path:?}"))?,
            }),
            (None, None) => None,
            _ => bail!("PSK_PATH and PSK_IDENTITY must be set together"),
        };

        Ok(Self {
            certificate,
            private_key,
            psk,
        })
    }

    fn entries(&self) -> Vec<(SecTag, CredentialKind, &[u8])> {
        let mut entries = vec![
            (
                SERVER_CERTIFICATE_TAG,
                CredentialKind::ServerCertificate,
                self.certificate.as_slice(),
            ),
            (
                SERVER_CERTIFICATE_TAG,
                CredentialKind::PrivateKey,
                self.private_key.as_slice(),
            ),
        ];

        if let Some(psk) = &self.psk {
            entries.push((PSK_TAG, CredentialKind::Psk, psk.secret.as_slice()));
            entries.push((PSK_TAG, CredentialKind::PskId, psk.identity.as_bytes()));
        }

        entries
    }
}

/// Registers a [`CredentialSet`] exactly once.
pub struct CredentialProvisioner<S> {
    store: Arc<S>,
    provisioned: Mutex<bool>,
}

impl<S: CredentialStore> CredentialProvisioner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            provisioned: Mutex::new(false),
        }
    }

    pub fn is_provisioned(&self) -> bool {
        *self.provisioned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register certificate, private key and the optional PSK pair, in that
    /// order. The first rejected entry aborts the run.
    ///
    /// Calling this again after a successful run is a no-op.
    pub fn provision(&self, credentials: &CredentialSet) -> Result<(), CredentialError> {
        let mut provisioned = self
            .provisioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if *provisioned {
            debug!("TLS credentials already provisioned");
            return Ok(());
        }

        let entries = credentials.entries();
        let total = entries.len();

        for (registered, (tag, kind, data)) in entries.into_iter().enumerate() {
            if let Err(e) = self.store.add(tag, kind, data) {
                error!("failed to register {kind} under tag {tag}: {e:#}");

                if registered > 0 {
                    warn!(
                        "TLS credentials partially registered ({registered} of {total}); \
                         remove them from the credential store before provisioning again"
                    );
                }

                return Err(CredentialError::RegistrationFailed {
                    tag,
                    kind,
                    reason: format!("{e:#}"),
                });
            }
        }

        *provisioned = true;
        info!("TLS credentials configured ({total} entries)");
        Ok(())
    }

    pub fn server_config(&self) -> Result<rustls::ServerConfig, CredentialError> {
        tls_server_config(self.store.as_ref(), SERVER_CERTIFICATE_TAG)
    }
}

/// Build the HTTPS server configuration from the certificate and key
/// registered under `tag`.
pub fn tls_server_config<S>(store: &S, tag: SecTag) -> Result<rustls::ServerConfig, CredentialError>
where
    S: CredentialStore + ?Sized,
{
    let unusable = |e: anyhow::Error| CredentialError::Unusable {
        reason: format!("{e:#}"),
    };

    let certificate = store
        .get(tag, CredentialKind::ServerCertificate)
        .ok_or_else(|| anyhow::anyhow!("no server certificate registered under tag {tag}"))
        .map_err(unusable)?;
    let private_key = store
        .get(tag, CredentialKind::PrivateKey)
        .ok_or_else(|| anyhow::anyhow!("no private key registered under tag {tag}"))
        .map_err(unusable)?;

    let certificates = parse_certificates(&certificate).map_err(unusable)?;
    let private_key = parse_private_key(&private_key).map_err(unusable)?;

    rustls::ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")
        .map_err(unusable)?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("failed to create tls config")
        .map_err(unusable)
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certificates = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate pem")?;

    ensure!(!certificates.is_empty(), "no certificate found in pem");
    Ok(certificates)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let key_item = rustls_pemfile::read_one(&mut &pem[..])
        .context("failed to read key pem")?
        .context("no valid key found in pem")?;

    match key_item {
        rustls_pemfile::Item::Pkcs1Key(key) => Ok(PrivateKeyDer::Pkcs1(key)),
        rustls_pemfile::Item::Pkcs8Key(key) => Ok(PrivateKeyDer::Pkcs8(key)),
        rustls_pemfile::Item::Sec1Key(key) => Ok(PrivateKeyDer::Sec1(key)),
        _ => bail!("unexpected key type in pem"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::{Sequence, predicate::eq};

    const CERT_PEM: &[u8] = include_bytes!("../../tests/fixtures/server-cert.pem");
    const KEY_PEM: &[u8] = include_bytes!("../../tests/fixtures/server-key.pem");

    fn credentials(psk: bool) -> CredentialSet {
        CredentialSet {
            certificate: CERT_PEM.to_vec(),
            private_key: KEY_PEM.to_vec(),
            psk: psk.then(|| PskCredential {
                identity: "device-1".to_string(),
                secret: vec![0x01, 0x02, 0x03, 0x04],
            }),
        }
    }

    mod store {
        use super::*;

        #[test]
        fn accepts_valid_pem() {
            let store = TlsCredentialStore::new();

            store
                .add(SERVER_CERTIFICATE_TAG, CredentialKind::ServerCertificate, CERT_PEM)
                .unwrap();
            store
                .add(SERVER_CERTIFICATE_TAG, CredentialKind::PrivateKey, KEY_PEM)
                .unwrap();

            assert_eq!(
                store.get(SERVER_CERTIFICATE_TAG, CredentialKind::PrivateKey),
                Some(KEY_PEM.to_vec())
            );
        }

        #[test]
        fn rejects_duplicate_tag() {
            let store = TlsCredentialStore::new();
            store.add(PSK_TAG, CredentialKind::Psk, b"secret").unwrap();

            assert!(store.add(PSK_TAG, CredentialKind::Psk, b"other").is_err());
            assert_eq!(
                store.get(PSK_TAG, CredentialKind::Psk),
                Some(b"secret".to_vec())
            );
        }

        #[test]
        fn rejects_empty_and_malformed_entries() {
            let store = TlsCredentialStore::new();

            assert!(store.add(PSK_TAG, CredentialKind::Psk, b"").is_err());
            assert!(
                store
                    .add(SERVER_CERTIFICATE_TAG, CredentialKind::PrivateKey, b"not a key")
                    .is_err()
            );
            assert!(
                store
                    .add(SERVER_CERTIFICATE_TAG, CredentialKind::ServerCertificate, KEY_PEM)
                    .is_err()
            );
            assert!(store.add(PSK_TAG, CredentialKind::PskId, &[0xff, 0xfe]).is_err());
        }

        #[test]
        fn builds_tls_config() {
            let provisioner = CredentialProvisioner::new(Arc::new(TlsCredentialStore::new()));
            provisioner.provision(&credentials(false)).unwrap();

            assert!(provisioner.server_config().is_ok());
        }

        #[test]
        fn tls_config_requires_registered_key() {
            let store = TlsCredentialStore::new();
            store
                .add(SERVER_CERTIFICATE_TAG, CredentialKind::ServerCertificate, CERT_PEM)
                .unwrap();

            assert!(matches!(
                tls_server_config(&store, SERVER_CERTIFICATE_TAG),
                Err(CredentialError::Unusable { .. })
            ));
        }
    }

    mod provision {
        use super::*;

        #[test]
        fn registers_in_fixed_order() {
            let mut store = MockCredentialStore::new();
            let mut seq = Sequence::new();

            for (tag, kind) in [
                (SERVER_CERTIFICATE_TAG, CredentialKind::ServerCertificate),
                (SERVER_CERTIFICATE_TAG, CredentialKind::PrivateKey),
                (PSK_TAG, CredentialKind::Psk),
                (PSK_TAG, CredentialKind::PskId),
            ] {
                store
                    .expect_add()
                    .with(eq(tag), eq(kind), mockall::predicate::always())
                    .times(1)
                    .in_sequence(&mut seq)
                    .returning(|_, _, _| Ok(()));
            }

            let provisioner = CredentialProvisioner::new(Arc::new(store));

            provisioner.provision(&credentials(true)).unwrap();
            assert!(provisioner.is_provisioned());
        }

        #[test]
        fn first_failure_aborts_remaining_entries() {
            let mut store = MockCredentialStore::new();
            let mut seq = Sequence::new();

            store
                .expect_add()
                .with(
                    eq(SERVER_CERTIFICATE_TAG),
                    eq(CredentialKind::ServerCertificate),
                    mockall::predicate::always(),
                )
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(()));
            store
                .expect_add()
                .with(
                    eq(SERVER_CERTIFICATE_TAG),
                    eq(CredentialKind::PrivateKey),
                    mockall::predicate::always(),
                )
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Err(anyhow::anyhow!("malformed key")));

            let provisioner = CredentialProvisioner::new(Arc::new(store));

            let result = provisioner.provision(&credentials(true));

            assert!(matches!(
                result,
                Err(CredentialError::RegistrationFailed {
                    tag: SERVER_CERTIFICATE_TAG,
                    kind: CredentialKind::PrivateKey,
                    ..
                })
            ));
            assert!(!provisioner.is_provisioned());
        }

        #[test]
        fn second_run_is_a_no_op() {
            let mut store = MockCredentialStore::new();
            store.expect_add().times(2).returning(|_, _, _| Ok(()));

            let provisioner = CredentialProvisioner::new(Arc::new(store));

            provisioner.provision(&credentials(false)).unwrap();
            provisioner.provision(&credentials(false)).unwrap();
        }

        #[test]
        fn duplicate_registration_is_rejected_by_store() {
            let store = Arc::new(TlsCredentialStore::new());
            CredentialProvisioner::new(Arc::clone(&store))
                .provision(&credentials(false))
                .unwrap();

            let result = CredentialProvisioner::new(store).provision(&credentials(false));

            assert!(matches!(
                result,
                Err(CredentialError::RegistrationFailed {
                    kind: CredentialKind::ServerCertificate,
                    ..
                })
            ));
        }
    }

    mod credential_set {
        use super::*;
        use std::path::PathBuf;
        use tempfile::TempDir;

        fn config(dir: &TempDir, psk_path: Option<PathBuf>, psk_identity: Option<&str>) -> CertificateConfig {
            let cert_path = dir.path().join("cert.pem");
            let key_path = dir.path().join("key.pem");
            fs::write(&cert_path, CERT_PEM).unwrap();
            fs::write(&key_path, KEY_PEM).unwrap();

            CertificateConfig {
                cert_path,
                key_path,
                psk_path,
                psk_identity: psk_identity.map(str::to_string),
            }
        }

        #[test]
        fn loads_certificate_and_key() {
            let dir = TempDir::new().unwrap();

            let set = CredentialSet::load(&config(&dir, None, None)).unwrap();

            assert_eq!(set, credentials(false));
        }

        #[test]
        fn loads_psk_pair() {
            let dir = TempDir::new().unwrap();
            let psk_path = dir.path().join("psk");
            fs::write(&psk_path, [0x01, 0x02, 0x03, 0x04]).unwrap();

            let set = CredentialSet::load(&config(&dir, Some(psk_path), Some("device-1"))).unwrap();

            assert_eq!(set, credentials(true));
        }

        #[test]
        fn psk_identity_without_secret_is_rejected() {
            let dir = TempDir::new().unwrap();

            assert!(CredentialSet::load(&config(&dir, None, Some("device-1"))).is_err());
        }

        #[test]
        fn debug_output_hides_secrets() {
            let text = format!("{:?}", credentials(true));

            assert!(text.contains("device-1"));
            assert!(!text.contains("PRIVATE KEY"));
        }
    }
}
