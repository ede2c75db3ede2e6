//! Certificate manager contract
//!
//! A certificate manager provisions (or returns cached) certificates for a
//! handshake description. The listener only talks to managers through these
//! traits, so the ACME-backed implementation can be swapped for another one.

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use rustls::CipherSuite;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Certificate manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Host not allowed by policy: {0}")]
    HostNotAllowed(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Order not ready: {0}")]
    OrderNotReady(String),

    #[error("HTTP-01 challenge not available")]
    NoHttp01Challenge,

    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Manager configuration error: {0}")]
    Configuration(String),
}

/// Server name and offered cipher suites of a (possibly synthetic) client hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeDescriptor {
    pub server_name: String,
    pub cipher_suites: Vec<CipherSuite>,
}

impl HandshakeDescriptor {
    pub fn new(server_name: impl Into<String>, cipher_suites: Vec<CipherSuite>) -> Self {
        Self {
            server_name: server_name.into(),
            cipher_suites,
        }
    }

    /// Key algorithm a manager should provision for this handshake
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::for_descriptor(self)
    }
}

/// Key algorithm of a provisioned certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// ECDSA P-256
    Ecdsa,
    /// RSA 2048
    Rsa,
}

impl KeyAlgorithm {
    /// ECDSA when any offered suite is an ECDHE_ECDSA suite, RSA otherwise
    pub fn for_descriptor(descriptor: &HandshakeDescriptor) -> Self {
        if descriptor.cipher_suites.iter().copied().any(is_ecdsa_suite) {
            KeyAlgorithm::Ecdsa
        } else {
            KeyAlgorithm::Rsa
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Ecdsa => f.write_str("ecdsa"),
            KeyAlgorithm::Rsa => f.write_str("rsa"),
        }
    }
}

/// Whether a TLS 1.2 suite authenticates the server with an ECDSA key
pub fn is_ecdsa_suite(suite: CipherSuite) -> bool {
    matches!(
        suite,
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
    )
}

/// Settings a manager is configured with
#[derive(Clone)]
pub struct ManagerSettings {
    /// ACME directory endpoint
    pub directory_url: String,
    /// External account binding: key id and decoded HMAC key
    pub external_account: Option<(String, Vec<u8>)>,
    /// Hosts the manager may provision certificates for
    pub allowed_hosts: Vec<String>,
    /// Accept the CA's terms of service when registering
    pub terms_of_service_agreed: bool,
}

impl ManagerSettings {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            external_account: None,
            allowed_hosts: Vec::new(),
            terms_of_service_agreed: true,
        }
    }

    pub fn with_external_account(mut self, key_id: impl Into<String>, key: Vec<u8>) -> Self {
        self.external_account = Some((key_id.into(), key));
        self
    }

    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts;
        self
    }

    /// Host allow-list check (case-insensitive, exact match)
    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }
}

impl fmt::Debug for ManagerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerSettings")
            .field("directory_url", &self.directory_url)
            .field(
                "external_account",
                &self.external_account.as_ref().map(|(kid, _)| kid),
            )
            .field("allowed_hosts", &self.allowed_hosts)
            .field("terms_of_service_agreed", &self.terms_of_service_agreed)
            .finish()
    }
}

/// Provisions certificates on demand
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Return a certificate matching the handshake, provisioning one if needed
    async fn get_certificate(
        &self,
        hello: &HandshakeDescriptor,
    ) -> Result<Arc<CertifiedKey>, ManagerError>;
}

/// Builds a certificate manager from settings
///
/// Implementations must not perform network I/O here; contacting the CA
/// happens on the first certificate request.
pub trait ManagerConnector: Send + Sync {
    fn configure(
        &self,
        settings: ManagerSettings,
    ) -> Result<Arc<dyn CertificateManager>, ManagerError>;
}
