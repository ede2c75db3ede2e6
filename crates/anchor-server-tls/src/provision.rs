//! Dual-algorithm certificate provisioning
//!
//! The manager picks a key algorithm from the cipher suites a client offers.
//! Asking twice, each time with a single-suite handshake, yields one ECDSA
//! and one RSA certificate for the same host.

use crate::error::ListenError;
use anchor_acme::{CertificateManager, HandshakeDescriptor, KeyAlgorithm};
use rustls::sign::CertifiedKey;
use rustls::CipherSuite;
use std::sync::Arc;
use tracing::{debug, info};

/// Suite offered by the ECDSA request
pub const ECDSA_REQUEST_SUITE: CipherSuite = CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256;

/// Suite offered by the RSA request
pub const RSA_REQUEST_SUITE: CipherSuite = CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256;

/// One certificate per key algorithm for a single host
#[derive(Clone)]
pub struct DualCertificates {
    pub ecdsa: Arc<CertifiedKey>,
    pub rsa: Arc<CertifiedKey>,
}

impl std::fmt::Debug for DualCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualCertificates")
            .field("ecdsa_chain_len", &self.ecdsa.cert.len())
            .field("rsa_chain_len", &self.rsa.cert.len())
            .finish()
    }
}

/// Synthetic handshake that only offers `suite`
pub fn synthetic_hello(host: &str, suite: CipherSuite) -> HandshakeDescriptor {
    HandshakeDescriptor::new(host, vec![suite])
}

/// Obtain an ECDSA and an RSA certificate for `host`
///
/// Both are required. Failure to obtain either one fails the whole call.
pub async fn provision_dual(
    manager: &dyn CertificateManager,
    host: &str,
) -> Result<DualCertificates, ListenError> {
    let ecdsa = fetch(manager, host, ECDSA_REQUEST_SUITE, KeyAlgorithm::Ecdsa).await?;
    let rsa = fetch(manager, host, RSA_REQUEST_SUITE, KeyAlgorithm::Rsa).await?;

    info!(host = %host, "Provisioned ECDSA and RSA certificates");

    Ok(DualCertificates { ecdsa, rsa })
}

async fn fetch(
    manager: &dyn CertificateManager,
    host: &str,
    suite: CipherSuite,
    algorithm: KeyAlgorithm,
) -> Result<Arc<CertifiedKey>, ListenError> {
    debug!(host = %host, algorithm = %algorithm, "Requesting certificate");

    manager
        .get_certificate(&synthetic_hello(host, suite))
        .await
        .map_err(|source| ListenError::CertificateProvisioningFailure {
            host: host.to_string(),
            algorithm,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_select_each_algorithm() {
        assert_eq!(
            synthetic_hello("example.test", ECDSA_REQUEST_SUITE).key_algorithm(),
            KeyAlgorithm::Ecdsa
        );
        assert_eq!(
            synthetic_hello("example.test", RSA_REQUEST_SUITE).key_algorithm(),
            KeyAlgorithm::Rsa
        );
    }

    #[test]
    fn test_request_offers_a_single_suite() {
        let hello = synthetic_hello("example.test", RSA_REQUEST_SUITE);
        assert_eq!(hello.server_name, "example.test");
        assert_eq!(hello.cipher_suites, vec![RSA_REQUEST_SUITE]);
    }
}
