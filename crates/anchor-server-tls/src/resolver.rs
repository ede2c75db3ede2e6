//! Per-handshake choice between the ECDSA and RSA certificates

use crate::provision::DualCertificates;
use anchor_acme::is_ecdsa_suite;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Serves one hostname with an ECDSA and an RSA certificate
///
/// Clients able to verify an ECDSA signature get the ECDSA certificate,
/// everyone else gets the RSA one. Handshakes naming another host are
/// refused. The pair can be swapped while the listener is running.
pub struct DualCertResolver {
    server_name: String,
    current: RwLock<DualCertificates>,
}

impl DualCertResolver {
    pub fn new(server_name: impl Into<String>, certificates: DualCertificates) -> Self {
        Self {
            server_name: server_name.into(),
            current: RwLock::new(certificates),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn snapshot(&self) -> DualCertificates {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The explicit certificate list, ECDSA first
    pub fn certificates(&self) -> Vec<Arc<CertifiedKey>> {
        let current = self.snapshot();
        vec![current.ecdsa, current.rsa]
    }

    /// Serve `certificates` from now on
    ///
    /// Returns `false` when the pair is the one already being served.
    pub fn replace(&self, certificates: DualCertificates) -> bool {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if Arc::ptr_eq(&current.ecdsa, &certificates.ecdsa)
            && Arc::ptr_eq(&current.rsa, &certificates.rsa)
        {
            return false;
        }

        *current = certificates;
        true
    }

    /// Whether a handshake with this SNI may be answered
    ///
    /// Clients that send no SNI get the configured host's certificate.
    pub fn accepts_server_name(&self, sni: Option<&str>) -> bool {
        match sni {
            None => true,
            Some(sni) => sni
                .trim_end_matches('.')
                .eq_ignore_ascii_case(self.server_name.trim_end_matches('.')),
        }
    }

    /// Pick a certificate for the offered signature schemes and suites
    ///
    /// TLS 1.3 suites do not name a key type, so only the signature schemes
    /// decide there.
    pub fn select(
        &self,
        signature_schemes: &[SignatureScheme],
        cipher_suites: &[rustls::CipherSuite],
    ) -> Option<Arc<CertifiedKey>> {
        let current = self.snapshot();
        let suite_allows_ecdsa = cipher_suites
            .iter()
            .any(|suite| is_tls13_suite(*suite) || is_ecdsa_suite(*suite));

        if suite_allows_ecdsa && current.ecdsa.key.choose_scheme(signature_schemes).is_some() {
            debug!(server_name = %self.server_name, "Serving ECDSA certificate");
            return Some(current.ecdsa);
        }

        if current.rsa.key.choose_scheme(signature_schemes).is_some() {
            debug!(server_name = %self.server_name, "Serving RSA certificate");
            return Some(current.rsa);
        }

        None
    }
}

fn is_tls13_suite(suite: rustls::CipherSuite) -> bool {
    matches!(
        suite,
        rustls::CipherSuite::TLS13_AES_128_GCM_SHA256
            | rustls::CipherSuite::TLS13_AES_256_GCM_SHA384
            | rustls::CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
    )
}

impl ResolvesServerCert for DualCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();
        if !self.accepts_server_name(sni) {
            warn!(
                sni = ?sni,
                server_name = %self.server_name,
                "Refusing handshake for a host this listener does not serve"
            );
            return None;
        }

        let selected = self.select(
            client_hello.signature_schemes(),
            client_hello.cipher_suites(),
        );

        if selected.is_none() {
            warn!(
                server_name = %self.server_name,
                "No certificate matches the client's signature schemes"
            );
        }

        selected
    }
}

impl std::fmt::Debug for DualCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualCertResolver")
            .field("server_name", &self.server_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::CipherSuite;

    fn load(cert_pem: &[u8], key_pem: &[u8]) -> Arc<CertifiedKey> {
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<_, _>>()
            .unwrap();
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .unwrap()
            .unwrap();
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).unwrap();
        Arc::new(CertifiedKey::new(chain, signing_key))
    }

    fn resolver() -> DualCertResolver {
        DualCertResolver::new(
            "example.test",
            DualCertificates {
                ecdsa: load(
                    include_bytes!("../tests/fixtures/ecdsa_cert.pem"),
                    include_bytes!("../tests/fixtures/ecdsa_key.pem"),
                ),
                rsa: load(
                    include_bytes!("../tests/fixtures/rsa_cert.pem"),
                    include_bytes!("../tests/fixtures/rsa_key.pem"),
                ),
            },
        )
    }

    #[test]
    fn test_ecdsa_capable_client_gets_ecdsa() {
        let resolver = resolver();
        let selected = resolver
            .select(
                &[
                    SignatureScheme::ECDSA_NISTP256_SHA256,
                    SignatureScheme::RSA_PSS_SHA256,
                ],
                &[CipherSuite::TLS13_AES_128_GCM_SHA256],
            )
            .unwrap();

        assert!(Arc::ptr_eq(&selected, &resolver.certificates()[0]));
    }

    #[test]
    fn test_rsa_only_client_gets_rsa() {
        let resolver = resolver();
        let selected = resolver
            .select(
                &[SignatureScheme::RSA_PSS_SHA256, SignatureScheme::RSA_PKCS1_SHA256],
                &[CipherSuite::TLS13_AES_128_GCM_SHA256],
            )
            .unwrap();

        assert!(Arc::ptr_eq(&selected, &resolver.certificates()[1]));
    }

    #[test]
    fn test_tls12_rsa_suites_get_rsa() {
        let resolver = resolver();
        let selected = resolver
            .select(
                &[
                    SignatureScheme::ECDSA_NISTP256_SHA256,
                    SignatureScheme::RSA_PKCS1_SHA256,
                ],
                &[CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
            )
            .unwrap();

        assert!(Arc::ptr_eq(&selected, &resolver.certificates()[1]));
    }

    #[test]
    fn test_no_usable_scheme() {
        let resolver = resolver();
        let selected = resolver.select(
            &[SignatureScheme::ED25519],
            &[CipherSuite::TLS13_AES_128_GCM_SHA256],
        );
        assert!(selected.is_none());
    }

    #[test]
    fn test_server_name_matching() {
        let resolver = resolver();

        assert!(resolver.accepts_server_name(Some("example.test")));
        assert!(resolver.accepts_server_name(Some("EXAMPLE.test.")));
        assert!(resolver.accepts_server_name(None));
        assert!(!resolver.accepts_server_name(Some("not-allowed.other")));
        assert!(!resolver.accepts_server_name(Some("www.example.test")));
    }

    #[test]
    fn test_replace_swaps_served_pair() {
        let resolver = resolver();
        let before = resolver.certificates();

        let same = DualCertificates {
            ecdsa: before[0].clone(),
            rsa: before[1].clone(),
        };
        assert!(!resolver.replace(same));

        let rotated = DualCertificates {
            ecdsa: Arc::new((*before[0]).clone()),
            rsa: Arc::new((*before[1]).clone()),
        };
        assert!(resolver.replace(rotated.clone()));

        let after = resolver.certificates();
        assert!(Arc::ptr_eq(&after[0], &rotated.ecdsa));
        assert!(Arc::ptr_eq(&after[1], &rotated.rsa));

        let selected = resolver
            .select(
                &[SignatureScheme::ECDSA_NISTP256_SHA256],
                &[CipherSuite::TLS13_AES_128_GCM_SHA256],
            )
            .unwrap();
        assert!(Arc::ptr_eq(&selected, &rotated.ecdsa));
    }

    #[test]
    fn test_certificate_list_holds_both() {
        let resolver = resolver();
        let certs = resolver.certificates();

        assert_eq!(certs.len(), 2);
        assert!(!Arc::ptr_eq(&certs[0], &certs[1]));
        assert_eq!(resolver.server_name(), "example.test");
    }
}
