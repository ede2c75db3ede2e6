//! Trust pool built from certificate set members

use crate::certificate::Certificate;
use rustls::RootCertStore;
use std::collections::HashSet;
use tracing::debug;

/// Set of trust anchors for certificate verification
///
/// Adding a certificate that is already present is a no-op.
#[derive(Debug, Clone)]
pub struct CertPool {
    roots: RootCertStore,
    added: HashSet<Vec<u8>>,
}

impl CertPool {
    pub fn new() -> Self {
        Self {
            roots: RootCertStore::empty(),
            added: HashSet::new(),
        }
    }

    /// Add a certificate as a trust anchor
    ///
    /// Returns `false` when the certificate was already in the pool or could
    /// not be used as a trust anchor.
    pub fn add(&mut self, cert: &Certificate) -> bool {
        let der = cert.der();
        let bytes: &[u8] = der.as_ref();
        if self.added.contains(bytes) {
            return false;
        }

        match self.roots.add(der.clone()) {
            Ok(()) => {
                self.added.insert(bytes.to_vec());
                true
            }
            Err(e) => {
                debug!(
                    "Skipping certificate {} as trust anchor: {}",
                    cert.subject(),
                    e
                );
                false
            }
        }
    }

    pub fn contains(&self, cert: &Certificate) -> bool {
        let bytes: &[u8] = cert.der().as_ref();
        self.added.contains(bytes)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn root_store(&self) -> &RootCertStore {
        &self.roots
    }

    pub fn into_root_store(self) -> RootCertStore {
        self.roots
    }
}

impl Default for CertPool {
    fn default() -> Self {
        Self::new()
    }
}
