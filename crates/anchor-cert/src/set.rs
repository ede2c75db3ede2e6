//! Classified, queryable certificate set

use crate::certificate::{CertError, Certificate, PublicKeyAlgorithm};
use crate::classify::{classify, CertInfo, CertType};
use crate::pool::CertPool;
use rustls::pki_types::CertificateDer;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};
use x509_parser::error::PEMError;
use x509_parser::pem::Pem;

const PEM_CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Predicate over a set entry
///
/// Filters are combined with logical AND. The first `Ok(false)` or `Err`
/// stops evaluation for that entry, and an `Err` aborts the whole query.
pub type Filter = Box<dyn Fn(&CertInfo, &Certificate) -> Result<bool, CertError> + Send + Sync>;

/// Wrap an arbitrary (possibly fallible) closure as a [`Filter`]
pub fn filter_fn<F>(f: F) -> Filter
where
    F: Fn(&CertInfo, &Certificate) -> Result<bool, CertError> + Send + Sync + 'static,
{
    Box::new(f)
}

pub fn by_algo(algo: PublicKeyAlgorithm) -> Filter {
    Box::new(move |info, _| Ok(info.algo == algo))
}

pub fn by_name(name: impl Into<String>) -> Filter {
    let name = name.into();
    Box::new(move |info, _| Ok(info.name == name))
}

pub fn by_serial(serial: impl Into<String>) -> Filter {
    let serial = serial.into();
    Box::new(move |info, _| Ok(info.serial == serial))
}

pub fn by_type(cert_type: CertType) -> Filter {
    Box::new(move |info, _| Ok(info.cert_type == cert_type))
}

fn matches(info: &CertInfo, cert: &Certificate, filters: &[Filter]) -> Result<bool, CertError> {
    for filter in filters {
        if !filter(info, cert)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// In-memory certificate set keyed by [`CertInfo`]
///
/// Safe to share between threads: queries take a read lock, appends take a
/// write lock. Iteration order is unspecified.
#[derive(Default)]
pub struct CertificateSet {
    certificates: RwLock<HashMap<CertInfo, Arc<Certificate>>>,
}

impl CertificateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a PEM bundle
    pub fn from_pem(data: &str) -> Result<Self, CertError> {
        let set = Self::new();
        set.append_pem(data)?;
        Ok(set)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CertInfo, Arc<Certificate>>> {
        self.certificates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CertInfo, Arc<Certificate>>> {
        self.certificates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Classify and insert a certificate, replacing any entry with the same identity
    pub fn append(&self, cert: impl Into<Arc<Certificate>>) -> CertInfo {
        let cert = cert.into();
        let info = classify(&cert);

        trace!("Appending certificate: {}", info);

        if self.write().insert(info.clone(), cert).is_some() {
            debug!("Replaced certificate with identical identity: {}", info);
        }
        info
    }

    /// Append every certificate from a concatenation of PEM blocks
    ///
    /// Stops at the first block that is not a decodable `CERTIFICATE` block
    /// (`InvalidEncoding`) or whose contents are not a valid certificate
    /// (`ParseError`). Text between blocks is skipped, but anything other
    /// than whitespace after the last block is `InvalidEncoding`.
    /// Certificates appended from earlier blocks in the same call stay in the
    /// set. Returns the number of certificates appended.
    pub fn append_pem(&self, data: &str) -> Result<usize, CertError> {
        let mut reader = Cursor::new(data.as_bytes());
        let mut appended = 0;

        loop {
            let start = reader.position() as usize;
            let pem = match Pem::read(&mut reader) {
                Ok((pem, _)) => pem,
                Err(PEMError::MissingHeader) => {
                    let rest = data.get(start..).unwrap_or_default();
                    if !rest.trim().is_empty() {
                        return Err(CertError::InvalidEncoding(if appended == 0 {
                            "no PEM block found in input".to_string()
                        } else {
                            format!("trailing data after {} PEM block(s)", appended)
                        }));
                    }
                    break;
                }
                Err(e) => return Err(CertError::InvalidEncoding(e.to_string())),
            };

            if pem.label != PEM_CERTIFICATE_LABEL {
                return Err(CertError::InvalidEncoding(format!(
                    "unexpected PEM block type: {}",
                    pem.label
                )));
            }

            let cert = Certificate::from_der(CertificateDer::from(pem.contents))?;
            self.append(cert);
            appended += 1;
        }

        debug!("Appended {} certificate(s) from PEM data", appended);
        Ok(appended)
    }

    /// Add every certificate in the set to `pool`
    pub fn add_to_pool(&self, pool: &mut CertPool) {
        for cert in self.read().values() {
            pool.add(cert);
        }
    }

    /// Build a fresh trust pool holding every certificate in the set
    pub fn cert_pool(&self) -> CertPool {
        let mut pool = CertPool::new();
        self.add_to_pool(&mut pool);
        pool
    }

    /// Return a new set with the entries that satisfy every filter
    ///
    /// With no filters this is a full copy. A filter error aborts the query
    /// and no partial result is returned.
    pub fn select(&self, filters: &[Filter]) -> Result<CertificateSet, CertError> {
        let mut selected = HashMap::new();

        for (info, cert) in self.read().iter() {
            if matches(info, cert, filters)? {
                selected.insert(info.clone(), cert.clone());
            }
        }

        Ok(CertificateSet {
            certificates: RwLock::new(selected),
        })
    }

    /// Return some entry satisfying every filter
    ///
    /// Which entry is returned when several match is unspecified; use
    /// [`CertificateSet::select`] and order the result when that matters.
    /// When nothing matches the result is a default identity and `None`.
    pub fn find(
        &self,
        filters: &[Filter],
    ) -> Result<(CertInfo, Option<Arc<Certificate>>), CertError> {
        for (info, cert) in self.read().iter() {
            if matches(info, cert, filters)? {
                return Ok((info.clone(), Some(cert.clone())));
            }
        }
        Ok((CertInfo::default(), None))
    }

    pub fn get(&self, info: &CertInfo) -> Option<Arc<Certificate>> {
        self.read().get(info).cloned()
    }

    pub fn remove(&self, info: &CertInfo) -> Option<Arc<Certificate>> {
        self.write().remove(info)
    }

    /// Identities currently in the set, sorted
    pub fn infos(&self) -> Vec<CertInfo> {
        let mut infos: Vec<CertInfo> = self.read().keys().cloned().collect();
        infos.sort();
        infos
    }

    /// Entries currently in the set, sorted by identity
    pub fn entries(&self) -> Vec<(CertInfo, Arc<Certificate>)> {
        let mut entries: Vec<_> = self
            .read()
            .iter()
            .map(|(info, cert)| (info.clone(), cert.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Clone for CertificateSet {
    fn clone(&self) -> Self {
        Self {
            certificates: RwLock::new(self.read().clone()),
        }
    }
}

impl PartialEq for CertificateSet {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        *self.read() == *other.read()
    }
}

impl std::fmt::Debug for CertificateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSet")
            .field("certificates", &self.infos())
            .finish()
    }
}

impl FromIterator<Certificate> for CertificateSet {
    fn from_iter<I: IntoIterator<Item = Certificate>>(iter: I) -> Self {
        let set = CertificateSet::new();
        for cert in iter {
            set.append(cert);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SerialNumber};

    fn generate(cn: &str, serial: u8, is_ca: IsCa) -> rcgen::Certificate {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serial_number = Some(SerialNumber::from_slice(&[serial]));
        params.is_ca = is_ca;
        params.self_signed(&key).unwrap()
    }

    fn parsed(cert: &rcgen::Certificate) -> Certificate {
        Certificate::from_der(cert.der().clone()).unwrap()
    }

    fn mixed_set() -> CertificateSet {
        let set = CertificateSet::new();
        set.append(parsed(&generate(
            "Root",
            1,
            IsCa::Ca(BasicConstraints::Unconstrained),
        )));
        set.append(parsed(&generate(
            "Intermediate",
            2,
            IsCa::Ca(BasicConstraints::Constrained(0)),
        )));
        set.append(parsed(&generate("a.example.test", 3, IsCa::NoCa)));
        set.append(parsed(&generate("b.example.test", 4, IsCa::NoCa)));
        set
    }

    #[test]
    fn test_append_overwrites_identical_identity() {
        let set = CertificateSet::new();
        let first = parsed(&generate("dup.example.test", 9, IsCa::NoCa));
        let second = parsed(&generate("dup.example.test", 9, IsCa::NoCa));
        assert_ne!(first, second);

        let info = set.append(first);
        set.append(second.clone());

        assert_eq!(set.len(), 1);
        assert_eq!(*set.get(&info).unwrap(), second);
    }

    #[test]
    fn test_append_pem_counts_distinct_certificates() {
        let pem: String = (1..=3)
            .map(|i| generate(&format!("host{}.example.test", i), i, IsCa::NoCa).pem())
            .collect();

        let set = CertificateSet::new();
        assert_eq!(set.append_pem(&pem).unwrap(), 3);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_append_pem_empty_input() {
        let set = CertificateSet::new();
        assert_eq!(set.append_pem("").unwrap(), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_append_pem_rejects_non_pem_text() {
        let set = CertificateSet::new();
        let result = set.append_pem("definitely not pem");
        assert!(matches!(result, Err(CertError::InvalidEncoding(_))));
    }

    #[test]
    fn test_append_pem_rejects_other_block_types() {
        let key = KeyPair::generate().unwrap();
        let set = CertificateSet::new();

        let result = set.append_pem(&key.serialize_pem());
        assert!(matches!(result, Err(CertError::InvalidEncoding(_))));
    }

    #[test]
    fn test_concurrent_appends_and_selects() {
        let set = CertificateSet::new();
        let batches: Vec<String> = (0..4u8)
            .map(|batch| {
                (0..5u8)
                    .map(|i| {
                        let serial = batch * 10 + i + 1;
                        generate(&format!("host{}.example.test", serial), serial, IsCa::NoCa)
                            .pem()
                    })
                    .collect()
            })
            .collect();

        std::thread::scope(|scope| {
            for batch in &batches {
                let set = &set;
                scope.spawn(move || {
                    assert_eq!(set.append_pem(batch).unwrap(), 5);
                });
            }
            for _ in 0..4 {
                let set = &set;
                scope.spawn(move || {
                    for _ in 0..20 {
                        let leaves = set.select(&[by_type(CertType::Leaf)]).unwrap();
                        assert!(leaves.len() <= 20);
                    }
                });
            }
        });

        assert_eq!(set.len(), 20);
        assert_eq!(set.select(&[by_type(CertType::Leaf)]).unwrap().len(), 20);
    }

    #[test]
    fn test_select_without_filters_copies_everything() {
        let set = mixed_set();
        let copy = set.select(&[]).unwrap();
        assert_eq!(copy, set);
        assert_eq!(copy.len(), 4);
    }

    #[test]
    fn test_select_by_type() {
        let set = mixed_set();

        let leaves = set.select(&[by_type(CertType::Leaf)]).unwrap();
        assert_eq!(leaves.len(), 2);
        assert!(leaves
            .infos()
            .iter()
            .all(|info| info.cert_type == CertType::Leaf));

        let roots = set.select(&[by_type(CertType::AnchorRoot)]).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots.infos()[0].name, "Root");
    }

    #[test]
    fn test_select_combines_filters_with_and() {
        let set = mixed_set();

        let selected = set
            .select(&[
                by_type(CertType::Leaf),
                by_algo(PublicKeyAlgorithm::Ecdsa),
                by_name("b.example.test"),
            ])
            .unwrap();
        assert_eq!(selected.len(), 1);

        let none = set
            .select(&[by_type(CertType::Leaf), by_algo(PublicKeyAlgorithm::Rsa)])
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_select_propagates_filter_error() {
        let set = mixed_set();
        let result = set.select(&[filter_fn(|_, _| Err(CertError::Filter("boom".into())))]);
        assert!(matches!(result, Err(CertError::Filter(_))));
    }

    #[test]
    fn test_filters_short_circuit() {
        let set = mixed_set();
        // The failing filter only runs for entries the first filter accepts
        let selected = set
            .select(&[
                by_type(CertType::AnchorRoot),
                filter_fn(|info, _| {
                    if info.cert_type == CertType::AnchorRoot {
                        Ok(true)
                    } else {
                        Err(CertError::Filter("evaluated past a false filter".into()))
                    }
                }),
            ])
            .unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_find_by_serial() {
        let set = mixed_set();
        let (info, cert) = set.find(&[by_serial("3")]).unwrap();

        assert_eq!(info.name, "a.example.test");
        assert_eq!(cert.unwrap().serial(), "3");
    }

    #[test]
    fn test_find_without_match_returns_zero_value() {
        let set = mixed_set();
        let (info, cert) = set.find(&[by_name("missing.example.test")]).unwrap();

        assert_eq!(info, CertInfo::default());
        assert!(cert.is_none());
    }

    #[test]
    fn test_cert_pool_contains_every_member() {
        let set = mixed_set();
        let pool = set.cert_pool();
        assert_eq!(pool.len(), 4);

        let mut pool = pool;
        set.add_to_pool(&mut pool);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_remove() {
        let set = mixed_set();
        let info = set.infos()[0].clone();

        assert!(set.remove(&info).is_some());
        assert!(set.get(&info).is_none());
        assert_eq!(set.len(), 3);
    }
}
