//! Certificate identity and structural role

use crate::certificate::{Certificate, PublicKeyAlgorithm};
use std::fmt;
use std::str::FromStr;

/// Structural role of a certificate in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum CertType {
    /// Never produced by classification; usable as a query zero-value
    #[default]
    Unknown,
    AnchorRoot,
    IntermediateCA,
    Leaf,
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertType::Unknown => "unknown",
            CertType::AnchorRoot => "root",
            CertType::IntermediateCA => "intermediate",
            CertType::Leaf => "leaf",
        };
        f.write_str(name)
    }
}

impl FromStr for CertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(CertType::Unknown),
            "root" | "anchor" => Ok(CertType::AnchorRoot),
            "intermediate" | "sub" => Ok(CertType::IntermediateCA),
            "leaf" => Ok(CertType::Leaf),
            other => Err(format!("unknown certificate type: {}", other)),
        }
    }
}

/// Identity of a certificate inside a [`crate::CertificateSet`]
///
/// Two certificates producing the same tuple are indistinguishable; the
/// later one replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct CertInfo {
    pub algo: PublicKeyAlgorithm,
    pub name: String,
    /// Lowercase hexadecimal serial number
    pub serial: String,
    pub cert_type: CertType,
}

impl fmt::Display for CertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} serial={} cn={:?}",
            self.cert_type, self.algo, self.serial, self.name
        )
    }
}

/// Derive the identity of a certificate
///
/// A CA with a zero path length constraint is an intermediate, any other CA
/// is a root, everything else is a leaf.
pub fn classify(cert: &Certificate) -> CertInfo {
    let cert_type = match (cert.is_ca(), cert.max_path_len_zero()) {
        (true, true) => CertType::IntermediateCA,
        (true, false) => CertType::AnchorRoot,
        (false, _) => CertType::Leaf,
    };

    CertInfo {
        algo: cert.public_key_algorithm(),
        name: cert.common_name().to_string(),
        serial: cert.serial().to_string(),
        cert_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn make(is_ca: IsCa) -> Certificate {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Classify Test");
        params.is_ca = is_ca;
        let cert = params.self_signed(&key).unwrap();
        Certificate::from_der(cert.der().clone()).unwrap()
    }

    #[test]
    fn test_ca_with_zero_path_len_is_intermediate() {
        let cert = make(IsCa::Ca(BasicConstraints::Constrained(0)));
        assert_eq!(classify(&cert).cert_type, CertType::IntermediateCA);
    }

    #[test]
    fn test_unconstrained_ca_is_root() {
        let cert = make(IsCa::Ca(BasicConstraints::Unconstrained));
        assert_eq!(classify(&cert).cert_type, CertType::AnchorRoot);
    }

    #[test]
    fn test_ca_with_nonzero_path_len_is_root() {
        let cert = make(IsCa::Ca(BasicConstraints::Constrained(2)));
        assert_eq!(classify(&cert).cert_type, CertType::AnchorRoot);
    }

    #[test]
    fn test_non_ca_is_leaf() {
        assert_eq!(classify(&make(IsCa::NoCa)).cert_type, CertType::Leaf);
        assert_eq!(
            classify(&make(IsCa::ExplicitNoCa)).cert_type,
            CertType::Leaf
        );
    }

    #[test]
    fn test_classify_copies_identity_fields() {
        let cert = make(IsCa::NoCa);
        let info = classify(&cert);

        assert_eq!(info.algo, PublicKeyAlgorithm::Ecdsa);
        assert_eq!(info.name, "Classify Test");
        assert_eq!(info.serial, cert.serial());
    }

    #[test]
    fn test_default_info_is_unknown() {
        let info = CertInfo::default();
        assert_eq!(info.cert_type, CertType::Unknown);
        assert_eq!(info.algo, PublicKeyAlgorithm::Unknown);
        assert!(info.name.is_empty());
    }
}
