//! Owned, parsed X.509 certificates

use rustls::pki_types::CertificateDer;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

/// OID of the Ed25519 key type (RFC 8410)
const OID_ED25519: &str = "1.3.101.112";

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Invalid certificate PEM data: {0}")]
    InvalidEncoding(String),

    #[error("Failed to parse certificate: {0}")]
    ParseError(String),

    #[error("Filter error: {0}")]
    Filter(String),
}

/// Public key algorithm of a certificate's subject key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum PublicKeyAlgorithm {
    #[default]
    Unknown,
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl fmt::Display for PublicKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublicKeyAlgorithm::Unknown => "unknown",
            PublicKeyAlgorithm::Rsa => "rsa",
            PublicKeyAlgorithm::Dsa => "dsa",
            PublicKeyAlgorithm::Ecdsa => "ecdsa",
            PublicKeyAlgorithm::Ed25519 => "ed25519",
        };
        f.write_str(name)
    }
}

impl FromStr for PublicKeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(PublicKeyAlgorithm::Unknown),
            "rsa" => Ok(PublicKeyAlgorithm::Rsa),
            "dsa" => Ok(PublicKeyAlgorithm::Dsa),
            "ecdsa" | "ec" => Ok(PublicKeyAlgorithm::Ecdsa),
            "ed25519" => Ok(PublicKeyAlgorithm::Ed25519),
            other => Err(format!("unknown public key algorithm: {}", other)),
        }
    }
}

/// A parsed certificate together with its DER encoding
///
/// Only the fields needed for classification and display are kept; the DER
/// bytes remain available for trust pools and TLS configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: CertificateDer<'static>,
    public_key_algorithm: PublicKeyAlgorithm,
    common_name: String,
    serial: String,
    subject: String,
    issuer: String,
    is_ca: bool,
    max_path_len_zero: bool,
    not_before: i64,
    not_after: i64,
}

impl Certificate {
    /// Parse a DER-encoded X.509 certificate
    pub fn from_der(der: impl Into<CertificateDer<'static>>) -> Result<Self, CertError> {
        let der = der.into();

        let (rest, cert) = parse_x509_certificate(der.as_ref())
            .map_err(|e| CertError::ParseError(e.to_string()))?;
        if !rest.is_empty() {
            return Err(CertError::ParseError(format!(
                "{} trailing bytes after certificate",
                rest.len()
            )));
        }

        let public_key_algorithm = key_algorithm(cert.public_key());

        let common_name = cert
            .subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .last()
            .unwrap_or_default()
            .to_string();

        let (is_ca, max_path_len_zero) = match cert.basic_constraints() {
            Ok(Some(ext)) => (ext.value.ca, ext.value.path_len_constraint == Some(0)),
            _ => (false, false),
        };

        let validity = cert.validity();

        Ok(Self {
            public_key_algorithm,
            common_name,
            serial: cert.tbs_certificate.serial.to_str_radix(16),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            is_ca,
            max_path_len_zero,
            not_before: validity.not_before.timestamp(),
            not_after: validity.not_after.timestamp(),
            der,
        })
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn public_key_algorithm(&self) -> PublicKeyAlgorithm {
        self.public_key_algorithm
    }

    /// Subject common name, empty when the subject carries none
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Serial number as lowercase hexadecimal without leading zeros
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Whether basic constraints carry an explicit path length of zero
    pub fn max_path_len_zero(&self) -> bool {
        self.max_path_len_zero
    }

    /// Start of the validity window (unix seconds)
    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    /// End of the validity window (unix seconds)
    pub fn not_after(&self) -> i64 {
        self.not_after
    }
}

fn key_algorithm(spki: &SubjectPublicKeyInfo<'_>) -> PublicKeyAlgorithm {
    if spki.algorithm.algorithm.to_id_string() == OID_ED25519 {
        return PublicKeyAlgorithm::Ed25519;
    }

    match spki.parsed() {
        Ok(PublicKey::RSA(_)) => PublicKeyAlgorithm::Rsa,
        Ok(PublicKey::EC(_)) => PublicKeyAlgorithm::Ecdsa,
        Ok(PublicKey::DSA(_)) => PublicKeyAlgorithm::Dsa,
        _ => PublicKeyAlgorithm::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair, SerialNumber};

    fn self_signed(cn: &str, serial: &[u8], key: &KeyPair) -> Certificate {
        let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serial_number = Some(SerialNumber::from_slice(serial));
        let cert = params.self_signed(key).unwrap();
        Certificate::from_der(cert.der().clone()).unwrap()
    }

    #[test]
    fn test_parse_ecdsa_certificate() {
        let key = KeyPair::generate().unwrap();
        let cert = self_signed("api.example.test", &[0x0a, 0xbc], &key);

        assert_eq!(cert.public_key_algorithm(), PublicKeyAlgorithm::Ecdsa);
        assert_eq!(cert.common_name(), "api.example.test");
        assert_eq!(cert.serial(), "abc");
        assert!(!cert.is_ca());
        assert!(cert.not_before() < cert.not_after());
    }

    #[test]
    fn test_parse_ed25519_certificate() {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let cert = self_signed("ed.example.test", &[0x01], &key);
        assert_eq!(cert.public_key_algorithm(), PublicKeyAlgorithm::Ed25519);
    }

    #[test]
    fn test_missing_common_name_is_empty() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["nocn.example.test".to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let cert = params.self_signed(&key).unwrap();

        let parsed = Certificate::from_der(cert.der().clone()).unwrap();
        assert_eq!(parsed.common_name(), "");
    }

    #[test]
    fn test_garbage_der_is_parse_error() {
        let result = Certificate::from_der(CertificateDer::from(b"not a certificate".to_vec()));
        assert!(matches!(result, Err(CertError::ParseError(_))));
    }

    #[test]
    fn test_algorithm_round_trips_through_display() {
        for algo in [
            PublicKeyAlgorithm::Unknown,
            PublicKeyAlgorithm::Rsa,
            PublicKeyAlgorithm::Dsa,
            PublicKeyAlgorithm::Ecdsa,
            PublicKeyAlgorithm::Ed25519,
        ] {
            assert_eq!(algo.to_string().parse::<PublicKeyAlgorithm>(), Ok(algo));
        }
        assert!("dh".parse::<PublicKeyAlgorithm>().is_err());
    }
}
