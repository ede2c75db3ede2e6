//! Certificate manager contract and ACME implementation
//!
//! The listener asks a [`CertificateManager`] for certificates by describing a
//! client handshake. [`AcmeConnector`] builds the default manager, which
//! orders certificates from an ACME CA on demand.

pub mod acme;
pub mod manager;

pub use acme::{AcmeConnector, AcmeManager, ChallengeHandler, ChallengeTokens};
pub use manager::{
    is_ecdsa_suite, CertificateManager, HandshakeDescriptor, KeyAlgorithm, ManagerConnector,
    ManagerError, ManagerSettings,
};

// Re-export useful types
pub use async_trait::async_trait;
