//! Listener errors

use anchor_acme::{KeyAlgorithm, ManagerError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("Missing required directory URL in listener config")]
    MissingDirectoryUrl,

    #[error("Invalid external account binding key: {0}")]
    InvalidEabKey(String),

    #[error("Exactly one server name is supported, got {0}")]
    UnsupportedHostnameCount(usize),

    #[error("Failed to set up certificate manager: {0}")]
    ManagerSetup(#[source] ManagerError),

    #[error("Failed to provision {algorithm} certificate for {host}: {source}")]
    CertificateProvisioningFailure {
        host: String,
        algorithm: KeyAlgorithm,
        #[source]
        source: ManagerError,
    },

    #[error("Certificate provisioning timed out after {0:?}")]
    ProvisioningTimeout(Duration),

    #[error("Certificate provisioning was cancelled")]
    Cancelled,

    #[error("Unsupported network: {0} (expected tcp, tcp4 or tcp6)")]
    UnsupportedNetwork(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this address\n  • Try using a different address or port")]
    BindError { address: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
