//! TLS listener with automatically provisioned ECDSA and RSA certificates
//!
//! [`listen`] asks a certificate manager for one certificate per key
//! algorithm for the configured host and serves whichever one the client can
//! verify:
//!
//! ```no_run
//! use anchor_server_tls::{listen, Config};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new("https://acme.example.test/directory".parse()?)
//!     .with_server_name("example.test");
//!
//! let listener = listen("tcp", ":443", &config).await?;
//! let (_stream, peer) = listener.accept().await?;
//! println!("connection from {}", peer);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod provision;
pub mod resolver;

pub use config::{Config, ExternalAccountBinding};
pub use error::ListenError;
pub use listener::{
    build_server_config, listen, listen_with_cancel, normalize_address, Network, TlsListener,
};
pub use provision::{provision_dual, DualCertificates, ECDSA_REQUEST_SUITE, RSA_REQUEST_SUITE};
pub use resolver::DualCertResolver;

pub use tokio_util::sync::CancellationToken;
