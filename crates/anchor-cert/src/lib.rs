//! Certificate classification and querying
//!
//! Parses X.509 certificates, classifies them as root, intermediate or leaf,
//! and keeps them in a set that supports composable filtered queries and
//! trust pool construction.

pub mod certificate;
pub mod classify;
pub mod pool;
pub mod set;

pub use certificate::{CertError, Certificate, PublicKeyAlgorithm};
pub use classify::{classify, CertInfo, CertType};
pub use pool::CertPool;
pub use set::{by_algo, by_name, by_serial, by_type, filter_fn, CertificateSet, Filter};
