//! Listener configuration

use crate::error::ListenError;
use anchor_acme::{AcmeConnector, CertificateManager, ManagerConnector, ManagerSettings};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use url::Url;

/// External account binding credentials issued by the CA
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalAccountBinding {
    pub key_id: String,
    /// base64url-encoded HMAC key
    pub key: String,
}

impl ExternalAccountBinding {
    pub fn new(key_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            key: key.into(),
        }
    }

    /// Decode the base64url HMAC key (padding optional)
    pub fn decode_key(&self) -> Result<Vec<u8>, ListenError> {
        URL_SAFE_NO_PAD
            .decode(self.key.trim().trim_end_matches('='))
            .map_err(|e| ListenError::InvalidEabKey(e.to_string()))
    }
}

impl fmt::Debug for ExternalAccountBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalAccountBinding")
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Configuration for [`crate::listen`]
///
/// The certificate manager is created on the first listen and reused by
/// every later listen on the same `Config`.
pub struct Config {
    /// ACME directory endpoint
    pub directory_url: Option<Url>,

    /// Optional external account binding
    pub external_account_binding: Option<ExternalAccountBinding>,

    /// Hostnames to serve (exactly one is supported)
    pub server_names: Vec<String>,

    /// Upper bound on provisioning both certificates
    pub provision_timeout: Duration,

    /// ALPN protocols advertised by the listener
    pub alpn_protocols: Vec<String>,

    /// How often a running listener asks the manager for its certificates
    /// again. Zero disables the refresh.
    pub refresh_interval: Duration,

    connector: Arc<dyn ManagerConnector>,
    manager: OnceCell<Arc<dyn CertificateManager>>,
}

impl Config {
    pub fn new(directory_url: Url) -> Self {
        Self {
            directory_url: Some(directory_url),
            ..Default::default()
        }
    }

    pub fn with_external_account_binding(mut self, eab: ExternalAccountBinding) -> Self {
        self.external_account_binding = Some(eab);
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_names.push(name.into());
        self
    }

    pub fn with_server_names(mut self, names: Vec<String>) -> Self {
        self.server_names = names;
        self
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<String>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Use a custom certificate manager implementation
    pub fn with_connector(mut self, connector: Arc<dyn ManagerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Whether the certificate manager has been created
    pub fn is_configured(&self) -> bool {
        self.manager.initialized()
    }

    /// The certificate manager, creating it on first use
    ///
    /// Concurrent first callers wait for a single setup. A failed setup
    /// leaves the config unconfigured.
    pub async fn manager(&self) -> Result<Arc<dyn CertificateManager>, ListenError> {
        self.manager
            .get_or_try_init(|| async { self.setup() })
            .await
            .cloned()
    }

    fn setup(&self) -> Result<Arc<dyn CertificateManager>, ListenError> {
        let directory_url = self
            .directory_url
            .as_ref()
            .ok_or(ListenError::MissingDirectoryUrl)?;

        let mut settings = ManagerSettings::new(directory_url.as_str())
            .with_allowed_hosts(self.server_names.clone());

        if let Some(eab) = &self.external_account_binding {
            if eab.key.is_empty() {
                warn!(
                    key_id = %eab.key_id,
                    "External account binding has no key, registering without it"
                );
            } else {
                settings = settings.with_external_account(eab.key_id.clone(), eab.decode_key()?);
            }
        }

        let manager = self
            .connector
            .configure(settings)
            .map_err(ListenError::ManagerSetup)?;

        info!(
            directory_url = %directory_url,
            server_names = ?self.server_names,
            "Certificate manager configured"
        );

        Ok(manager)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory_url: None,
            external_account_binding: None,
            server_names: Vec::new(),
            provision_timeout: Duration::from_secs(300),
            alpn_protocols: Vec::new(),
            refresh_interval: Duration::from_secs(12 * 60 * 60),
            connector: Arc::new(AcmeConnector::new()),
            manager: OnceCell::new(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("directory_url", &self.directory_url.as_ref().map(Url::as_str))
            .field("external_account_binding", &self.external_account_binding)
            .field("server_names", &self.server_names)
            .field("provision_timeout", &self.provision_timeout)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("refresh_interval", &self.refresh_interval)
            .field("configured", &self.is_configured())
            .finish()
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
