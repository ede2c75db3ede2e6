//! Dual-certificate TLS listener

use crate::config::{ensure_crypto_provider, Config};
use crate::error::ListenError;
use crate::provision::provision_dual;
use crate::resolver::DualCertResolver;
use anchor_acme::CertificateManager;
use rustls::server::ServerConfig;
use rustls::sign::CertifiedKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Address family accepted by [`listen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn parse(network: &str) -> Result<Self, ListenError> {
        match network {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(ListenError::UnsupportedNetwork(other.to_string())),
        }
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }

    fn unspecified_host(&self) -> &'static str {
        match self {
            Network::Tcp6 => "[::]",
            Network::Tcp | Network::Tcp4 => "0.0.0.0",
        }
    }
}

/// TLS listener serving a single hostname with an ECDSA and an RSA certificate
///
/// Dropping the listener stops its certificate refresh task.
pub struct TlsListener {
    tcp_listener: TcpListener,
    acceptor: TlsAcceptor,
    server_config: Arc<ServerConfig>,
    resolver: Arc<DualCertResolver>,
    _refresh: Option<DropGuard>,
}

impl TlsListener {
    /// Accept the next connection that completes a TLS handshake
    ///
    /// Failed handshakes are logged and skipped.
    pub async fn accept(&self) -> Result<(TlsStream<TcpStream>, SocketAddr), ListenError> {
        loop {
            let (tcp_stream, remote_addr) = self.tcp_listener.accept().await?;

            debug!("Incoming TCP connection from {}", remote_addr);

            match self.acceptor.accept(tcp_stream).await {
                Ok(stream) => {
                    debug!("TLS handshake complete from {}", remote_addr);
                    return Ok((stream, remote_addr));
                }
                Err(e) => {
                    warn!("TLS handshake failed from {}: {}", remote_addr, e);
                    continue;
                }
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenError> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    /// Certificates the listener presents (ECDSA, RSA)
    pub fn certificates(&self) -> Vec<Arc<CertifiedKey>> {
        self.resolver.certificates()
    }

    pub fn server_name(&self) -> &str {
        self.resolver.server_name()
    }
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("server_name", &self.resolver.server_name())
            .finish()
    }
}

/// Open a TLS listener for the single host in `config`
///
/// Creates the certificate manager on the first call, provisions an ECDSA
/// and an RSA certificate, then binds `address` on `network`
/// (`tcp`, `tcp4` or `tcp6`). While the listener lives, both certificates
/// are fetched again every [`Config::refresh_interval`] so renewals reach
/// live handshakes.
pub async fn listen(
    network: &str,
    address: &str,
    config: &Config,
) -> Result<TlsListener, ListenError> {
    listen_with_cancel(network, address, config, CancellationToken::new()).await
}

/// [`listen`] with a token that aborts certificate provisioning
///
/// Cancelling the token after the listener is returned stops the refresh
/// task.
pub async fn listen_with_cancel(
    network: &str,
    address: &str,
    config: &Config,
    cancel: CancellationToken,
) -> Result<TlsListener, ListenError> {
    ensure_crypto_provider();

    let manager = config.manager().await?;

    let host = match config.server_names.as_slice() {
        [host] => host.clone(),
        names => return Err(ListenError::UnsupportedHostnameCount(names.len())),
    };

    let network = Network::parse(network)?;

    info!(host = %host, address = %address, "Provisioning certificates for listener");

    let certificates = tokio::select! {
        _ = cancel.cancelled() => return Err(ListenError::Cancelled),
        result = tokio::time::timeout(config.provision_timeout, provision_dual(manager.as_ref(), &host)) => {
            result.map_err(|_| ListenError::ProvisioningTimeout(config.provision_timeout))??
        }
    };

    let resolver = Arc::new(DualCertResolver::new(host.clone(), certificates));
    let server_config = Arc::new(build_server_config(
        resolver.clone(),
        &config.alpn_protocols,
    ));
    let tcp_listener = bind(network, address).await?;

    info!(
        "TLS listener for {} bound to {}",
        host,
        tcp_listener.local_addr()?
    );

    let refresh = if config.refresh_interval.is_zero() {
        debug!(host = %host, "Certificate refresh disabled");
        None
    } else {
        let refresh_cancel = cancel.child_token();
        tokio::spawn(refresh_certificates(
            manager,
            resolver.clone(),
            host,
            config.refresh_interval,
            config.provision_timeout,
            refresh_cancel.clone(),
        ));
        Some(refresh_cancel.drop_guard())
    };

    Ok(TlsListener {
        tcp_listener,
        acceptor: TlsAcceptor::from(server_config.clone()),
        server_config,
        resolver,
        _refresh: refresh,
    })
}

/// Re-provision both certificates every `interval` and swap them into `resolver`
///
/// The manager's cache decides whether anything new is issued. A failed
/// round keeps the pair currently served.
async fn refresh_certificates(
    manager: Arc<dyn CertificateManager>,
    resolver: Arc<DualCertResolver>,
    host: String,
    interval: Duration,
    provision_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!(host = %host, "Refreshing certificates");

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(provision_timeout, provision_dual(manager.as_ref(), &host)) => result,
        };

        match result {
            Ok(Ok(certificates)) => {
                if resolver.replace(certificates) {
                    info!(host = %host, "Serving renewed certificates");
                }
            }
            Ok(Err(e)) => {
                warn!(host = %host, "Certificate refresh failed, keeping current pair: {}", e);
            }
            Err(_) => {
                warn!(
                    host = %host,
                    "Certificate refresh timed out after {:?}, keeping current pair",
                    provision_timeout
                );
            }
        }
    }

    debug!(host = %host, "Certificate refresh stopped");
}

/// Server config that answers every handshake from `resolver`
pub fn build_server_config(
    resolver: Arc<DualCertResolver>,
    alpn_protocols: &[String],
) -> ServerConfig {
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    server_config.alpn_protocols = alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    server_config
}

/// Fill in the unspecified host of `network` for a bare `:port` address
pub fn normalize_address(network: Network, address: &str) -> String {
    if address.starts_with(':') {
        format!("{}{}", network.unspecified_host(), address)
    } else {
        address.to_string()
    }
}

async fn bind(network: Network, address: &str) -> Result<TcpListener, ListenError> {
    let address = normalize_address(network, address);

    let bind_error = |reason: String| ListenError::BindError {
        address: address.clone(),
        reason,
    };

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address.as_str())
        .await
        .map_err(|e| bind_error(e.to_string()))?
        .filter(|addr| network.accepts(addr))
        .collect();

    let mut last_error = format!("no {:?} address found", network);
    for addr in candidates {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("Bind to {} failed: {}", addr, e);
                last_error = e.to_string();
            }
        }
    }

    Err(bind_error(last_error))
}
