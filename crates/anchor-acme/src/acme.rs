//! ACME-backed certificate manager
//!
//! Uses instant-acme for the ACME protocol and HTTP-01 challenges for domain
//! validation. Issued certificates are cached in memory per host and key
//! algorithm; nothing is written to disk.

use crate::manager::{
    CertificateManager, HandshakeDescriptor, KeyAlgorithm, ManagerConnector, ManagerError,
    ManagerSettings,
};
use anchor_cert::Certificate;
use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, ExternalAccountKey, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Cached certificates closer than this to expiry are re-issued
const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// HTTP-01 challenge tokens (token -> key authorization)
pub type ChallengeTokens = Arc<DashMap<String, String>>;

/// Connector producing [`AcmeManager`]s
#[derive(Debug, Clone)]
pub struct AcmeConnector {
    order_timeout: Duration,
    challenge_tokens: ChallengeTokens,
}

impl AcmeConnector {
    pub fn new() -> Self {
        Self {
            order_timeout: Duration::from_secs(300),
            challenge_tokens: Arc::new(DashMap::new()),
        }
    }

    /// How long to wait for an order to become ready or a certificate to be issued
    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout = timeout;
        self
    }

    /// Challenge handler shared by every manager this connector creates
    pub fn challenge_handler(&self) -> ChallengeHandler {
        ChallengeHandler::new(self.challenge_tokens.clone())
    }
}

impl Default for AcmeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerConnector for AcmeConnector {
    fn configure(
        &self,
        settings: ManagerSettings,
    ) -> Result<Arc<dyn CertificateManager>, ManagerError> {
        if settings.directory_url.is_empty() {
            return Err(ManagerError::Configuration(
                "directory URL is empty".to_string(),
            ));
        }

        info!(
            directory_url = %settings.directory_url,
            hosts = ?settings.allowed_hosts,
            eab = settings.external_account.is_some(),
            "Configured ACME certificate manager"
        );

        Ok(Arc::new(AcmeManager {
            settings,
            order_timeout: self.order_timeout,
            challenge_tokens: self.challenge_tokens.clone(),
            account: OnceCell::new(),
            certificates: DashMap::new(),
            issuance: Mutex::new(()),
        }))
    }
}

/// Certificate manager that orders certificates from an ACME CA
pub struct AcmeManager {
    settings: ManagerSettings,
    order_timeout: Duration,
    challenge_tokens: ChallengeTokens,
    /// Registered lazily on the first order
    account: OnceCell<Account>,
    certificates: DashMap<(String, KeyAlgorithm), Arc<CertifiedKey>>,
    /// Serialises orders so concurrent requests for one host produce one order
    issuance: Mutex<()>,
}

impl AcmeManager {
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Challenge handler for serving HTTP-01 responses
    pub fn challenge_handler(&self) -> ChallengeHandler {
        ChallengeHandler::new(self.challenge_tokens.clone())
    }

    fn cached(&self, host: &str, algorithm: KeyAlgorithm) -> Option<Arc<CertifiedKey>> {
        let key = (host.to_string(), algorithm);
        let cert = self.certificates.get(&key)?.clone();

        if needs_renewal(&cert) {
            debug!(host = host, %algorithm, "Cached certificate is due for renewal");
            return None;
        }
        Some(cert)
    }

    async fn account(&self) -> Result<&Account, ManagerError> {
        self.account
            .get_or_try_init(|| self.create_account())
            .await
    }

    async fn create_account(&self) -> Result<Account, ManagerError> {
        let new_account = NewAccount {
            contact: &[],
            terms_of_service_agreed: self.settings.terms_of_service_agreed,
            only_return_existing: false,
        };

        let external_account = self
            .settings
            .external_account
            .as_ref()
            .map(|(kid, key)| ExternalAccountKey::new(kid.clone(), key));

        let (account, _credentials) = Account::builder()
            .map_err(ManagerError::Acme)?
            .create(
                &new_account,
                self.settings.directory_url.clone(),
                external_account.as_ref(),
            )
            .await?;

        info!(
            id = %account.id(),
            directory_url = %self.settings.directory_url,
            "Registered ACME account"
        );
        Ok(account)
    }

    /// Order a certificate for `host` with a freshly generated key
    async fn issue(
        &self,
        host: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<Arc<CertifiedKey>, ManagerError> {
        let account = self.account().await?;

        info!(domain = host, %algorithm, "Requesting certificate via ACME");

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut published = PublishedTokens::new(self.challenge_tokens.clone());
        let mut authorizations = order.authorizations();
        while let Some(auth_result) = authorizations.next().await {
            let mut auth = auth_result?;

            match auth.status {
                AuthorizationStatus::Pending => {
                    let mut challenge = auth
                        .challenge(ChallengeType::Http01)
                        .ok_or(ManagerError::NoHttp01Challenge)?;

                    let key_auth = challenge.key_authorization();
                    let token = challenge.token.clone();
                    published.insert(token.clone(), key_auth.as_str().to_string());

                    debug!(
                        domain = host,
                        token = %token,
                        "HTTP-01 challenge ready at {}{}",
                        ACME_CHALLENGE_PREFIX,
                        token
                    );

                    challenge.set_ready().await?;
                }
                AuthorizationStatus::Valid => {
                    debug!(domain = host, "Authorization already valid");
                }
                status => {
                    return Err(ManagerError::ChallengeFailed(format!(
                        "Unexpected authorization status: {:?}",
                        status
                    )));
                }
            }
        }

        let retry_policy = RetryPolicy::new().timeout(self.order_timeout);
        let order_status = order.poll_ready(&retry_policy).await;
        drop(published);

        match order_status? {
            OrderStatus::Ready => {
                debug!(domain = host, "Order ready, finalizing");
            }
            OrderStatus::Invalid => {
                return Err(ManagerError::ChallengeFailed(
                    "Order became invalid".to_string(),
                ));
            }
            status => return Err(ManagerError::OrderNotReady(format!("{:?}", status))),
        }

        let key_pair = generate_key(algorithm)?;
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ManagerError::InvalidDomain(format!("{}: {}", host, e)))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| ManagerError::KeyGeneration(e.to_string()))?;

        order.finalize_csr(csr.der()).await?;
        let chain_pem = order.poll_certificate(&retry_policy).await?;

        let certified = certified_key(&chain_pem, &key_pair)?;

        info!(domain = host, %algorithm, "Certificate issued successfully");
        Ok(certified)
    }
}

#[async_trait]
impl CertificateManager for AcmeManager {
    async fn get_certificate(
        &self,
        hello: &HandshakeDescriptor,
    ) -> Result<Arc<CertifiedKey>, ManagerError> {
        let host = hello.server_name.trim_end_matches('.').to_ascii_lowercase();
        validate_domain(&host)?;

        if !self.settings.is_host_allowed(&host) {
            return Err(ManagerError::HostNotAllowed(host));
        }

        let algorithm = hello.key_algorithm();
        if let Some(cert) = self.cached(&host, algorithm) {
            return Ok(cert);
        }

        let _guard = self.issuance.lock().await;
        // Another request may have issued while we waited
        if let Some(cert) = self.cached(&host, algorithm) {
            return Ok(cert);
        }

        let cert = self.issue(&host, algorithm).await?;
        self.certificates.insert((host, algorithm), cert.clone());
        Ok(cert)
    }
}

fn validate_domain(domain: &str) -> Result<(), ManagerError> {
    if domain.is_empty() {
        return Err(ManagerError::InvalidDomain(
            "Domain cannot be empty".to_string(),
        ));
    }

    if domain.contains(' ') || domain.contains('/') {
        return Err(ManagerError::InvalidDomain(format!(
            "Domain contains invalid characters: {}",
            domain
        )));
    }

    if domain.starts_with('.') {
        return Err(ManagerError::InvalidDomain(
            "Domain cannot start with a dot".to_string(),
        ));
    }

    Ok(())
}

fn generate_key(algorithm: KeyAlgorithm) -> Result<KeyPair, ManagerError> {
    let alg = match algorithm {
        KeyAlgorithm::Ecdsa => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::Rsa => &rcgen::PKCS_RSA_SHA256,
    };

    KeyPair::generate_for(alg).map_err(|e| {
        ManagerError::KeyGeneration(format!("Failed to generate {} key: {}", algorithm, e))
    })
}

/// Combine an issued PEM chain with its private key
fn certified_key(chain_pem: &str, key_pair: &KeyPair) -> Result<Arc<CertifiedKey>, ManagerError> {
    let chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| ManagerError::InvalidCertificate(format!("Failed to parse chain: {}", e)))?;

    if chain.is_empty() {
        return Err(ManagerError::InvalidCertificate(
            "CA returned an empty certificate chain".to_string(),
        ));
    }

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| ManagerError::InvalidCertificate(format!("Unusable private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

fn needs_renewal(cert: &CertifiedKey) -> bool {
    let Some(leaf) = cert.cert.first() else {
        return true;
    };

    match Certificate::from_der(leaf.clone()) {
        Ok(parsed) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default();
            parsed.not_after() - now < RENEW_BEFORE.as_secs() as i64
        }
        Err(_) => true,
    }
}

/// Challenge tokens published for one order
///
/// Every token is withdrawn on drop, whether the order completed, failed or
/// was abandoned mid-flight.
struct PublishedTokens {
    tokens: ChallengeTokens,
    published: Vec<String>,
}

impl PublishedTokens {
    fn new(tokens: ChallengeTokens) -> Self {
        Self {
            tokens,
            published: Vec::new(),
        }
    }

    fn insert(&mut self, token: String, key_authorization: String) {
        self.tokens.insert(token.clone(), key_authorization);
        self.published.push(token);
    }
}

impl Drop for PublishedTokens {
    fn drop(&mut self) {
        for token in &self.published {
            self.tokens.remove(token);
        }
    }
}

/// HTTP-01 challenge responder
///
/// Wire it into whatever serves port 80 for the managed hosts.
#[derive(Debug, Clone)]
pub struct ChallengeHandler {
    tokens: ChallengeTokens,
}

impl ChallengeHandler {
    pub fn new(tokens: ChallengeTokens) -> Self {
        Self { tokens }
    }

    /// Check if a request path is for an ACME challenge
    pub fn is_challenge_request(&self, path: &str) -> bool {
        path.starts_with(ACME_CHALLENGE_PREFIX)
    }

    /// Key authorization for a challenge request path
    pub fn handle_challenge(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix(ACME_CHALLENGE_PREFIX)?;
        self.tokens.get(token).map(|entry| entry.value().clone())
    }
}
