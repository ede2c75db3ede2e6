//! Anchor CLI - TLS serving with ACME-provisioned ECDSA and RSA certificates

mod challenge;
mod config;
mod inspect;

use anchor_acme::AcmeConnector;
use anchor_cert::{CertType, PublicKeyAlgorithm};
use anchor_server_tls::{
    listen_with_cancel, normalize_address, CancellationToken, Config, ExternalAccountBinding,
    Network,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use crate::config::ServeFile;
use crate::inspect::InspectFilters;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("ANCHOR_GIT_HASH"),
    " ",
    env!("ANCHOR_BUILD_DATE"),
    ")"
);

/// Anchor - serve TLS with automatically provisioned dual-algorithm certificates
#[derive(Parser, Debug)]
#[command(name = "anchor")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Obtain ECDSA and RSA certificates for a host and serve TLS with them
    #[command(long_about = r#"
Obtain an ECDSA and an RSA certificate for a single hostname from an ACME
CA, then accept TLS connections and answer each with a short banner.

An HTTP-01 challenge responder runs on --http-listen while certificates are
being ordered; the CA must be able to reach it on port 80 of the hostname.

EXAMPLES:
  anchor serve --directory-url https://acme-staging-v02.api.letsencrypt.org/directory \
    --server-name www.example.com --listen :443

  anchor serve --config anchor.yml

ENVIRONMENT VARIABLES:
  ANCHOR_DIRECTORY_URL  ACME directory URL
  ANCHOR_SERVER_NAME    Hostname to serve
  ANCHOR_EAB_KID        External account binding key id
  ANCHOR_EAB_KEY        External account binding HMAC key (base64url)
    "#)]
    Serve {
        /// YAML configuration file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// ACME directory URL
        #[arg(long, env = "ANCHOR_DIRECTORY_URL")]
        directory_url: Option<String>,

        /// Hostname to obtain certificates for
        #[arg(long, env = "ANCHOR_SERVER_NAME")]
        server_name: Option<String>,

        /// External account binding key id
        #[arg(long, env = "ANCHOR_EAB_KID", requires = "eab_key")]
        eab_kid: Option<String>,

        /// External account binding HMAC key (base64url)
        #[arg(long, env = "ANCHOR_EAB_KEY", requires = "eab_kid")]
        eab_key: Option<String>,

        /// TLS listen address [default: :443]
        #[arg(long)]
        listen: Option<String>,

        /// Network: tcp, tcp4 or tcp6 [default: tcp]
        #[arg(long)]
        network: Option<String>,

        /// HTTP-01 challenge responder address [default: :80]
        #[arg(long)]
        http_listen: Option<String>,

        /// Certificate provisioning timeout in seconds [default: 300]
        #[arg(long)]
        provision_timeout: Option<u64>,
    },

    /// Classify the certificates in a PEM bundle
    Inspect {
        /// PEM file containing one or more certificates
        file: PathBuf,

        /// Only certificates of this type (root, intermediate, leaf)
        #[arg(long = "type")]
        cert_type: Option<CertType>,

        /// Only certificates with this public key algorithm (rsa, ecdsa, ...)
        #[arg(long)]
        algo: Option<PublicKeyAlgorithm>,

        /// Only certificates with this subject common name
        #[arg(long)]
        name: Option<String>,

        /// Only the certificate with this serial (hex)
        #[arg(long)]
        serial: Option<String>,
    },
}

/// Resolved `serve` settings
#[derive(Debug, Clone, PartialEq)]
struct ServeSettings {
    directory_url: Url,
    server_name: String,
    eab: Option<ExternalAccountBinding>,
    listen: String,
    network: String,
    http_listen: String,
    provision_timeout: Duration,
    alpn: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
fn resolve_serve_settings(
    file: ServeFile,
    directory_url: Option<String>,
    server_name: Option<String>,
    eab_kid: Option<String>,
    eab_key: Option<String>,
    listen: Option<String>,
    network: Option<String>,
    http_listen: Option<String>,
    provision_timeout: Option<u64>,
) -> Result<ServeSettings> {
    let directory_url = directory_url
        .or(file.directory_url)
        .context("--directory-url is required (or directory_url in the config file)")?;
    let directory_url = Url::parse(&directory_url)
        .context(format!("Invalid directory URL: {}", directory_url))?;

    let server_name = server_name
        .or(file.server_name)
        .context("--server-name is required (or server_name in the config file)")?;

    let eab = match (eab_kid, eab_key) {
        (Some(key_id), Some(key)) => Some(ExternalAccountBinding::new(key_id, key)),
        _ => file
            .eab
            .map(|eab| ExternalAccountBinding::new(eab.key_id, eab.key)),
    };

    Ok(ServeSettings {
        directory_url,
        server_name,
        eab,
        listen: listen.or(file.listen).unwrap_or_else(|| ":443".to_string()),
        network: network.or(file.network).unwrap_or_else(|| "tcp".to_string()),
        http_listen: http_listen
            .or(file.http_listen)
            .unwrap_or_else(|| ":80".to_string()),
        provision_timeout: Duration::from_secs(
            provision_timeout
                .or(file.provision_timeout_secs)
                .unwrap_or(300),
        ),
        alpn: file.alpn,
    })
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "anchor=debug,anchor_server_tls=debug,anchor_acme=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "anchor=info,anchor_server_tls=info,anchor_acme=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Challenge responder address, in the same family as the TLS listener
fn challenge_address(network: &str, address: &str) -> Result<String> {
    let network = Network::parse(network).context("Invalid listen network")?;
    Ok(normalize_address(network, address))
}

async fn run_serve(settings: ServeSettings) -> Result<()> {
    let connector = AcmeConnector::new().with_order_timeout(settings.provision_timeout);
    let challenges = connector.challenge_handler();

    let mut config = Config::new(settings.directory_url.clone())
        .with_server_name(settings.server_name.clone())
        .with_provision_timeout(settings.provision_timeout)
        .with_alpn_protocols(settings.alpn.clone())
        .with_connector(Arc::new(connector));
    if let Some(eab) = settings.eab.clone() {
        config = config.with_external_account_binding(eab);
    }

    let http_listen = challenge_address(&settings.network, &settings.http_listen)?;
    tokio::spawn(async move {
        if let Err(e) = challenge::serve(&http_listen, challenges).await {
            error!("ACME challenge responder stopped: {:#}", e);
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            ctrl_c.cancel();
        }
    });

    let listener = listen_with_cancel(&settings.network, &settings.listen, &config, cancel.clone())
        .await
        .context("Failed to open TLS listener")?;

    info!(
        "Serving {} on {}",
        listener.server_name(),
        listener.local_addr()?
    );

    let banner = format!("anchor: hello from {}\n", settings.server_name);
    loop {
        let (mut stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let banner = banner.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.write_all(banner.as_bytes()).await {
                warn!("Failed to write banner to {}: {}", peer, e);
                return;
            }
            let _ = stream.shutdown().await;
        });
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            config,
            directory_url,
            server_name,
            eab_kid,
            eab_key,
            listen,
            network,
            http_listen,
            provision_timeout,
        } => {
            let file = match config {
                Some(path) => ServeFile::load(&path)?,
                None => ServeFile::default(),
            };
            let settings = resolve_serve_settings(
                file,
                directory_url,
                server_name,
                eab_kid,
                eab_key,
                listen,
                network,
                http_listen,
                provision_timeout,
            )?;
            run_serve(settings).await
        }
        Commands::Inspect {
            file,
            cert_type,
            algo,
            name,
            serial,
        } => inspect::run(
            &file,
            &InspectFilters {
                cert_type,
                algo,
                name,
                serial,
            },
        ),
    }
}
