//! Top-level relay: TLS control listener plus all background services

use crate::config::RelayConfig;
use link_admin::AdminState;
use link_auth::JwtValidator;
use link_control::{
    run_supervisor, ControlHandler, PortPool, SupervisorConfig, TenantRegistry,
};
use link_his::HisClient;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Notifier error: {0}")]
    His(#[from] link_his::HisError),

    #[error("Failed to bind {what} on port {port}: {reason}")]
    Bind {
        what: &'static str,
        port: u16,
        reason: String,
    },
}

/// A configured relay, ready to run
pub struct Relay {
    config: RelayConfig,
    registry: Arc<TenantRegistry>,
    pool: Arc<PortPool>,
    handler: Arc<ControlHandler>,
    tls_acceptor: TlsAcceptor,
}

impl Relay {
    /// Wire up all components; fails fast on unusable TLS material
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let tls_acceptor = build_tls_acceptor(&config.tls_cert_file, &config.tls_key_file)?;

        let registry = Arc::new(TenantRegistry::new());
        let pool = Arc::new(PortPool::new(
            config.tenant_port_start,
            config.tenant_port_end,
        ));

        let mut handler = ControlHandler::new(registry.clone(), pool.clone())
            .with_mode(config.registration_mode)
            .with_public_host(config.public_host.clone())
            .with_max_connections_per_tenant(config.max_connections_per_tenant);

        if let Some(jwt) = &config.jwt {
            handler = handler.with_jwt_validator(Arc::new(JwtValidator::new(
                jwt.secret.as_bytes(),
                &jwt.issuer,
                &jwt.audience,
            )));
        }

        if let Some(his) = &config.his {
            let client = HisClient::new(his.backend_url.clone(), his.relay_shared_secret.clone())?;
            handler = handler.with_his_client(Arc::new(client));
        }

        Ok(Self {
            config,
            registry,
            pool,
            handler: Arc::new(handler),
            tls_acceptor,
        })
    }

    /// Run until SIGINT/SIGTERM; returns only on graceful shutdown
    pub async fn run(self) -> Result<(), RelayError> {
        let control_addr: SocketAddr = ([0, 0, 0, 0], self.config.control_port).into();
        let control_listener =
            TcpListener::bind(control_addr)
                .await
                .map_err(|e| RelayError::Bind {
                    what: "control listener",
                    port: self.config.control_port,
                    reason: e.to_string(),
                })?;

        let admin_addr: SocketAddr = ([0, 0, 0, 0], self.config.admin_port).into();
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .map_err(|e| RelayError::Bind {
                what: "admin listener",
                port: self.config.admin_port,
                reason: e.to_string(),
            })?;

        info!("Tatbeeb Link relay started");
        info!("  Control port: {} (TLS)", self.config.control_port);
        info!(
            "  Tenant ports: {}-{}",
            self.config.tenant_port_start, self.config.tenant_port_end
        );
        info!("  Health check: http://localhost:{}/health", self.config.admin_port);

        let mut join_set = tokio::task::JoinSet::new();

        let admin_state = Arc::new(AdminState {
            registry: self.registry.clone(),
            pool: self.pool.clone(),
        });
        join_set.spawn(async move {
            if let Err(e) = link_admin::serve(admin_listener, admin_state).await {
                error!("Admin server error: {}", e);
            }
        });

        join_set.spawn(run_supervisor(
            self.registry.clone(),
            self.handler.tracker(),
            self.pool.clone(),
            SupervisorConfig::default(),
        ));

        let acceptor = self.tls_acceptor.clone();
        let handler = self.handler.clone();
        join_set.spawn(async move {
            loop {
                match control_listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        let acceptor = acceptor.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            // A failed TLS handshake closes the socket silently
                            match acceptor.accept(socket).await {
                                Ok(tls_stream) => {
                                    handler.handle_connection(tls_stream, peer_addr).await;
                                }
                                Err(e) => {
                                    debug!("TLS handshake failed from {}: {}", peer_addr, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting control connection: {}", e);
                    }
                }
            }
        });

        wait_for_shutdown_signal().await?;
        info!("Shutting down relay");

        join_set.abort_all();
        while join_set.join_next().await.is_some() {}

        info!("Relay stopped");
        Ok(())
    }
}

async fn wait_for_shutdown_signal() -> Result<(), RelayError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

// Initialize rustls crypto provider once
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Build the control-port TLS acceptor from PEM files; TLS 1.2 minimum
fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, RelayError> {
    ensure_crypto_provider();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_crypto = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| RelayError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_crypto)))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, RelayError> {
    let file = std::fs::File::open(path)
        .map_err(|e| RelayError::Tls(format!("Failed to open cert file {:?}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, RelayError> {
    let file = std::fs::File::open(path)
        .map_err(|e| RelayError::Tls(format!("Failed to open key file {:?}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RelayError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| RelayError::Tls("No private key found".to_string()))
}
