//! Registration handshake and per-agent control loop
//!
//! Runs after TLS termination. Two handshake modes share the same data
//! plane: the canonical framed mode (JWT-authenticated messages on a mux
//! control stream) and the legacy line mode kept as a migration aid.

use crate::forwarder::run_forwarder;
use crate::port_pool::PortPool;
use crate::registry::{TenantRegistry, TenantSession};
use crate::supervisor::teardown_tenant;
use crate::task_tracker::TaskTracker;
use bytes::BytesMut;
use link_auth::{connection_string, generate_password, sql_user, JwtValidator};
use link_his::HisClient;
use link_proto::{
    read_message, write_message, ControlMessage, ErrorCode, MuxSession, MuxStreamSender,
    RegisteredPayload, SessionConfig, SessionMode,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Deadline for the agent to complete its half of the handshake
const REGISTRATION_DEADLINE: Duration = Duration::from_secs(10);

/// Longest accepted command line in simple mode
const MAX_LINE_LEN: usize = 256;

/// Interval between heartbeats reported to the HIS backend
const HIS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Which registration handshake the relay speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    /// JWT-authenticated framed messages over a mux control stream
    Framed,
    /// Legacy `REGISTER\n` line protocol
    Simple,
}

/// Handles control connections from agents
pub struct ControlHandler {
    registry: Arc<TenantRegistry>,
    pool: Arc<PortPool>,
    tracker: Arc<TaskTracker>,
    mode: RegistrationMode,
    jwt: Option<Arc<JwtValidator>>,
    his: Option<Arc<HisClient>>,
    public_host: String,
    max_connections_per_tenant: usize,
    session_config: SessionConfig,
}

impl ControlHandler {
    pub fn new(registry: Arc<TenantRegistry>, pool: Arc<PortPool>) -> Self {
        Self {
            registry,
            pool,
            tracker: Arc::new(TaskTracker::new()),
            mode: RegistrationMode::Framed,
            jwt: None,
            his: None,
            public_host: "localhost".to_string(),
            max_connections_per_tenant: 0,
            session_config: SessionConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: RegistrationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_jwt_validator(mut self, validator: Arc<JwtValidator>) -> Self {
        self.jwt = Some(validator);
        self
    }

    pub fn with_his_client(mut self, his: Arc<HisClient>) -> Self {
        self.his = Some(his);
        self
    }

    pub fn with_public_host(mut self, host: String) -> Self {
        self.public_host = host;
        self
    }

    pub fn with_max_connections_per_tenant(mut self, max: usize) -> Self {
        self.max_connections_per_tenant = max;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Task tracker shared with the liveness supervisor
    pub fn tracker(&self) -> Arc<TaskTracker> {
        self.tracker.clone()
    }

    /// Drive one agent connection from handshake to departure
    pub async fn handle_connection<S>(self: Arc<Self>, io: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        debug!("New control connection from {}", peer_addr);

        match self.mode {
            RegistrationMode::Simple => self.handle_simple(io, peer_addr).await,
            RegistrationMode::Framed => self.handle_framed(io, peer_addr).await,
        }
    }

    /// Legacy line-protocol handshake; the connection becomes a mux session
    /// right after the `OK` reply
    async fn handle_simple<S>(&self, mut io: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let line = match timeout(REGISTRATION_DEADLINE, read_line_bounded(&mut io)).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                debug!("Failed to read command from {}: {}", peer_addr, e);
                return;
            }
            Err(_) => {
                debug!("Registration deadline expired for {}", peer_addr);
                return;
            }
        };

        if line != "REGISTER" {
            debug!("Invalid command from {}: {:?}", peer_addr, line);
            let _ = io.write_all(b"ERROR invalid command\n").await;
            let _ = io.flush().await;
            return;
        }

        let Some(port) = self.pool.acquire() else {
            warn!("No available ports for {}", peer_addr);
            let _ = io.write_all(b"ERROR no available ports\n").await;
            let _ = io.flush().await;
            return;
        };

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to bind tenant port {}: {}", port, e);
                self.pool.release(port);
                let _ = io
                    .write_all(format!("ERROR failed to bind port: {}\n", e).as_bytes())
                    .await;
                let _ = io.flush().await;
                return;
            }
        };

        let reply = format!("OK port:{}\n", port);
        if io.write_all(reply.as_bytes()).await.is_err() || io.flush().await.is_err() {
            debug!("Failed to send OK to {}", peer_addr);
            drop(listener);
            self.pool.release(port);
            return;
        }

        // The connection now belongs to the multiplexer; liveness comes from
        // its keepalives rather than HEARTBEAT lines
        let mux = Arc::new(MuxSession::with_config(
            io,
            SessionMode::Server,
            self.session_config.clone(),
        ));

        let tenant_id = format!("tenant-{}", port);
        let session = Arc::new(TenantSession::new(tenant_id.clone(), port, mux.clone()));

        // The synthetic ID is port-derived, so a collision means the port
        // was handed out twice; refuse rather than clobber
        if let Err(e) = self.registry.insert(session.clone()) {
            warn!("Registration failed for {}: {}", peer_addr, e);
            drop(listener);
            mux.shutdown();
            self.pool.release(port);
            return;
        }

        info!(tenant_id = %tenant_id, port, "Agent registered from {}", peer_addr);
        self.start_tenant(session.clone(), listener);

        mux.closed().await;
        self.teardown(&session, "control connection closed").await;
    }

    /// Canonical handshake: mux first, one control stream, framed messages
    async fn handle_framed<S>(&self, io: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mux = Arc::new(MuxSession::with_config(
            io,
            SessionMode::Server,
            self.session_config.clone(),
        ));

        let control = match timeout(REGISTRATION_DEADLINE, mux.accept_stream()).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                debug!("Session from {} died before the control stream", peer_addr);
                return;
            }
            Err(_) => {
                debug!("No control stream from {} within deadline", peer_addr);
                mux.shutdown();
                return;
            }
        };
        let (ctl_tx, mut ctl_rx) = control.split();
        let mut ctl_buf = BytesMut::new();

        let register = match timeout(
            REGISTRATION_DEADLINE,
            read_message(&mut ctl_rx, &mut ctl_buf),
        )
        .await
        {
            Ok(Ok(Some(ControlMessage::Register(payload)))) => payload,
            Ok(Ok(Some(other))) => {
                debug!("Expected register from {}, got {:?}", peer_addr, other);
                send_error(&ctl_tx, ErrorCode::RegistrationFailed, "expected register").await;
                mux.shutdown();
                return;
            }
            _ => {
                debug!("No registration message from {} within deadline", peer_addr);
                mux.shutdown();
                return;
            }
        };

        // JWT verification happens before any resource is allocated, so a
        // rejected agent leaves the pool untouched
        let claims = match &self.jwt {
            Some(validator) => match validator.validate(&register.jwt) {
                Ok(claims) => claims,
                Err(e) => {
                    warn!(
                        tenant_id = %register.tenant_id,
                        "JWT verification failed: {}", e
                    );
                    send_error(
                        &ctl_tx,
                        ErrorCode::InvalidJwt,
                        &format!("JWT verification failed: {}", e),
                    )
                    .await;
                    mux.shutdown();
                    return;
                }
            },
            None => {
                warn!("Framed registration without a configured JWT validator");
                send_error(&ctl_tx, ErrorCode::RegistrationFailed, "authentication unavailable")
                    .await;
                mux.shutdown();
                return;
            }
        };

        if claims.sub != register.tenant_id {
            warn!(
                expected = %claims.sub,
                got = %register.tenant_id,
                "Tenant ID mismatch"
            );
            send_error(
                &ctl_tx,
                ErrorCode::TenantIdMismatch,
                "Tenant ID does not match JWT claims",
            )
            .await;
            mux.shutdown();
            return;
        }

        let tenant_id = register.tenant_id;
        info!(
            tenant_id = %tenant_id,
            organization = %claims.organization_id,
            version = %register.version,
            "Agent authenticated"
        );

        let Some(port) = self.pool.acquire() else {
            warn!(tenant_id = %tenant_id, "No available ports");
            send_error(&ctl_tx, ErrorCode::NoAvailablePorts, "no available ports").await;
            mux.shutdown();
            return;
        };

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(tenant_id = %tenant_id, port, "Failed to bind tenant port: {}", e);
                self.pool.release(port);
                send_error(
                    &ctl_tx,
                    ErrorCode::RegistrationFailed,
                    &format!("failed to bind port: {}", e),
                )
                .await;
                mux.shutdown();
                return;
            }
        };

        // Re-registration always wins: the previous session is fully torn
        // down (listener closed, mux closed, port released) before the new
        // agent hears anything
        if let Some(previous) = self.registry.get(&tenant_id) {
            info!(tenant_id = %tenant_id, "Tenant re-registering, replacing previous session");
            self.teardown(&previous, "replaced by new registration").await;
        }

        let user = sql_user(&tenant_id);
        let password = generate_password();

        let session = Arc::new(
            TenantSession::new(tenant_id.clone(), port, mux.clone()).with_sql_user(user.clone()),
        );

        if let Err(e) = self.registry.insert(session.clone()) {
            // Lost a race with a concurrent registration for the same tenant
            warn!(tenant_id = %tenant_id, "Registration race lost: {}", e);
            drop(listener);
            self.pool.release(port);
            send_error(&ctl_tx, ErrorCode::RegistrationFailed, "concurrent registration").await;
            mux.shutdown();
            return;
        }

        let registered = ControlMessage::Registered(RegisteredPayload {
            tenant_id: tenant_id.clone(),
            assigned_port: port,
            sql_user: user.clone(),
            sql_password: password.clone(),
            public_host: self.public_host.clone(),
            connection_string: connection_string(&self.public_host, port, &user, &password),
        });

        if write_message(&ctl_tx, &registered).await.is_err() {
            warn!(tenant_id = %tenant_id, "Failed to deliver registration response");
            self.teardown(&session, "registration response undeliverable")
                .await;
            return;
        }

        info!(tenant_id = %tenant_id, port, "Tenant assigned port");
        self.start_tenant(session.clone(), listener);

        // Control loop: application pings refresh the heartbeat; the mux
        // watchdog covers everything else
        loop {
            tokio::select! {
                result = read_message(&mut ctl_rx, &mut ctl_buf) => match result {
                    Ok(Some(ControlMessage::Ping)) => {
                        session.touch_heartbeat();
                        let _ = write_message(&ctl_tx, &ControlMessage::Pong).await;
                    }
                    Ok(Some(other)) => {
                        debug!(tenant_id = %tenant_id, "Ignoring control message {:?}", other);
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = mux.closed() => break,
            }
        }

        self.teardown(&session, "control connection closed").await;
    }

    /// Launch the forwarder and directory notifications for a registered tenant
    fn start_tenant(&self, session: Arc<TenantSession>, listener: TcpListener) {
        let handle = tokio::spawn(run_forwarder(
            listener,
            session.clone(),
            self.max_connections_per_tenant,
        ));
        self.tracker.register(session.tenant_id.clone(), handle);

        let Some(his) = self.his.clone() else {
            return;
        };

        {
            let his = his.clone();
            let tenant_id = session.tenant_id.clone();
            let port = session.assigned_port;
            tokio::spawn(async move {
                match his.register_port(&tenant_id, port).await {
                    Ok(()) => info!(tenant_id = %tenant_id, port, "Port registered with HIS"),
                    Err(e) => {
                        warn!(tenant_id = %tenant_id, "Failed to register port with HIS: {}", e)
                    }
                }
            });
        }

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HIS_HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;

                // Stop once this session left the registry (departed or replaced)
                let still_live = registry
                    .get(&session.tenant_id)
                    .map(|current| Arc::ptr_eq(&current, &session))
                    .unwrap_or(false);
                if !still_live {
                    return;
                }

                if let Err(e) = his.heartbeat(&session.tenant_id).await {
                    warn!(
                        tenant_id = %session.tenant_id,
                        "Failed to send heartbeat to HIS: {}", e
                    );
                }
            }
        });
    }

    async fn teardown(&self, session: &Arc<TenantSession>, reason: &str) {
        teardown_tenant(&self.registry, &self.tracker, &self.pool, session, reason).await;
    }
}

async fn send_error(ctl_tx: &MuxStreamSender, code: ErrorCode, message: &str) {
    let _ = write_message(
        ctl_tx,
        &ControlMessage::Error {
            code,
            message: message.to_string(),
        },
    )
    .await;
}

/// Read one LF-terminated line, byte at a time so nothing beyond the line is
/// consumed before the connection is handed to the multiplexer
async fn read_line_bounded<S>(io: &mut S) -> std::io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(16);

    loop {
        let byte = io.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "command line too long",
            ));
        }
        line.push(byte);
    }

    String::from_utf8(line)
        .map(|s| s.trim().to_string())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "command not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_bounded_trims() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(b"  REGISTER \r\nrest").await.unwrap();
        });

        let line = read_line_bounded(&mut b).await.unwrap();
        assert_eq!(line, "REGISTER");

        // Bytes after the newline stay unread
        let mut rest = [0u8; 4];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversize() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            a.write_all(&[b'x'; 400]).await.unwrap();
            a.write_all(b"\n").await.unwrap();
        });

        assert!(read_line_bounded(&mut b).await.is_err());
    }
}
