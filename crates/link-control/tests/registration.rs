//! End-to-end registration and forwarding scenarios
//!
//! The handler is driven over in-memory duplex pipes standing in for the
//! TLS-terminated control connection; public ports are real sockets on
//! loopback.

use bytes::BytesMut;
use link_auth::{JwtValidator, LinkClaims};
use link_control::{ControlHandler, PortPool, RegistrationMode, TenantRegistry};
use link_proto::{
    read_message, write_message, ControlMessage, ErrorCode, MuxSession, RegisterPayload,
    SessionMode,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_SECRET: &[u8] = b"registration-test-secret";
const ISSUER: &str = "his.tatbeeb.sa";
const AUDIENCE: &str = "tatbeeb-link.tatbeeb.sa";

fn peer_addr() -> SocketAddr {
    "203.0.113.9:45000".parse().unwrap()
}

/// Grab a free loopback port for the pool; the listener is dropped so the
/// relay can bind it
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_token(tenant_id: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = LinkClaims {
        sub: tenant_id.to_string(),
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
        exp: now + 3600,
        iat: now,
        organization_id: "org-1".to_string(),
        user_id: "user-1".to_string(),
        role: "agent".to_string(),
    };
    JwtValidator::encode(TEST_SECRET, &claims).unwrap()
}

fn framed_handler(
    registry: Arc<TenantRegistry>,
    pool: Arc<PortPool>,
) -> Arc<ControlHandler> {
    let validator = Arc::new(JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE));
    Arc::new(
        ControlHandler::new(registry, pool)
            .with_mode(RegistrationMode::Framed)
            .with_jwt_validator(validator)
            .with_public_host("link.tatbeeb.sa".to_string()),
    )
}

/// Agent-side helper: accept streams from the relay and echo all bytes back
fn spawn_echo_agent(mux: Arc<MuxSession>) {
    tokio::spawn(async move {
        while let Some(mut stream) = mux.accept_stream().await {
            tokio::spawn(async move {
                while let Some(chunk) = stream.recv().await {
                    if stream.send(&chunk).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

async fn read_reply_line(io: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    loop {
        let byte = io.read_u8().await.unwrap();
        if byte == b'\n' {
            break;
        }
        line.push(byte);
    }
    String::from_utf8(line).unwrap()
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// An agent that completed the framed handshake
struct FramedAgent {
    mux: Arc<MuxSession>,
    reply: ControlMessage,
    // Held open: dropping the control stream would end the tenant session
    ctl_tx: link_proto::MuxStreamSender,
    ctl_rx: link_proto::MuxStreamReceiver,
    ctl_buf: BytesMut,
}

/// Run the framed registration handshake and return the live agent side
async fn register_framed(handler: Arc<ControlHandler>, tenant_id: &str, jwt: String) -> FramedAgent {
    let (relay_io, agent_io) = tokio::io::duplex(256 * 1024);
    tokio::spawn(handler.handle_connection(relay_io, peer_addr()));

    let agent_mux = Arc::new(MuxSession::new(agent_io, SessionMode::Client));
    let control = agent_mux.open_stream().unwrap();
    let (ctl_tx, mut ctl_rx) = control.split();

    write_message(
        &ctl_tx,
        &ControlMessage::Register(RegisterPayload {
            tenant_id: tenant_id.to_string(),
            jwt,
            version: "1.0.0".to_string(),
        }),
    )
    .await
    .unwrap();

    let mut ctl_buf = BytesMut::new();
    let reply = timeout(
        Duration::from_secs(5),
        read_message(&mut ctl_rx, &mut ctl_buf),
    )
    .await
    .expect("reply in time")
    .expect("decodable reply")
    .expect("some reply");

    FramedAgent {
        mux: agent_mux,
        reply,
        ctl_tx,
        ctl_rx,
        ctl_buf,
    }
}

#[tokio::test]
async fn simple_registration_and_byte_identity() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let handler = Arc::new(
        ControlHandler::new(registry.clone(), pool.clone()).with_mode(RegistrationMode::Simple),
    );

    let (relay_io, mut agent_io) = tokio::io::duplex(256 * 1024);
    tokio::spawn(handler.handle_connection(relay_io, peer_addr()));

    agent_io.write_all(b"REGISTER\n").await.unwrap();
    let reply = read_reply_line(&mut agent_io).await;
    assert_eq!(reply, format!("OK port:{}", port));

    // Same connection becomes the mux transport
    let agent_mux = Arc::new(MuxSession::new(agent_io, SessionMode::Client));
    spawn_echo_agent(agent_mux.clone());

    wait_until(|| registry.count() == 1).await;
    assert_eq!(pool.free_count(), 0);
    let session = registry.get(&format!("tenant-{}", port)).unwrap();
    assert_eq!(session.assigned_port, port);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"SELECT 1").await.unwrap();

    let mut buf = [0u8; 8];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"SELECT 1");
}

#[tokio::test]
async fn simple_rejects_bad_command() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let handler = Arc::new(
        ControlHandler::new(registry.clone(), pool.clone()).with_mode(RegistrationMode::Simple),
    );

    let (relay_io, mut agent_io) = tokio::io::duplex(4096);
    tokio::spawn(handler.handle_connection(relay_io, peer_addr()));

    agent_io.write_all(b"HELLO\n").await.unwrap();
    let reply = read_reply_line(&mut agent_io).await;
    assert_eq!(reply, "ERROR invalid command");

    assert_eq!(pool.free_count(), 1);
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn simple_pool_exhaustion() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let handler = Arc::new(
        ControlHandler::new(registry.clone(), pool.clone()).with_mode(RegistrationMode::Simple),
    );

    // First agent takes the only port
    let (relay_io, mut first_agent) = tokio::io::duplex(256 * 1024);
    tokio::spawn(handler.clone().handle_connection(relay_io, peer_addr()));
    first_agent.write_all(b"REGISTER\n").await.unwrap();
    assert!(read_reply_line(&mut first_agent).await.starts_with("OK"));
    let _first_mux = Arc::new(MuxSession::new(first_agent, SessionMode::Client));

    // Second agent is turned away
    let (relay_io, mut second_agent) = tokio::io::duplex(4096);
    tokio::spawn(handler.handle_connection(relay_io, peer_addr()));
    second_agent.write_all(b"REGISTER\n").await.unwrap();
    let reply = read_reply_line(&mut second_agent).await;
    assert_eq!(reply, "ERROR no available ports");

    assert_eq!(registry.count(), 1);
}

#[tokio::test]
async fn framed_registration_and_forwarding() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let handler = framed_handler(registry.clone(), pool.clone());

    let mut agent =
        register_framed(handler, "clinic-riyadh-001", test_token("clinic-riyadh-001")).await;

    let ControlMessage::Registered(payload) = agent.reply.clone() else {
        panic!("expected registered, got {:?}", agent.reply);
    };
    assert_eq!(payload.tenant_id, "clinic-riyadh-001");
    assert_eq!(payload.assigned_port, port);
    assert_eq!(payload.sql_user, "tatbeeb_clinic");
    assert_eq!(payload.public_host, "link.tatbeeb.sa");
    assert!(payload
        .connection_string
        .starts_with(&format!("Server=link.tatbeeb.sa,{};", port)));
    assert!(payload
        .connection_string
        .contains(&format!("User Id={};", payload.sql_user)));

    spawn_echo_agent(agent.mux.clone());
    wait_until(|| registry.count() == 1).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    let session = registry.get("clinic-riyadh-001").unwrap();
    assert_eq!(session.sql_user.as_deref(), Some("tatbeeb_clinic"));

    // Application pings on the control stream are answered and refresh the
    // tenant heartbeat
    write_message(&agent.ctl_tx, &ControlMessage::Ping)
        .await
        .unwrap();
    let pong = timeout(
        Duration::from_secs(5),
        read_message(&mut agent.ctl_rx, &mut agent.ctl_buf),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(pong, Some(ControlMessage::Pong));
}

#[tokio::test]
async fn framed_rejects_bad_audience_without_touching_pool() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let handler = framed_handler(registry.clone(), pool.clone());

    // Token signed with the right secret but for a different audience
    let now = chrono::Utc::now().timestamp();
    let claims = LinkClaims {
        sub: "clinic-001".to_string(),
        iss: ISSUER.to_string(),
        aud: "someone-else".to_string(),
        exp: now + 3600,
        iat: now,
        organization_id: String::new(),
        user_id: String::new(),
        role: String::new(),
    };
    let jwt = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

    let agent = register_framed(handler, "clinic-001", jwt).await;

    let ControlMessage::Error { code, .. } = agent.reply else {
        panic!("expected error, got {:?}", agent.reply);
    };
    assert_eq!(code, ErrorCode::InvalidJwt);
    assert_eq!(pool.free_count(), 1);
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn framed_rejects_tenant_id_mismatch() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let handler = framed_handler(registry.clone(), pool.clone());

    // JWT subject differs from the claimed tenant
    let agent = register_framed(handler, "clinic-002", test_token("clinic-001")).await;

    let ControlMessage::Error { code, .. } = agent.reply else {
        panic!("expected error, got {:?}", agent.reply);
    };
    assert_eq!(code, ErrorCode::TenantIdMismatch);
    assert_eq!(pool.free_count(), 1);
}

/// Find two adjacent free loopback ports so the pool can hold a contiguous
/// two-port range
async fn free_port_pair() -> (u16, u16) {
    for _ in 0..64 {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if tokio::net::TcpListener::bind(("127.0.0.1", port + 1))
            .await
            .is_ok()
        {
            return (port, port + 1);
        }
    }
    panic!("no adjacent free ports on loopback");
}

#[tokio::test]
async fn framed_reregistration_replaces_previous_session() {
    let (low, high) = free_port_pair().await;
    let pool = Arc::new(PortPool::new(low, high));
    let registry = Arc::new(TenantRegistry::new());
    let handler = framed_handler(registry.clone(), pool.clone());

    let first = register_framed(handler.clone(), "clinic-001", test_token("clinic-001")).await;
    let ControlMessage::Registered(first_reg) = first.reply.clone() else {
        panic!("expected registered");
    };
    wait_until(|| registry.count() == 1).await;

    let second = register_framed(handler, "clinic-001", test_token("clinic-001")).await;
    let ControlMessage::Registered(second_reg) = second.reply.clone() else {
        panic!("expected registered for replacement");
    };

    // The old session was fully torn down before the replacement's
    // confirmation was sent; the agent side observes the close via EOF
    timeout(Duration::from_secs(5), first.mux.closed())
        .await
        .expect("replaced session should close");
    assert!(!second.mux.is_closed());
    assert_ne!(first_reg.assigned_port, second_reg.assigned_port);
    assert_eq!(registry.count(), 1);
    assert_eq!(
        registry.get("clinic-001").unwrap().assigned_port,
        second_reg.assigned_port
    );

    // The first port went back to the pool
    wait_until(|| pool.free_count() == 1).await;
}

#[tokio::test]
async fn agent_disconnect_tears_down_tenant() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let handler = framed_handler(registry.clone(), pool.clone());

    let agent = register_framed(handler, "clinic-001", test_token("clinic-001")).await;
    assert!(matches!(agent.reply, ControlMessage::Registered(_)));

    spawn_echo_agent(agent.mux.clone());
    wait_until(|| registry.count() == 1).await;

    // One stream in flight
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"hold").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    // Sever the agent
    agent.mux.shutdown();

    wait_until(|| registry.count() == 0).await;
    wait_until(|| pool.free_count() == 1).await;

    // The in-flight client socket is closed
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("client socket should close")
        .unwrap_or(0);
    assert_eq!(n, 0);

    // The public port no longer accepts
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn connection_cap_is_enforced() {
    let port = free_port().await;
    let pool = Arc::new(PortPool::new(port, port));
    let registry = Arc::new(TenantRegistry::new());
    let validator = Arc::new(JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE));
    let handler = Arc::new(
        ControlHandler::new(registry.clone(), pool.clone())
            .with_mode(RegistrationMode::Framed)
            .with_jwt_validator(validator)
            .with_max_connections_per_tenant(2),
    );

    let agent = register_framed(handler, "clinic-001", test_token("clinic-001")).await;
    assert!(matches!(agent.reply, ControlMessage::Registered(_)));
    spawn_echo_agent(agent.mux.clone());
    wait_until(|| registry.count() == 1).await;

    // Exactly two concurrent connections succeed
    let mut held = Vec::new();
    for _ in 0..2 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"up").await.unwrap();
        let mut buf = [0u8; 2];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        held.push(client);
    }

    let session = registry.get("clinic-001").unwrap();
    wait_until(|| session.active_streams() == 2).await;

    // The third is closed without a stream being opened
    let mut extra = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), extra.read(&mut buf))
        .await
        .expect("over-limit client should be closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(session.active_streams(), 2);
}
