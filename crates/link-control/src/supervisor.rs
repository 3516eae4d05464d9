//! Liveness supervisor and tenant teardown
//!
//! The mux keepalive catches most dead agents immediately; the supervisor
//! is the backstop that reaps tenants whose sessions have gone silent
//! without the transport noticing.

use crate::port_pool::PortPool;
use crate::registry::TenantRegistry;
use crate::task_tracker::TaskTracker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Scan interval
    pub interval: Duration,
    /// A tenant with no liveness signal for longer than this is reaped
    pub max_age: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(120),
        }
    }
}

/// Tear down one tenant: registry removal, listener close, mux close, port
/// release, in that order. Idempotent; concurrent callers race on the
/// registry removal and only the winner proceeds. The removal is guarded by
/// session identity so a replaced session cannot tear down its replacement.
pub async fn teardown_tenant(
    registry: &TenantRegistry,
    tracker: &TaskTracker,
    pool: &PortPool,
    session: &Arc<crate::registry::TenantSession>,
    reason: &str,
) {
    let Some(session) = registry.remove_session(session) else {
        return;
    };

    // Stop the accept loop; awaiting the aborted task guarantees the
    // listener is dropped before its port re-enters the pool
    if let Some(handle) = tracker.remove(&session.tenant_id) {
        handle.abort();
        let _ = handle.await;
    }

    // In-flight streams error out and their pumps close the client sockets
    session.mux().shutdown();

    pool.release(session.assigned_port);

    info!(
        tenant_id = %session.tenant_id,
        port = session.assigned_port,
        reason,
        "Tenant departed"
    );
}

/// Periodic staleness scan; runs for the lifetime of the relay
pub async fn run_supervisor(
    registry: Arc<TenantRegistry>,
    tracker: Arc<TaskTracker>,
    pool: Arc<PortPool>,
    config: SupervisorConfig,
) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        interval.tick().await;

        // Collect under the read lock, tear down outside it
        let stale = registry.stale_sessions(config.max_age);
        for session in stale {
            warn!(tenant_id = %session.tenant_id, "Tenant timed out");
            teardown_tenant(&registry, &tracker, &pool, &session, "liveness timeout").await;
        }
    }
}
