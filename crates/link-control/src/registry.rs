//! Tenant registry
//!
//! In-memory map from tenant identity to its live session. Reads (metrics,
//! liveness scans) are frequent; writes happen only at registration and
//! teardown. Session teardown always happens outside the registry lock.

use link_proto::MuxSession;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tenant {0} is already registered")]
    AlreadyRegistered(String),
}

/// One live agent attachment
pub struct TenantSession {
    pub tenant_id: String,
    pub assigned_port: u16,
    /// SQL login echoed to the agent; absent in the simple variant
    pub sql_user: Option<String>,
    mux: Arc<MuxSession>,
    active_streams: AtomicUsize,
    last_heartbeat: Mutex<Instant>,
}

impl TenantSession {
    pub fn new(tenant_id: String, assigned_port: u16, mux: Arc<MuxSession>) -> Self {
        Self {
            tenant_id,
            assigned_port,
            sql_user: None,
            mux,
            active_streams: AtomicUsize::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
        }
    }

    pub fn with_sql_user(mut self, sql_user: String) -> Self {
        self.sql_user = Some(sql_user);
        self
    }

    pub fn mux(&self) -> &Arc<MuxSession> {
        &self.mux
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Acquire)
    }

    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stream_closed(&self) {
        self.active_streams.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record an application-level heartbeat from the agent
    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    /// True when no liveness signal (application heartbeat or mux frame)
    /// has arrived within `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let heartbeat_age = self.last_heartbeat.lock().unwrap().elapsed();
        let mux_age = self.mux.last_activity().elapsed();
        heartbeat_age.min(mux_age) > max_age
    }
}

/// Per-tenant metrics row for the admin surface
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantMetrics {
    pub tenant_id: String,
    pub assigned_port: u16,
    pub active_conns: usize,
}

/// Registry of live tenants
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, Arc<TenantSession>>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new session; fails when the tenant is already present
    pub fn insert(&self, session: Arc<TenantSession>) -> Result<(), RegistryError> {
        let mut tenants = self.tenants.write().unwrap();

        if tenants.contains_key(&session.tenant_id) {
            return Err(RegistryError::AlreadyRegistered(session.tenant_id.clone()));
        }

        tracing::info!(
            tenant_id = %session.tenant_id,
            port = session.assigned_port,
            "Tenant registered"
        );
        tenants.insert(session.tenant_id.clone(), session);
        Ok(())
    }

    /// Remove and return the session for teardown
    pub fn remove(&self, tenant_id: &str) -> Option<Arc<TenantSession>> {
        self.tenants.write().unwrap().remove(tenant_id)
    }

    /// Remove `session` only if it is still the registered entry for its
    /// tenant. A replacement registration swaps the entry, and the replaced
    /// session's own teardown must not take the newcomer with it.
    pub fn remove_session(&self, session: &Arc<TenantSession>) -> Option<Arc<TenantSession>> {
        let mut tenants = self.tenants.write().unwrap();
        match tenants.get(&session.tenant_id) {
            Some(current) if Arc::ptr_eq(current, session) => tenants.remove(&session.tenant_id),
            _ => None,
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantSession>> {
        self.tenants.read().unwrap().get(tenant_id).cloned()
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.tenants.read().unwrap().contains_key(tenant_id)
    }

    pub fn count(&self) -> usize {
        self.tenants.read().unwrap().len()
    }

    /// Sessions with no liveness signal within `max_age`
    pub fn stale_sessions(&self, max_age: Duration) -> Vec<Arc<TenantSession>> {
        self.tenants
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_stale(max_age))
            .cloned()
            .collect()
    }

    /// Immutable per-tenant view for JSON serialisation
    pub fn snapshot_metrics(&self) -> Vec<TenantMetrics> {
        self.tenants
            .read()
            .unwrap()
            .values()
            .map(|s| TenantMetrics {
                tenant_id: s.tenant_id.clone(),
                assigned_port: s.assigned_port,
                active_conns: s.active_streams(),
            })
            .collect()
    }
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}
