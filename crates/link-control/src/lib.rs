//! Control plane for the Tatbeeb Link relay
pub mod forwarder;
pub mod handler;
pub mod port_pool;
pub mod registry;
pub mod supervisor;
pub mod task_tracker;

pub use handler::{ControlHandler, RegistrationMode};
pub use port_pool::PortPool;
pub use registry::{TenantMetrics, TenantRegistry, TenantSession};
pub use supervisor::{run_supervisor, teardown_tenant, SupervisorConfig};
pub use task_tracker::TaskTracker;
