//! TenantMux consumer orchestration
//!
//! This crate runs the per-tenant consumers and the operations that change
//! them while traffic is flowing:
//! - WorkerPool: resizable concurrency limiter with RAII permits
//! - TenantConsumer: dispatch loop from a tenant queue into the pool
//! - ConsumerRegistry: live consumers keyed by tenant, snapshots only
//! - TenantService: create / delete / resize tenants end to end
//! - MessageService: publish path and cursor pagination

pub mod error;
pub mod pool;
pub mod consumer;
pub mod registry;
pub mod tenants;
pub mod messages;

pub use error::{ErrorKind, RouterError};
pub use pool::{PoolPermit, WorkerPool};
pub use consumer::{ConsumerSettings, MessageProcessor, StoreProcessor, TenantConsumer};
pub use registry::ConsumerRegistry;
pub use tenants::{RestoreSummary, TenantService};
pub use messages::MessageService;

pub type Result<T> = std::result::Result<T, RouterError>;
