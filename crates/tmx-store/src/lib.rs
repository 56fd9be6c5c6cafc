//! Persistence for tenants and consumed messages
//!
//! `TenantDirectory` and `MessageStore` are the seams the router is written
//! against. PostgreSQL is the production backend and keeps one list partition
//! of `messages` per tenant; SQLite backs tests and local development.

pub mod error;
pub mod repository;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::StoreError;
pub use repository::{CreationClock, MessageStore, TenantDirectory};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;
