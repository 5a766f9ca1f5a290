//! # Database Operations
//!
//! PostgreSQL access for the one piece of state the poller persists, the run window.
//!
//! - [`connection`] - Connection pool setup and health checks
//! - [`migrations`] - Bundled schema migrations guarded by an advisory lock

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::DatabaseMigrations;
