//! Conditional-write job-state store boundary.
//!
//! The coordinator only relies on the contract in [`StateStore`]: strongly
//! consistent single-key reads, create-if-absent, and precondition-guarded
//! updates. Backends: in-memory (tests/dev) and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use r#trait::{StateStore, StateStoreError};
