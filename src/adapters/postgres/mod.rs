//! PostgreSQL backend queue access.

pub mod backend;

pub use backend::{PgBackend, PgConnector};
