// Crashmon Infrastructure - SQLite Adapter
// Implements: QueueDatabase (identity-keyed connection pool), QueueSession

mod connection;
mod error;
mod migration;
mod session;

pub use connection::{connect_options, create_pool, ConnectionPool};
pub use migration::run_migrations;
pub use session::SqliteQueueSession;

// Note: sqlx::Error conversion is handled by wrapping in helper functions
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
