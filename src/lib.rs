// Re-export needed modules for testing
pub mod config;
pub mod error;
pub mod models;
pub mod realtime;
pub mod rest;
pub mod wire;

// Re-export main types for convenience
pub use error::{SyncError, SyncResult};
pub use models::*;
pub use realtime::{ChatSession, ConnectionManager, SessionUpdate};
