pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::*;
pub use types::*;

/// Process exit codes for the hosting binary.
pub mod exit {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Invalid configuration.
    pub const CONFIG: i32 = 64;
    /// Unreadable persisted state (magic / schema version mismatch).
    pub const STATE: i32 = 65;
    /// Unrecoverable internal error.
    pub const INTERNAL: i32 = 70;
    /// I/O error on the data directory.
    pub const IO: i32 = 74;
}
