//! Domain entities
//!
//! This module contains the core domain types for TetherDrive:
//! - Newtypes for validated identifiers and paths
//! - Sync root definitions
//! - Remote entries and their identity hash
//! - Placeholder and pin states
//! - Domain-specific error types

pub mod errors;
pub mod newtypes;
pub mod placeholder;
pub mod remote_entry;
pub mod sync_root;

// Re-export commonly used types
pub use errors::DomainError;
pub use newtypes::*;
pub use placeholder::{LocalPlaceholderInfo, PinState, PlaceholderState};
pub use remote_entry::RemoteEntry;
pub use sync_root::{PopulationPolicy, RemoteConnection, SyncRoot};
