//! TetherDrive Host - placeholder primitives on a plain Linux filesystem
//!
//! Implements [`IPlaceholderHost`](tetherdrive_core::ports::IPlaceholderHost)
//! without kernel support:
//! - Placeholders are sparse files of the remote length
//! - Per-entry state lives in `user.tetherdrive.*` extended attributes
//! - Hydration drives the registered callback table and writes the returned
//!   chunks into the stub
//!
//! # Architecture
//!
//! - [`XattrPlaceholderHost`] is the adapter handed to the sync engine
//! - [`xattr`] wraps the raw `getxattr(2)` family and the attribute encoding
//! - [`HostError`] classifies failures and maps them to errno values
//!
//! The filesystem holding the sync roots must support user extended
//! attributes (ext4, xfs, btrfs, tmpfs with `user_xattr`).

pub mod error;
pub mod host;
pub mod xattr;

pub use error::HostError;
pub use host::XattrPlaceholderHost;
