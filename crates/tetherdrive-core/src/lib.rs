//! TetherDrive Core - Domain types and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain types** - `SyncRoot`, `RemoteEntry`, `IdentityHash`, `PlaceholderState`, `PinState`
//! - **Port definitions** - Traits for adapters: `IRemoteStore`, `IPlaceholderHost`,
//!   `IHostCallbacks`, `ITransferSink`
//! - **Configuration** - YAML configuration for the daemon and the sync engine
//!
//! # Architecture
//!
//! The domain module contains pure data types with no I/O. Ports define the
//! trait interfaces that the synchronization engine depends on; adapter crates
//! (`tetherdrive-remote`, `tetherdrive-host`) implement them.

pub mod config;
pub mod domain;
pub mod ports;
