//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync engine
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteStore`] - File operations against the remote store of a root
//! - [`IPlaceholderHost`] - Placeholder primitives of the virtualization host
//! - [`IHostCallbacks`] - Callback table the host invokes on the engine
//! - [`ITransferSink`] - Destination of hydration data for one request

pub mod placeholder_host;
pub mod remote_store;

pub use placeholder_host::{
    ConnectionKey, DataRequest, IHostCallbacks, IPlaceholderHost, ITransferSink,
};
pub use remote_store::{IRemoteStore, RemoteReader};
