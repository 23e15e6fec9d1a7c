//! Network transport layer
//!
//! Provides the embedded Tor client (Arti), the circuit pool used for
//! grouped and shared circuits, and gRPC channel construction over either a
//! direct TCP connection or a Tor stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuits;
pub mod error;
pub mod tor;
mod transport;

// Re-export main types
pub use circuits::{CircuitConnector, CircuitKind, CircuitPool, TorCircuitConnector};
pub use error::{Error, Result};
pub use tor::{shared_tor_client, TorClient, TorConfig, TorStatus};
pub use transport::{connect_direct_channel, connect_tor_channel, uri_host_port};
