//! Synchronization between agents: wire messages, the transport seam, and
//! the round-negotiation coordinator.

pub mod coordinator;
pub mod message;
pub mod transport;

pub use coordinator::{RoundStart, SyncCoordinator};
pub use message::{decode_message, encode_message, CodecError, SolverStateMsg, SyncSignal};
pub use transport::{BusEndpoint, Incoming, MemoryBus, Transport, TransportError};
