//! Node orchestration and thread management.
//!
//! Contains the top-level `AgentNode` that spawns and coordinates the
//! estimator and network-receiver threads around one agent's consensus core.

pub mod node;

pub use node::AgentNode;
