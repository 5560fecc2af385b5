//! Message-passing binding to a [`crate::StrategyExecutor`] on worker threads.
//!
//! The interface is a fixed set of operations ([`wire::RequestKind`] plus a method or property
//! path), not dynamic forwarding. Callbacks cross as registered handles; byte regions cross by
//! copy or by ownership transfer.

/// Caller side of the binding.
pub mod client;
/// Callback handle registry and remote handles.
pub mod handles;
/// Messages and values exchanged over the binding.
pub mod wire;
pub(crate) mod worker;
