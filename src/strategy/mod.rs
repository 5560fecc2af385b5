/// The nine strategies and their descriptors.
pub mod descriptor;
/// Compute-mode state machine and the callback contract.
pub mod executor;
/// Render jobs and cooperative cancellation.
pub mod job;
