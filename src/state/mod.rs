/// Run state of an automation group
///
/// The status is shared between the operator handle and the worker thread
/// through an atomic, so neither side ever blocks on the other to read it.

pub mod run_state;

// Re-export commonly used types
pub use run_state::{RunStatus, StatusCell, StopReason};
