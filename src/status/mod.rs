//! Operation status reporting
//!
//! Side channel only: the awaited `Result` of an operation is its completion
//! signal, status events are for display.

mod reporter;

pub use reporter::{StatusEvent, StatusPhase, StatusReporter};
