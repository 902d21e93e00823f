//! Gate telemetry: structured events and pluggable sinks.
//!
//! Sinks are `tower::Service<GateEvent>` implementations, so they compose
//! with the same machinery as everything else. Emission from the gate is
//! always best effort; a slow downstream sink should be wrapped in
//! [`NonBlockingSink`] so it never stalls admission.

pub mod events;
pub mod sinks;

pub use events::GateEvent;
pub use sinks::{emit_best_effort, GateSink, LogSink, MemorySink, NonBlockingSink, NullSink};
