//! `trace` crate — structured, leveled event emission for the dispatcher.
//!
//! The dispatcher and system-state engine never talk to a tracing backend
//! directly; they emit [`TraceEvent`]s through a [`TraceSink`] trait object.
//! Emission must never fail from the engine's point of view — a sink that
//! wants to report its own failure does so internally (e.g. via the
//! `tracing` crate) rather than by returning an error.

pub mod event;
pub mod sink;

pub use event::{FlowInfo, TraceEvent, TraceEventKind};
pub use sink::{NullSink, RingSink, TraceSink, TracingSink};
