//! Control plane and binary decoder for the Linux ftrace subsystem.
//!
//! Everything talks to the kernel through the [`TraceFs`] trait, whose
//! production implementation is [`SysTraceFs`] over a mounted tracefs.
//! On top of that sit controllers for tracing instances, tracers and
//! options, static events, dynamic kprobes and pid scoping, plus a
//! decoder that turns the raw per-CPU ring buffer into typed events.
//!
//! The crate never parses the kernel's human-readable `trace` file; it
//! reads `trace_pipe_raw` and decodes records against the `format`
//! descriptors the kernel itself exports.

pub mod capture;
pub mod decode;
pub mod error;
pub mod events;
pub mod format;
pub mod instance;
pub mod kprobe;
pub mod pid;
pub mod reader;
pub mod tracefs;
pub mod tracer;

pub use crate::capture::CaptureEngine;
pub use crate::capture::EventSelection;
pub use crate::capture::Spawner;
pub use crate::capture::SysSpawner;
pub use crate::decode::DecodedEvent;
pub use crate::decode::FieldValue;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::events::EventController;
pub use crate::events::EventSelect;
pub use crate::format::EventFormat;
pub use crate::format::FormatDatabase;
pub use crate::instance::Instance;
pub use crate::instance::InstanceManager;
pub use crate::kprobe::KprobeManager;
pub use crate::kprobe::Probe;
pub use crate::kprobe::ProbeKind;
pub use crate::pid::PidScope;
pub use crate::pid::PidScoping;
pub use crate::reader::TraceReader;
pub use crate::tracefs::SysTraceFs;
pub use crate::tracefs::TraceFs;
pub use crate::tracer::TracerController;
