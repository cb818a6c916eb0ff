//! Real-time playout of file-backed media

pub mod driver;
pub mod gate;
pub mod source;

pub use driver::{Cadence, PlayoutDriver, PlayoutSummary, StopReason};
pub use gate::ReadyGate;
pub use source::{FileSources, PlayoutSource, SourceProvider};
