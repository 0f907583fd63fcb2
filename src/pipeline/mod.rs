//! C12 — PipelineSupervisor. The finite state machine that sequences
//! C1-C11, owns the per-run temp workspace, and publishes progress/step
//! changes onto the transport event bus (SPEC_FULL.md §4.12).

pub mod state;
pub mod supervisor;

pub use state::{PipelineState, ScanType, Source, Step};
pub use supervisor::PipelineSupervisor;
