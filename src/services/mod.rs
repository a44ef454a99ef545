// src/services/mod.rs
pub mod error_handler;
pub mod grouping_hooks;
pub mod types;

pub use error_handler::{ErrorHandler, ErrorReporter, LogEntry};
pub use grouping_hooks::GroupingHooks;
pub use types::{
    BatchPhase, BatchResult, CandidateSource, CandidateWindow, GroupingCallbacks, NoopCallbacks,
};
