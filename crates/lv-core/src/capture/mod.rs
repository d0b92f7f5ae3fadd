//! Network capture around an analysis run.

pub mod filter;
pub mod session;

pub use filter::{CaptureFilter, Endpoint, FilterClause};
pub use session::{check_executable, CaptureOptions, CaptureSession, StopOutcome};
