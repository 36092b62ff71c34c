//! Local adapter implementations for the core's external interfaces
//!
//! These run the system end-to-end without external services: governance
//! state from a JSON file, an idempotent logging action sink, the
//! source-of-truth repository through the `git` CLI, sandboxes in
//! throwaway working copies, resources from `/proc`, and alerts through
//! structured logging. Transport failures are converted to core error
//! kinds here, at the boundary.

pub mod alert;
pub mod governance;
pub mod probe;
pub mod repo;
pub mod sandbox;
pub mod sink;

pub use alert::TracingAlerter;
pub use governance::FileGovernanceSource;
pub use probe::ProcResourceProbe;
pub use repo::GitSourceRepository;
pub use sandbox::ProcessSandboxRunner;
pub use sink::LoggingActionSink;
