//! Steward coordination core
//!
//! The autonomous decision machinery of the Steward DAO platform: adaptive
//! confidence thresholds, multi-criteria evaluation, guarded action
//! execution under rate and spending limits, a governance loop with full
//! explanation trails, a self-improvement pipeline against the
//! source-of-truth repository, and an orchestrator owning the process-wide
//! operating mode. External collaborators (governance state, action sink,
//! repository, sandbox, resource probe, alerting) sit behind the traits in
//! [`ports`].

pub mod bus;
pub mod clock;
pub mod config;
pub mod confidence;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod explain;
pub mod governance;
pub mod health;
pub mod improvement;
pub mod memory;
pub mod orchestrator;
pub mod ports;
pub mod ratelimit;
pub mod types;

pub use bus::{Event, EventBus, EventJournal, Topic};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use confidence::ConfidenceManager;
pub use error::{CoreError, CoreResult};
pub use evaluator::Evaluator;
pub use executor::{ActionExecutor, SpendingLimits, SpendingPolicy};
pub use explain::ExplanationBuilder;
pub use governance::GovernanceLoop;
pub use health::{HealthMonitor, HealthSnapshot};
pub use improvement::{CandidateState, ImprovementCandidate, ImprovementEngine};
pub use memory::{MemoryConfig, MemoryStore};
pub use orchestrator::{ModeHandle, Orchestrator};
pub use ratelimit::{RateLimiter, RatePolicy};
pub use types::{
    ActionKind, ActionRequest, DecisionContext, DecisionLevel, Evaluation, Explanation,
    OperatingMode, Outcome, Risk,
};
