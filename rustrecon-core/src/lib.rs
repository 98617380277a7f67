pub mod backoff;
pub mod config;
pub mod error;
pub mod guard;
pub mod orchestrator;
pub mod registry;
pub mod requirement;
pub mod scheduler;
pub mod trigger;

pub use backoff::{RetryPolicy, retry_delay};
pub use config::OrchestratorConfig;
pub use error::{ActionError, ConditionError, OrchestratorError};
pub use guard::{FlightGuard, SingleFlight};
pub use orchestrator::{Orchestrator, OrchestratorEvent};
pub use registry::{ActionContext, ActionHandler, ActionOutcome, ActionRegistry, DryRunHandler};
pub use requirement::Requirement;
pub use scheduler::{Scheduler, TickReport};
pub use trigger::{EvalTarget, Trigger};

// Re-export so callers don't need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
