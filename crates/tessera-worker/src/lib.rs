//! Worker process lifecycle: certificate first, then the controller
//! session, then business logic, and a bounded shutdown at the end.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod logic;
pub mod shutdown;

pub use config::WorkerConfig;
pub use coordinator::WorkerLifecycleCoordinator;
pub use error::WorkerError;
pub use logic::{NoopLogic, WorkerContext, WorkerLogic};
pub use shutdown::{
    ShutdownError, ShutdownHandler, ShutdownReport, ShutdownTask, TaskError, TaskOutcome,
    TaskReport,
};
