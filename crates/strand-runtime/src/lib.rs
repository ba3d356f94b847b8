//! Strand runtime: lease guard, scheduler, dispatcher, worker pool with a
//! stuck-step watchdog, status queries and environment configuration on top
//! of `strand-kernel`.

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod lease;
pub mod pool;
pub mod scheduler;
pub mod status;
pub mod watchdog;

pub use config::{ConfigError, RuntimeConfig};
pub use control::ControlPlane;
pub use dispatcher::{Dispatcher, DispatcherConfig, PollReport, RunReport, StepReport};
pub use lease::{LeaseConfig, WorkerLease};
pub use pool::{PoolError, WorkerPool};
pub use scheduler::StrandScheduler;
pub use status::{StatusQuery, StrandStatus};
pub use watchdog::{StepWatch, StuckStep, WatchdogAction};
