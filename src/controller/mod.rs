pub mod analysis;
pub mod clock;
pub mod condition;
pub mod driver;
pub mod orchestrator;
pub mod prometheus;
pub mod release;
pub mod signature;
pub mod strategies;

pub use driver::{DriverContext, ReconcileTrigger};
pub use orchestrator::{ReleaseOrchestrator, StartRequest};
pub use release::{reconcile_once, Context, ReconcileError, ReleaseKey, TickResult};
