pub mod client;
pub mod clock;
pub mod events;
pub mod experiment;
pub mod field;
pub mod notifications;
pub mod references;

pub use experiment::{error_policy, reconcile, Context, ExperimentController, ReconcileError};
