pub mod client;
pub mod reconcile;
pub mod replicaset;
pub mod status;
pub mod validation;

pub use client::*;
pub use reconcile::*;
pub use replicaset::*;
pub use status::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "experiment_test.rs"]
mod tests;
