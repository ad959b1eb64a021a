pub mod analysis;
pub mod experiment;
pub mod rollout;
