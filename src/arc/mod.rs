//! Adaptive resource controller (ARC) components.

pub mod coordinator;
pub mod estimator;
pub mod policy;
pub mod telemetry;
