//! ARC coordinator bounding concurrent inference calls per accelerator.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

use crate::{FrameRange, PipelineError, Resolution, config::InferenceConfig};

use super::{
    estimator::{ResourceEstimate, ResourceEstimator},
    policy,
    telemetry::TelemetrySink,
};

/// Coordinator wiring together telemetry, estimation, and slot admission.
#[derive(Clone)]
pub struct ArcCoordinator {
    telemetry: TelemetrySink,
    config: InferenceConfig,
    estimator: ResourceEstimator,
    slots: usize,
    semaphore: Arc<Semaphore>,
}

impl ArcCoordinator {
    pub fn new(telemetry: TelemetrySink, config: InferenceConfig) -> Self {
        let slots = config.inference_slots();
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
            slots,
            telemetry,
            config,
            estimator: ResourceEstimator::default(),
        }
    }

    pub fn telemetry(&self) -> TelemetrySink {
        self.telemetry.clone()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn active_jobs(&self) -> usize {
        self.slots - self.semaphore.available_permits()
    }

    /// Checks the memory budget, then waits for a free inference slot.
    #[instrument(skip_all, fields(range = %range, resolution = %resolution))]
    pub async fn acquire(
        &self,
        range: FrameRange,
        resolution: Resolution,
    ) -> Result<ArcPermit, PipelineError> {
        let estimate = self.estimator.estimate(range.len(), resolution);
        policy::enforce(policy::evaluate(&self.config, &estimate), range, &estimate)?;
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Io("inference slots closed".to_string()))?;
        debug!(
            target = "pipeline",
            memory_mb = estimate.memory_mb,
            active = self.active_jobs(),
            "inference slot acquired"
        );
        Ok(ArcPermit {
            _permit: permit,
            estimate,
        })
    }
}

/// Permit releasing its inference slot on drop.
pub struct ArcPermit {
    _permit: OwnedSemaphorePermit,
    estimate: ResourceEstimate,
}

impl ArcPermit {
    pub fn estimate(&self) -> &ResourceEstimate {
        &self.estimate
    }
}
