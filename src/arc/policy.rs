//! Policy evaluation helpers used by the ARC coordinator.

use crate::{FrameRange, InferenceKind, PipelineError, config::InferenceConfig};

use super::estimator::ResourceEstimate;

/// Result of a policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Evaluates the estimator output against the per-device memory budget.
pub fn evaluate(config: &InferenceConfig, estimate: &ResourceEstimate) -> PolicyDecision {
    if config.device_memory_mb <= 0.0 {
        return PolicyDecision::allow();
    }
    let budget = if config.partition_device_memory {
        let per_device = config.workers.div_ceil(config.devices.max(1)).max(1);
        config.device_memory_mb / per_device as f32
    } else {
        config.device_memory_mb
    };
    if estimate.memory_mb > budget {
        return PolicyDecision::deny(format!(
            "estimated {:.1} MiB for {} frames exceeds the {:.1} MiB device budget",
            estimate.memory_mb, estimate.frames, budget
        ));
    }
    PolicyDecision::allow()
}

/// Converts a denied decision into an out-of-memory error for the chunk.
pub fn enforce(
    decision: PolicyDecision,
    range: FrameRange,
    estimate: &ResourceEstimate,
) -> Result<(), PipelineError> {
    if decision.allowed {
        Ok(())
    } else {
        Err(PipelineError::Inference {
            range,
            resolution: Some(estimate.resolution),
            kind: InferenceKind::OutOfMemory,
            message: decision
                .reason
                .unwrap_or_else(|| "memory budget exceeded".to_string()),
        })
    }
}
