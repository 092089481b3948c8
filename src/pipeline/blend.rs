//! Overlap blending of chunk results into one continuous sequence.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::{
    Frame, MaskFrame, PipelineError,
    config::{BlendConfig, BlendCurve},
};

use super::inpaint::ChunkResult;

/// Final seam-free sequence, one frame per index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlendedSequence {
    frames: Arc<[Frame]>,
}

impl BlendedSequence {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Crossfades consecutive chunk results over their shared frames.
#[derive(Debug, Clone, Default)]
pub struct OverlapBlender {
    curve: BlendCurve,
    masked_only: bool,
}

impl OverlapBlender {
    pub fn new(config: &BlendConfig) -> Self {
        Self {
            curve: config.curve,
            masked_only: config.masked_only,
        }
    }

    /// Weight of the earlier chunk at `position` inside an overlap of `width` frames.
    ///
    /// The weight is exactly 1 on the first overlap frame, exactly 0 on the last,
    /// and monotonically decreasing in between. A single-frame overlap is an even mix.
    pub fn weight(&self, position: usize, width: usize) -> f32 {
        match width {
            0 => 1.0,
            1 => 0.5,
            _ => {
                let ramp = 1.0 - position.min(width - 1) as f32 / (width - 1) as f32;
                self.curve.apply(ramp)
            }
        }
    }

    /// Blends results covering `[0, total)`. Results may arrive in any order.
    pub fn blend(
        &self,
        results: Vec<ChunkResult>,
        total: usize,
    ) -> Result<BlendedSequence, PipelineError> {
        self.blend_inner(results, total, None)
    }

    /// Like [`OverlapBlender::blend`], but pixels outside the mask take the
    /// untouched original when blending is restricted to masked pixels.
    pub fn blend_with_originals(
        &self,
        results: Vec<ChunkResult>,
        originals: &[Frame],
        masks: &[MaskFrame],
    ) -> Result<BlendedSequence, PipelineError> {
        if originals.len() != masks.len() {
            return Err(PipelineError::Mismatch(format!(
                "{} masks for {} original frames",
                masks.len(),
                originals.len()
            )));
        }
        self.blend_inner(results, originals.len(), Some((originals, masks)))
    }

    #[instrument(skip_all, fields(chunks = results.len(), total))]
    fn blend_inner(
        &self,
        mut results: Vec<ChunkResult>,
        total: usize,
        fallback: Option<(&[Frame], &[MaskFrame])>,
    ) -> Result<BlendedSequence, PipelineError> {
        results.sort_by_key(|result| result.chunk.start());
        check_coverage(&results, total)?;

        // Chunks fold in start order. Each overlap crossfades the sequence
        // accumulated so far into the next chunk, so a frame shared by three or
        // more chunks (overlap wider than half a chunk) is blended once per seam.
        let mut output: Vec<Frame> = Vec::with_capacity(total);
        for current in &results {
            let seam_end = output.len();
            let width = seam_end.saturating_sub(current.chunk.start());
            for index in current.chunk.start()..seam_end {
                let weight = self.weight(index - current.chunk.start(), width);
                let later = frame_at(current, index)?;
                let fallback = match fallback {
                    Some((originals, masks)) if self.masked_only => {
                        Some((&originals[index], &masks[index]))
                    }
                    _ => None,
                };
                let blended = crossfade(&output[index], later, weight, fallback, index)?;
                output[index] = blended;
            }
            if width > 0 {
                debug!(
                    target = "pipeline",
                    overlap_start = current.chunk.start(),
                    overlap_end = seam_end,
                    "overlap blended"
                );
            }
            for index in seam_end..current.chunk.end() {
                output.push(frame_at(current, index)?.with_index(index));
            }
        }

        if output.len() != total {
            return Err(PipelineError::Blend(format!(
                "produced {} frames for a range of {total}",
                output.len()
            )));
        }
        Ok(BlendedSequence {
            frames: output.into(),
        })
    }
}

fn frame_at(result: &ChunkResult, index: usize) -> Result<&Frame, PipelineError> {
    result.frame(index).ok_or_else(|| {
        PipelineError::Blend(format!(
            "{} has no frame {index}",
            result.chunk
        ))
    })
}

/// Verifies that sorted results tile `[0, total)` with consistent overlaps.
fn check_coverage(results: &[ChunkResult], total: usize) -> Result<(), PipelineError> {
    let Some(first) = results.first() else {
        if total == 0 {
            return Ok(());
        }
        return Err(PipelineError::Blend(format!(
            "no chunk results for {total} frames"
        )));
    };
    if first.chunk.start() != 0 || first.chunk.lead_overlap != 0 {
        return Err(PipelineError::Blend(format!(
            "first result {} does not start the range",
            first.chunk
        )));
    }
    for result in results {
        if result.frames().len() != result.chunk.len() {
            return Err(PipelineError::Blend(format!(
                "{} carries {} frames",
                result.chunk,
                result.frames().len()
            )));
        }
    }
    for pair in results.windows(2) {
        let (previous, next) = (&pair[0].chunk, &pair[1].chunk);
        if next.start() > previous.end() {
            return Err(PipelineError::Blend(format!(
                "gap between {previous} and {next}"
            )));
        }
        if next.end() <= previous.end() || next.start() <= previous.start() {
            return Err(PipelineError::Blend(format!(
                "{next} duplicates frames of {previous}"
            )));
        }
        if previous.end() - next.start() != next.lead_overlap {
            return Err(PipelineError::Blend(format!(
                "{next} declares overlap {} but shares {} frames with {previous}",
                next.lead_overlap,
                previous.end() - next.start()
            )));
        }
    }
    let last = &results[results.len() - 1].chunk;
    if last.end() != total {
        return Err(PipelineError::Blend(format!(
            "results end at {} but the range has {total} frames",
            last.end()
        )));
    }
    Ok(())
}

/// Mixes two candidates with `weight` favoring `earlier`.
fn crossfade(
    earlier: &Frame,
    later: &Frame,
    weight: f32,
    fallback: Option<(&Frame, &MaskFrame)>,
    index: usize,
) -> Result<Frame, PipelineError> {
    if earlier.resolution() != later.resolution() {
        return Err(PipelineError::Blend(format!(
            "frame {index}: cannot blend {} with {}",
            earlier.resolution(),
            later.resolution()
        )));
    }
    if let Some((original, mask)) = fallback {
        if original.resolution() != earlier.resolution()
            || mask.resolution() != earlier.resolution()
        {
            return Err(PipelineError::Mismatch(format!(
                "frame {index}: original or mask differs from {}",
                earlier.resolution()
            )));
        }
    }

    let mix = |a: u8, b: u8| (a as f32 * weight + b as f32 * (1.0 - weight)).round() as u8;
    let data: Vec<u8> = match fallback {
        None => earlier
            .data()
            .iter()
            .zip(later.data())
            .map(|(&a, &b)| mix(a, b))
            .collect(),
        Some((original, mask)) => earlier
            .data()
            .chunks_exact(Frame::CHANNELS)
            .zip(later.data().chunks_exact(Frame::CHANNELS))
            .zip(original.data().chunks_exact(Frame::CHANNELS))
            .zip(mask.coverage())
            .flat_map(|(((a, b), o), &coverage)| {
                let px: [u8; 3] = if coverage == 0 {
                    [o[0], o[1], o[2]]
                } else {
                    [mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2])]
                };
                px
            })
            .collect(),
    };
    Frame::from_rgb(index, earlier.resolution(), data)
}
