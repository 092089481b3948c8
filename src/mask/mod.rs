//! Mask authoring: prompts, the interactive session, annotation documents and
//! mask-video preparation.

pub mod annotations;
pub mod prompt;
pub mod session;

use crate::{Frame, MaskFrame, PipelineError, config::IoConfig};

pub use annotations::AnnotationDocument;
pub use prompt::{Polarity, Prompt, PromptKind, Rect};
pub use session::{MaskSession, SessionState};

/// Converts decoded mask-video frames into masks using their luma.
///
/// Coverage is thresholded at `io.mask_threshold` unless soft masks are
/// requested, then grown by `io.mask_dilation` pixels.
pub fn masks_from_frames(frames: &[Frame], io: &IoConfig) -> Result<Vec<MaskFrame>, PipelineError> {
    frames
        .iter()
        .map(|frame| {
            let coverage: Vec<u8> = frame
                .data()
                .chunks_exact(Frame::CHANNELS)
                .map(|px| {
                    let luma =
                        0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                    luma.round().clamp(0.0, 255.0) as u8
                })
                .collect();
            let mask = MaskFrame::from_coverage(frame.index(), frame.resolution(), coverage)?;
            Ok(prepare_mask(mask, io))
        })
        .collect()
}

/// Renders masks as gray frames, white where selected, for a frame sink.
pub fn frames_from_masks(masks: &[MaskFrame]) -> Result<Vec<Frame>, PipelineError> {
    masks
        .iter()
        .map(|mask| {
            let data = mask
                .coverage()
                .iter()
                .flat_map(|&value| [value; Frame::CHANNELS])
                .collect();
            Frame::from_rgb(mask.index(), mask.resolution(), data)
        })
        .collect()
}

/// Applies thresholding and dilation to one mask.
pub fn prepare_mask(mask: MaskFrame, io: &IoConfig) -> MaskFrame {
    let mask = if io.soft_mask {
        mask
    } else {
        mask.binarized(io.mask_threshold)
    };
    mask.dilated(io.mask_dilation)
}

/// Checks the 1:1 pairing between frames and masks.
pub fn check_alignment(frames: &[Frame], masks: &[MaskFrame]) -> Result<(), PipelineError> {
    if frames.len() != masks.len() {
        return Err(PipelineError::Mismatch(format!(
            "{} masks for {} frames",
            masks.len(),
            frames.len()
        )));
    }
    for (position, (frame, mask)) in frames.iter().zip(masks).enumerate() {
        if frame.resolution() != mask.resolution() {
            return Err(PipelineError::Mismatch(format!(
                "mask {position} is {}, frame is {}",
                mask.resolution(),
                frame.resolution()
            )));
        }
    }
    Ok(())
}
