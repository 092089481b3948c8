//! Compositing inpainted pixels back into the original frames.

use image::GrayImage;
use imageproc::filter::box_filter;
use tracing::instrument;

use crate::{Frame, MaskFrame, PipelineError, Resolution, config::CompositeConfig};

use super::blend::BlendedSequence;

/// Selects inpainted pixels where the mask asks for removal and original pixels
/// elsewhere, feathering the mask edge.
#[derive(Debug, Clone, Default)]
pub struct Compositor {
    feather_px: u32,
}

impl Compositor {
    pub fn new(config: &CompositeConfig) -> Self {
        Self {
            feather_px: config.feather_px,
        }
    }

    #[instrument(skip_all, fields(frames = originals.len(), feather = self.feather_px))]
    pub fn composite(
        &self,
        originals: &[Frame],
        inpainted: &BlendedSequence,
        masks: &[MaskFrame],
    ) -> Result<Vec<Frame>, PipelineError> {
        if originals.len() != inpainted.len() || originals.len() != masks.len() {
            return Err(PipelineError::Mismatch(format!(
                "compositing {} originals with {} inpainted frames and {} masks",
                originals.len(),
                inpainted.len(),
                masks.len()
            )));
        }
        originals
            .iter()
            .zip(inpainted.frames())
            .zip(masks)
            .map(|((original, filled), mask)| self.composite_frame(original, filled, mask))
            .collect()
    }

    pub fn composite_frame(
        &self,
        original: &Frame,
        filled: &Frame,
        mask: &MaskFrame,
    ) -> Result<Frame, PipelineError> {
        let resolution = original.resolution();
        if filled.resolution() != resolution || mask.resolution() != resolution {
            return Err(PipelineError::Mismatch(format!(
                "frame {}: original {resolution}, inpainted {}, mask {}",
                original.index(),
                filled.resolution(),
                mask.resolution()
            )));
        }
        if mask.is_empty() {
            return Ok(original.clone());
        }

        let alpha = feather(mask.coverage(), resolution, self.feather_px);
        let data: Vec<u8> = original
            .data()
            .chunks_exact(Frame::CHANNELS)
            .zip(filled.data().chunks_exact(Frame::CHANNELS))
            .zip(alpha)
            .flat_map(|((o, i), a)| {
                let a = a as u32;
                let mix = |o: u8, i: u8| ((o as u32 * (255 - a) + i as u32 * a + 127) / 255) as u8;
                [mix(o[0], i[0]), mix(o[1], i[1]), mix(o[2], i[2])]
            })
            .collect();
        Frame::from_rgb(original.index(), resolution, data)
    }
}

/// Box blur of the coverage with the given radius; edges repeat the border pixel.
fn feather(coverage: &[u8], resolution: Resolution, radius: u32) -> Vec<u8> {
    if radius == 0 {
        return coverage.to_vec();
    }
    match GrayImage::from_raw(resolution.width, resolution.height, coverage.to_vec()) {
        Some(image) => box_filter(&image, radius, radius).into_raw(),
        None => coverage.to_vec(),
    }
}
