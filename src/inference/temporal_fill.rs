//! CPU inpainter that borrows pixels across time before filling spatially.
//!
//! For each masked pixel the nearest frame in the sequence where the same
//! pixel is unmasked supplies the color. Pixels that are masked in every frame
//! are filled by peeling the hole inwards, averaging the already known
//! neighbours of each boundary pixel.

use async_trait::async_trait;

use crate::{Frame, MaskFrame, Resolution};

use super::{InferenceFault, Inpainter};

#[derive(Debug, Clone)]
pub struct TemporalFillInpainter {
    /// Farthest frame distance searched for an unmasked sample.
    pub search_radius: usize,
}

impl Default for TemporalFillInpainter {
    fn default() -> Self {
        Self { search_radius: 16 }
    }
}

#[async_trait]
impl Inpainter for TemporalFillInpainter {
    async fn inpaint(
        &self,
        frames: &[Frame],
        masks: &[MaskFrame],
    ) -> Result<Vec<Frame>, InferenceFault> {
        if frames.len() != masks.len() {
            return Err(InferenceFault::model(format!(
                "{} masks for {} frames",
                masks.len(),
                frames.len()
            )));
        }
        let frames = frames.to_vec();
        let masks = masks.to_vec();
        let radius = self.search_radius;
        tokio::task::spawn_blocking(move || fill_sequence(&frames, &masks, radius)).await?
    }
}

fn fill_sequence(
    frames: &[Frame],
    masks: &[MaskFrame],
    radius: usize,
) -> Result<Vec<Frame>, InferenceFault> {
    let Some(first) = frames.first() else {
        return Ok(Vec::new());
    };
    let resolution = first.resolution();
    if let Some(odd) = frames
        .iter()
        .map(Frame::resolution)
        .chain(masks.iter().map(MaskFrame::resolution))
        .find(|r| *r != resolution)
    {
        return Err(InferenceFault::model(format!(
            "mixed resolutions {resolution} and {odd} in one sequence"
        )));
    }

    let mut output = Vec::with_capacity(frames.len());
    for (position, (frame, mask)) in frames.iter().zip(masks).enumerate() {
        if mask.is_empty() {
            output.push(frame.clone());
            continue;
        }
        let mut pixels = frame.data().to_vec();
        let mut known: Vec<bool> = mask.coverage().iter().map(|&c| c == 0).collect();

        for (pixel, is_known) in known.iter_mut().enumerate() {
            if *is_known {
                continue;
            }
            if let Some(source) = nearest_unmasked(masks, position, pixel, radius) {
                let offset = pixel * Frame::CHANNELS;
                pixels[offset..offset + Frame::CHANNELS]
                    .copy_from_slice(&frames[source].data()[offset..offset + Frame::CHANNELS]);
                *is_known = true;
            }
        }

        diffuse_fill(&mut pixels, &mut known, resolution);
        let filled = Frame::from_rgb(frame.index(), resolution, pixels)
            .map_err(|err| InferenceFault::model(err.to_string()))?;
        output.push(filled);
    }
    Ok(output)
}

fn nearest_unmasked(
    masks: &[MaskFrame],
    position: usize,
    pixel: usize,
    radius: usize,
) -> Option<usize> {
    (1..=radius).find_map(|distance| {
        let before = position
            .checked_sub(distance)
            .filter(|&i| masks[i].coverage()[pixel] == 0);
        let after = Some(position + distance)
            .filter(|&i| i < masks.len() && masks[i].coverage()[pixel] == 0);
        before.or(after)
    })
}

/// Fills unknown pixels layer by layer from the hole boundary inwards.
fn diffuse_fill(pixels: &mut [u8], known: &mut [bool], resolution: Resolution) {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    if !known.iter().any(|&k| k) {
        return;
    }
    loop {
        let mut layer = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let i = y * width + x;
                if known[i] {
                    continue;
                }
                let mut sum = [0u32; 3];
                let mut count = 0u32;
                for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                        let n = ny * width + nx;
                        if known[n] {
                            let offset = n * Frame::CHANNELS;
                            for (channel, total) in sum.iter_mut().enumerate() {
                                *total += pixels[offset + channel] as u32;
                            }
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    layer.push((i, sum.map(|total| ((total + count / 2) / count) as u8)));
                }
            }
        }
        if layer.is_empty() {
            break;
        }
        for (i, color) in layer {
            pixels[i * Frame::CHANNELS..(i + 1) * Frame::CHANNELS].copy_from_slice(&color);
            known[i] = true;
        }
    }
}
