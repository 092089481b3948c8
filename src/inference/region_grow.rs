//! Color region-growing segmenter with static propagation.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::{
    Frame, MaskFrame, Resolution,
    mask::prompt::{Polarity, Prompt, PromptKind},
};

use super::{InferenceFault, Segmenter};

/// Boxes select their area, include points grow a color-similar region from the
/// seed, exclude points carve their grown region back out.
#[derive(Debug, Clone)]
pub struct RegionGrowSegmenter {
    tolerance: u8,
}

impl RegionGrowSegmenter {
    pub fn new(tolerance: u8) -> Self {
        Self { tolerance }
    }

    fn grow(&self, frame: &Frame, x: f32, y: f32) -> Vec<bool> {
        let resolution = frame.resolution();
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        let mut region = vec![false; resolution.pixels()];
        if !resolution.contains(x, y) {
            return region;
        }
        let seed_x = x as usize;
        let seed_y = y as usize;
        let seed = frame.pixel(seed_x as u32, seed_y as u32);
        let similar = |px: [u8; 3]| {
            px.iter()
                .zip(seed.iter())
                .all(|(a, b)| a.abs_diff(*b) <= self.tolerance)
        };

        let mut queue = VecDeque::from([(seed_x, seed_y)]);
        region[seed_y * width + seed_x] = true;
        while let Some((cx, cy)) = queue.pop_front() {
            let neighbours = [
                (cx.wrapping_sub(1), cy),
                (cx + 1, cy),
                (cx, cy.wrapping_sub(1)),
                (cx, cy + 1),
            ];
            for (nx, ny) in neighbours {
                if nx >= width || ny >= height {
                    continue;
                }
                let i = ny * width + nx;
                if !region[i] && similar(frame.pixel(nx as u32, ny as u32)) {
                    region[i] = true;
                    queue.push_back((nx, ny));
                }
            }
        }
        region
    }
}

fn fill_rect(selected: &mut [bool], resolution: Resolution, bounds: (u32, u32, u32, u32)) {
    let (x0, y0, x1, y1) = bounds;
    let width = resolution.width as usize;
    for y in y0..y1 {
        let row = y as usize * width;
        selected[row + x0 as usize..row + x1 as usize].fill(true);
    }
}

#[async_trait]
impl Segmenter for RegionGrowSegmenter {
    async fn segment(
        &self,
        reference: &Frame,
        prompts: &[Prompt],
    ) -> Result<MaskFrame, InferenceFault> {
        let resolution = reference.resolution();
        let mut selected = vec![false; resolution.pixels()];
        let mut carved = vec![false; resolution.pixels()];

        for prompt in prompts {
            match prompt.kind {
                PromptKind::Box(rect) => {
                    fill_rect(&mut selected, resolution, rect.pixel_bounds(resolution));
                }
                PromptKind::Point { x, y, polarity } => {
                    let region = self.grow(reference, x, y);
                    let target = match polarity {
                        Polarity::Include => &mut selected,
                        Polarity::Exclude => &mut carved,
                    };
                    for (dst, hit) in target.iter_mut().zip(region) {
                        *dst |= hit;
                    }
                }
            }
        }

        let coverage = selected
            .iter()
            .zip(&carved)
            .map(|(&s, &c)| if s && !c { MaskFrame::FULL } else { 0 })
            .collect();
        MaskFrame::from_coverage(reference.index(), resolution, coverage)
            .map_err(|err| InferenceFault::model(err.to_string()))
    }

    /// The scene is assumed static: every frame receives the reference mask.
    async fn propagate(
        &self,
        mask: &MaskFrame,
        _reference_index: usize,
        frames: &[Frame],
    ) -> Result<Vec<MaskFrame>, InferenceFault> {
        Ok(frames
            .iter()
            .map(|frame| mask.with_index(frame.index()))
            .collect())
    }
}
