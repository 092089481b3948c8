//! Point and box prompts issued on a reference frame.

use std::fmt::Display;

use crate::{PipelineError, Resolution};

/// Whether a point marks the object or the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Include,
    Exclude,
}

/// Axis-aligned rectangle in pixel coordinates, `x0 <= x1`, `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    /// Builds a rectangle from any two opposite corners.
    pub fn from_corners(ax: f32, ay: f32, bx: f32, by: f32) -> Self {
        Self {
            x0: ax.min(bx),
            y0: ay.min(by),
            x1: ax.max(bx),
            y1: ay.max(by),
        }
    }

    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::from_corners(x, y, x + width, y + height)
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    /// Integer pixel span covered by the rectangle, clamped to the frame.
    pub fn pixel_bounds(&self, resolution: Resolution) -> (u32, u32, u32, u32) {
        let clamp_x = |v: f32| (v.max(0.0) as u32).min(resolution.width);
        let clamp_y = |v: f32| (v.max(0.0) as u32).min(resolution.height);
        (
            clamp_x(self.x0.floor()),
            clamp_y(self.y0.floor()),
            clamp_x(self.x1.ceil()),
            clamp_y(self.y1.ceil()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PromptKind {
    Point { x: f32, y: f32, polarity: Polarity },
    Box(Rect),
}

/// A user hint tagged with the frame it was issued on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prompt {
    pub frame_index: usize,
    pub kind: PromptKind,
}

impl Prompt {
    pub fn point(frame_index: usize, x: f32, y: f32, polarity: Polarity) -> Self {
        Self {
            frame_index,
            kind: PromptKind::Point { x, y, polarity },
        }
    }

    pub fn rect(frame_index: usize, rect: Rect) -> Self {
        Self {
            frame_index,
            kind: PromptKind::Box(rect),
        }
    }

    /// Checks the prompt against the video's frame count and resolution.
    pub fn validate(&self, frame_count: usize, resolution: Resolution) -> Result<(), PipelineError> {
        if self.frame_index >= frame_count {
            return Err(PipelineError::InvalidPrompt(format!(
                "frame {} outside video of {frame_count} frames",
                self.frame_index
            )));
        }
        match self.kind {
            PromptKind::Point { x, y, .. } => {
                if !resolution.contains(x, y) {
                    return Err(PipelineError::InvalidPrompt(format!(
                        "point ({x}, {y}) outside {resolution} frame"
                    )));
                }
            }
            PromptKind::Box(rect) => {
                let inside = rect.x0 >= 0.0
                    && rect.y0 >= 0.0
                    && rect.x1 <= resolution.width as f32
                    && rect.y1 <= resolution.height as f32;
                if !inside || !rect.x0.is_finite() || !rect.y0.is_finite() {
                    return Err(PipelineError::InvalidPrompt(format!(
                        "box {self} outside {resolution} frame"
                    )));
                }
                if rect.width() <= 0.0 || rect.height() <= 0.0 {
                    return Err(PipelineError::InvalidPrompt(format!(
                        "box {self} has no area"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Display for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            PromptKind::Point { x, y, polarity } => {
                let sign = match polarity {
                    Polarity::Include => '+',
                    Polarity::Exclude => '-',
                };
                write!(f, "{sign}({x}, {y})@{}", self.frame_index)
            }
            PromptKind::Box(r) => write!(
                f,
                "[({}, {})-({}, {})]@{}",
                r.x0, r.y0, r.x1, r.y1, self.frame_index
            ),
        }
    }
}
