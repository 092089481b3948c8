//! Prompt annotation documents for non-interactive mask generation.
//!
//! The JSON layout is the one written by the annotation editor:
//!
//! ```json
//! { "video": "clip.mp4",
//!   "keyframes": [ { "frame_idx": 0,
//!                    "pos_clicks": [[0.5, 0.5]], "neg_clicks": [],
//!                    "rects": [[0.1, 0.1, 0.2, 0.3]] } ] }
//! ```
//!
//! Keyframes are addressed by `frame_idx` or by `t_ms`. Coordinates in `[0, 1]`
//! are normalised to the frame size, anything else is taken as pixels.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{PipelineError, Resolution};

use super::{
    prompt::{Polarity, Prompt, Rect},
    session::MaskSession,
};

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct AnnotationDocument {
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub keyframes: Vec<Keyframe>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct Keyframe {
    #[serde(default)]
    pub frame_idx: Option<usize>,
    #[serde(default)]
    pub t_ms: Option<u64>,
    #[serde(default)]
    pub pos_clicks: Vec<Click>,
    #[serde(default)]
    pub neg_clicks: Vec<Click>,
    #[serde(default)]
    pub rects: Vec<RectEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Click {
    Pair([f64; 2]),
    Object {
        x: f64,
        y: f64,
        #[serde(default)]
        obj: Option<u32>,
    },
}

impl Click {
    fn xy(&self) -> (f64, f64) {
        match *self {
            Click::Pair([x, y]) | Click::Object { x, y, .. } => (x, y),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RectEntry {
    Quad([f64; 4]),
    Object {
        x: f64,
        y: f64,
        w: f64,
        h: f64,
        #[serde(default)]
        obj: Option<u32>,
    },
}

impl RectEntry {
    fn xywh(&self) -> (f64, f64, f64, f64) {
        match *self {
            RectEntry::Quad([x, y, w, h]) | RectEntry::Object { x, y, w, h, .. } => (x, y, w, h),
        }
    }
}

fn is_normalized(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

fn to_px(v: f64, side: u32) -> f32 {
    if is_normalized(v) {
        (v * side as f64) as f32
    } else {
        v as f32
    }
}

/// Pixel coordinates for a click, clamped inside the frame so that a
/// normalised `1.0` lands on the last pixel.
fn click_to_px(click: &Click, resolution: Resolution) -> (f32, f32) {
    let (x, y) = click.xy();
    let clamp = |v: f32, side: u32| {
        if v >= side as f32 && v <= side as f32 + 0.5 {
            side as f32 - 0.5
        } else {
            v
        }
    };
    (
        clamp(to_px(x, resolution.width), resolution.width),
        clamp(to_px(y, resolution.height), resolution.height),
    )
}

fn rect_to_px(entry: &RectEntry, resolution: Resolution) -> Rect {
    let (x, y, w, h) = entry.xywh();
    let x1 = to_px(x, resolution.width);
    let y1 = to_px(y, resolution.height);
    let x2 = if is_normalized(w) {
        to_px(x + w, resolution.width)
    } else {
        x1 + w as f32
    };
    let y2 = if is_normalized(h) {
        to_px(y + h, resolution.height)
    } else {
        y1 + h as f32
    };
    Rect::from_corners(x1, y1, x2, y2)
}

impl AnnotationDocument {
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw)
            .map_err(|err| PipelineError::InvalidPrompt(format!("invalid annotations: {err}")))
    }

    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            PipelineError::Io(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Converts every keyframe into session-relative prompts.
    ///
    /// `frame_offset` is the absolute index of the session's first frame;
    /// keyframes before it are skipped.
    pub fn to_prompts(
        &self,
        resolution: Resolution,
        fps: f64,
        frame_offset: usize,
    ) -> Result<Vec<Prompt>, PipelineError> {
        let mut prompts = Vec::new();
        for keyframe in &self.keyframes {
            let absolute = match (keyframe.frame_idx, keyframe.t_ms) {
                (Some(index), _) => index,
                (None, Some(t_ms)) => (t_ms as f64 * fps / 1000.0).round() as usize,
                (None, None) => {
                    return Err(PipelineError::InvalidPrompt(
                        "keyframe needs frame_idx or t_ms".to_string(),
                    ));
                }
            };
            let Some(frame_index) = absolute.checked_sub(frame_offset) else {
                warn!(
                    target = "mask",
                    frame = absolute,
                    "keyframe precedes the processed window, skipping"
                );
                continue;
            };

            for click in &keyframe.pos_clicks {
                let (x, y) = click_to_px(click, resolution);
                prompts.push(Prompt::point(frame_index, x, y, Polarity::Include));
            }
            for click in &keyframe.neg_clicks {
                let (x, y) = click_to_px(click, resolution);
                prompts.push(Prompt::point(frame_index, x, y, Polarity::Exclude));
            }
            for entry in &keyframe.rects {
                prompts.push(Prompt::rect(frame_index, rect_to_px(entry, resolution)));
            }
        }
        Ok(prompts)
    }

    /// Adds all prompts to the session, returning how many were added. A single
    /// invalid prompt rejects the whole document and leaves the session as it was.
    pub fn apply(
        &self,
        session: &MaskSession,
        fps: f64,
        frame_offset: usize,
    ) -> Result<usize, PipelineError> {
        let prompts = self.to_prompts(session.resolution(), fps, frame_offset)?;
        session.add_all(&prompts)?;
        debug!(target = "mask", prompts = prompts.len(), "annotations applied");
        Ok(prompts.len())
    }
}
