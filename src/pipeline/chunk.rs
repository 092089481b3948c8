//! Chunk planning over a frame range.

use std::fmt::Display;

use crate::{FrameRange, PipelineError};

/// One inference unit: a frame range plus the frames it shares with its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// Position in the plan.
    pub index: usize,
    pub range: FrameRange,
    /// Frames shared with the previous chunk.
    pub lead_overlap: usize,
    /// Frames shared with the next chunk.
    pub trail_overlap: usize,
}

impl Chunk {
    pub fn start(&self) -> usize {
        self.range.start
    }

    pub fn end(&self) -> usize {
        self.range.end
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Frames owned by this chunk alone once the lead overlap is excluded.
    pub fn core(&self) -> FrameRange {
        FrameRange::new(self.range.start + self.lead_overlap, self.range.end)
    }

    /// Region shared with the next chunk.
    pub fn trailing_overlap(&self) -> FrameRange {
        FrameRange::new(self.range.end - self.trail_overlap, self.range.end)
    }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk {} {}", self.index, self.range)
    }
}

/// Splits `[0, total)` into chunks of at most `chunk_len` frames, consecutive
/// chunks sharing exactly `overlap` frames.
///
/// A video that fits in one chunk yields a single chunk without overlap, and an
/// empty video yields an empty plan.
pub fn plan_chunks(
    total: usize,
    chunk_len: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, PipelineError> {
    if chunk_len == 0 {
        return Err(PipelineError::Config(
            "chunk length must be positive".to_string(),
        ));
    }
    if overlap >= chunk_len {
        return Err(PipelineError::Config(format!(
            "overlap {overlap} must be smaller than chunk length {chunk_len}"
        )));
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk_len).min(total);
        let lead_overlap = if chunks.is_empty() { 0 } else { overlap };
        if let Some(previous) = chunks.last_mut() {
            previous.trail_overlap = overlap;
        }
        chunks.push(Chunk {
            index: chunks.len(),
            range: FrameRange::new(start, end),
            lead_overlap,
            trail_overlap: 0,
        });
        if end == total {
            break;
        }
        start = end - overlap;
    }
    Ok(chunks)
}
