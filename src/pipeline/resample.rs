//! Frame and mask resizing between native and inference resolution.

use image::{GrayImage, RgbImage, imageops::FilterType};

use crate::{Frame, MaskFrame, PipelineError, Resolution, config::ResampleFilter};

/// Resizes a color frame. Identical resolutions return the frame unchanged.
pub fn resize_frame(
    frame: &Frame,
    target: Resolution,
    filter: ResampleFilter,
) -> Result<Frame, PipelineError> {
    if frame.resolution() == target {
        return Ok(frame.clone());
    }
    let data = resize_samples(frame.data(), frame.resolution(), Frame::CHANNELS, target, filter)?;
    Frame::from_rgb(frame.index(), target, data)
}

/// Resizes a mask. Nearest keeps hard edges, other kernels produce soft coverage.
pub fn resize_mask(
    mask: &MaskFrame,
    target: Resolution,
    filter: ResampleFilter,
) -> Result<MaskFrame, PipelineError> {
    if mask.resolution() == target {
        return Ok(mask.clone());
    }
    let data = resize_samples(mask.coverage(), mask.resolution(), 1, target, filter)?;
    MaskFrame::from_coverage(mask.index(), target, data)
}

fn resize_samples(
    samples: &[u8],
    source: Resolution,
    channels: usize,
    target: Resolution,
    filter: ResampleFilter,
) -> Result<Vec<u8>, PipelineError> {
    if target.pixels() == 0 {
        return Err(PipelineError::Config(format!(
            "cannot resample to {target}"
        )));
    }
    let upscaling = target.width > source.width || target.height > source.height;
    let kernel = match filter {
        ResampleFilter::Area if !upscaling => {
            return Ok(area_resize(samples, source, channels, target));
        }
        ResampleFilter::Area | ResampleFilter::Bilinear => FilterType::Triangle,
        ResampleFilter::Nearest => FilterType::Nearest,
        ResampleFilter::Lanczos => FilterType::Lanczos3,
    };

    let malformed = || PipelineError::Mismatch(format!("buffer does not match {source}"));
    match channels {
        1 => {
            let image = GrayImage::from_raw(source.width, source.height, samples.to_vec())
                .ok_or_else(malformed)?;
            Ok(image::imageops::resize(&image, target.width, target.height, kernel).into_raw())
        }
        3 => {
            let image = RgbImage::from_raw(source.width, source.height, samples.to_vec())
                .ok_or_else(malformed)?;
            Ok(image::imageops::resize(&image, target.width, target.height, kernel).into_raw())
        }
        other => Err(PipelineError::Mismatch(format!(
            "unsupported channel count {other}"
        ))),
    }
}

/// Source taps and weights covering each destination coordinate along one axis.
fn area_taps(source: u32, target: u32) -> Vec<Vec<(usize, f32)>> {
    let scale = source as f64 / target as f64;
    (0..target)
        .map(|d| {
            let lo = d as f64 * scale;
            let hi = (d as f64 + 1.0) * scale;
            let mut taps = Vec::new();
            let mut s = lo.floor() as usize;
            while (s as f64) < hi && s < source as usize {
                let overlap = (hi.min(s as f64 + 1.0) - lo.max(s as f64)) as f32;
                if overlap > 0.0 {
                    taps.push((s, overlap / scale as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Box-averages every destination pixel over the source area it covers.
fn area_resize(samples: &[u8], source: Resolution, channels: usize, target: Resolution) -> Vec<u8> {
    let horizontal = area_taps(source.width, target.width);
    let vertical = area_taps(source.height, target.height);
    let src_w = source.width as usize;
    let dst_w = target.width as usize;

    let mut rows = vec![0f32; source.height as usize * dst_w * channels];
    for y in 0..source.height as usize {
        for (dx, taps) in horizontal.iter().enumerate() {
            for c in 0..channels {
                rows[(y * dst_w + dx) * channels + c] = taps
                    .iter()
                    .map(|&(sx, w)| samples[(y * src_w + sx) * channels + c] as f32 * w)
                    .sum();
            }
        }
    }

    let mut out = vec![0u8; target.pixels() * channels];
    for (dy, taps) in vertical.iter().enumerate() {
        for dx in 0..dst_w {
            for c in 0..channels {
                let value: f32 = taps
                    .iter()
                    .map(|&(sy, w)| rows[(sy * dst_w + dx) * channels + c] * w)
                    .sum();
                out[(dy * dst_w + dx) * channels + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}
