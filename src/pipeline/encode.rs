//! Frame sinks persisting the composited sequence.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::{Frame, PipelineError};

/// Writes a finished sequence in one pass.
pub trait FrameSink: Send {
    fn write(&mut self, frames: &[Frame], fps: f64) -> Result<(), PipelineError>;

    fn path(&self) -> &Path;
}

const CONTAINER_EXTENSIONS: [&str; 5] = ["mkv", "mp4", "mov", "avi", "webm"];

/// Picks a sink from the output path: container extensions go through ffmpeg,
/// anything else is treated as a directory of PNG frames.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn open_sink(path: &Path) -> Result<Box<dyn FrameSink>, PipelineError> {
    let is_container = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CONTAINER_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
    if is_container {
        open_container(path)
    } else {
        Ok(Box::new(ImageSequenceSink::new(path)))
    }
}

#[cfg(feature = "ffmpeg")]
fn open_container(path: &Path) -> Result<Box<dyn FrameSink>, PipelineError> {
    Ok(Box::new(ffmpeg_sink::Ffv1Sink::new(path)))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_container(path: &Path) -> Result<Box<dyn FrameSink>, PipelineError> {
    Err(PipelineError::Io(format!(
        "{}: writing video containers needs the `ffmpeg` feature; pass an output directory instead",
        path.display()
    )))
}

/// Lossless PNG per frame, named `frame_000000.png` onwards.
#[derive(Debug, Clone)]
pub struct ImageSequenceSink {
    dir: PathBuf,
}

impl ImageSequenceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn frame_path(&self, position: usize) -> PathBuf {
        self.dir.join(format!("frame_{position:06}.png"))
    }
}

impl FrameSink for ImageSequenceSink {
    fn write(&mut self, frames: &[Frame], _fps: f64) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|err| PipelineError::Io(format!("{}: {err}", self.dir.display())))?;
        for (position, frame) in frames.iter().enumerate() {
            let path = self.frame_path(position);
            image::save_buffer(
                &path,
                frame.data(),
                frame.width(),
                frame.height(),
                image::ExtendedColorType::Rgb8,
            )?;
        }
        debug!(target = "encode", frames = frames.len(), dir = %self.dir.display(), "image sequence written");
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.dir
    }
}

#[cfg(feature = "ffmpeg")]
mod ffmpeg_sink {
    use std::path::{Path, PathBuf};

    use ffmpeg::software::scaling::{context::Context as Scaler, flag::Flags};
    use ffmpeg::util::{format::pixel::Pixel, frame::video::Video};
    use ffmpeg_next as ffmpeg;
    use tracing::debug;

    use super::FrameSink;
    use crate::{Frame, PipelineError};

    /// Lossless FFV1 video in whatever container the extension names.
    pub struct Ffv1Sink {
        path: PathBuf,
    }

    impl Ffv1Sink {
        pub fn new(path: &Path) -> Self {
            Self {
                path: path.to_path_buf(),
            }
        }
    }

    impl FrameSink for Ffv1Sink {
        fn write(&mut self, frames: &[Frame], fps: f64) -> Result<(), PipelineError> {
            let Some(first) = frames.first() else {
                return Err(encode_error("nothing to write".to_string()));
            };
            let (width, height) = (first.width(), first.height());
            ffmpeg::init().map_err(|err| encode_error(format!("ffmpeg init failed: {err}")))?;

            let mut output = ffmpeg::format::output(&self.path)
                .map_err(|err| encode_error(format!("{}: {err}", self.path.display())))?;
            let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::FFV1)
                .ok_or_else(|| encode_error("FFV1 encoder unavailable".to_string()))?;
            let global_header = output
                .format()
                .flags()
                .contains(ffmpeg::format::Flags::GLOBAL_HEADER);
            let stream_index = output
                .add_stream(codec)
                .map_err(|err| encode_error(format!("add stream: {err}")))?
                .index();

            let millis = (fps * 1000.0).round().max(1.0) as i32;
            let time_base = ffmpeg::Rational::new(1000, millis);
            let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()
                .map_err(|err| encode_error(format!("video encoder: {err}")))?;
            encoder.set_width(width);
            encoder.set_height(height);
            encoder.set_format(Pixel::YUV444P);
            encoder.set_time_base(time_base);
            encoder.set_frame_rate(Some(ffmpeg::Rational::new(millis, 1000)));
            if global_header {
                encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
            }
            let mut encoder = encoder
                .open_as(codec)
                .map_err(|err| encode_error(format!("open encoder: {err}")))?;
            if let Some(mut stream) = output.stream_mut(stream_index) {
                stream.set_parameters(&encoder);
                stream.set_time_base(time_base);
            }
            output
                .write_header()
                .map_err(|err| encode_error(format!("write header: {err}")))?;
            let stream_time_base = output
                .stream(stream_index)
                .map(|stream| stream.time_base())
                .ok_or_else(|| encode_error("output stream vanished".to_string()))?;

            let mut scaler = Scaler::get(
                Pixel::RGB24,
                width,
                height,
                Pixel::YUV444P,
                width,
                height,
                Flags::BILINEAR,
            )
            .map_err(|err| encode_error(format!("scaler init failed: {err}")))?;

            let mut rgb = Video::new(Pixel::RGB24, width, height);
            let mut yuv = Video::empty();
            for (position, frame) in frames.iter().enumerate() {
                if frame.resolution() != first.resolution() {
                    return Err(PipelineError::Mismatch(format!(
                        "frame {position} is {}, stream is {}",
                        frame.resolution(),
                        first.resolution()
                    )));
                }
                let stride = rgb.stride(0);
                let row = width as usize * Frame::CHANNELS;
                let plane = rgb.data_mut(0);
                for (y, line) in frame.data().chunks_exact(row).enumerate() {
                    plane[y * stride..y * stride + row].copy_from_slice(line);
                }
                scaler
                    .run(&rgb, &mut yuv)
                    .map_err(|err| encode_error(format!("scale frame: {err}")))?;
                yuv.set_pts(Some(position as i64));
                encoder
                    .send_frame(&yuv)
                    .map_err(|err| encode_error(format!("send frame: {err}")))?;
                drain_packets(&mut encoder, &mut output, stream_index, time_base, stream_time_base)?;
            }
            encoder
                .send_eof()
                .map_err(|err| encode_error(format!("send eof: {err}")))?;
            drain_packets(&mut encoder, &mut output, stream_index, time_base, stream_time_base)?;
            output
                .write_trailer()
                .map_err(|err| encode_error(format!("write trailer: {err}")))?;
            debug!(target = "encode", frames = frames.len(), path = %self.path.display(), "ffv1 stream written");
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn drain_packets(
        encoder: &mut ffmpeg::encoder::Video,
        output: &mut ffmpeg::format::context::Output,
        stream_index: usize,
        time_base: ffmpeg::Rational,
        stream_time_base: ffmpeg::Rational,
    ) -> Result<(), PipelineError> {
        let mut packet = ffmpeg::Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(stream_index);
            packet.rescale_ts(time_base, stream_time_base);
            packet
                .write_interleaved(output)
                .map_err(|err| encode_error(format!("write packet: {err}")))?;
        }
        Ok(())
    }

    fn encode_error(message: String) -> PipelineError {
        PipelineError::Io(format!("encode: {message}"))
    }
}
