//! Frame sources: numbered image directories and, with the `ffmpeg` feature,
//! video containers.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::{Frame, PipelineError, Resolution, config::FrameWindow};

/// Stream properties reported when a source is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub frame_count: usize,
    pub fps: f64,
    pub resolution: Resolution,
}

/// Random-access reader over the frames of one video.
///
/// Indices are relative to the opened window, so `read(0)` is the window's
/// first frame.
pub trait FrameSource: Send {
    fn info(&self) -> VideoInfo;

    fn read(&mut self, index: usize) -> Result<Frame, PipelineError>;

    /// Reads every frame in order.
    fn read_all(&mut self) -> Result<Vec<Frame>, PipelineError> {
        (0..self.info().frame_count)
            .map(|index| self.read(index))
            .collect()
    }
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Opens a directory of images or, when compiled in, a video container.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn open_source(
    path: &Path,
    window: FrameWindow,
    fps: f64,
) -> Result<Box<dyn FrameSource>, PipelineError> {
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path, window, fps)?));
    }
    if !path.exists() {
        return Err(PipelineError::Io(format!("{} does not exist", path.display())));
    }
    open_container(path, window)
}

#[cfg(feature = "ffmpeg")]
fn open_container(path: &Path, window: FrameWindow) -> Result<Box<dyn FrameSource>, PipelineError> {
    Ok(Box::new(ffmpeg_source::FfmpegSource::open(path, window)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_container(path: &Path, _window: FrameWindow) -> Result<Box<dyn FrameSource>, PipelineError> {
    Err(PipelineError::Io(format!(
        "{}: video containers need the `ffmpeg` feature; pass a directory of images instead",
        path.display()
    )))
}

/// Frames stored as individual images, ordered by file name.
#[derive(Debug)]
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    info: VideoInfo,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, window: FrameWindow, fps: f64) -> Result<Self, PipelineError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|err| PipelineError::Io(format!("{}: {err}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        let files: Vec<PathBuf> = files
            .into_iter()
            .skip(window.start)
            .take(window.max_frames.unwrap_or(usize::MAX))
            .collect();
        let first = files.first().ok_or_else(|| {
            PipelineError::Io(format!("{} holds no frames in the window", dir.display()))
        })?;
        let (width, height) = image::image_dimensions(first)?;
        debug!(target = "decode", frames = files.len(), width, height, "image sequence opened");

        Ok(Self {
            info: VideoInfo {
                frame_count: files.len(),
                fps,
                resolution: Resolution::new(width, height),
            },
            files,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn read(&mut self, index: usize) -> Result<Frame, PipelineError> {
        let path = self.files.get(index).ok_or_else(|| {
            PipelineError::Io(format!(
                "frame {index} beyond {} frames",
                self.info.frame_count
            ))
        })?;
        let image = image::open(path)?.to_rgb8();
        let resolution = Resolution::new(image.width(), image.height());
        if resolution != self.info.resolution {
            return Err(PipelineError::Mismatch(format!(
                "{} is {resolution}, sequence is {}",
                path.display(),
                self.info.resolution
            )));
        }
        Frame::from_rgb(index, resolution, image.into_raw())
    }
}

#[cfg(feature = "ffmpeg")]
mod ffmpeg_source {
    use std::path::Path;

    use ffmpeg::decoder::video::Video as VideoDecoder;
    use ffmpeg::software::scaling::{context::Context as Scaler, flag::Flags};
    use ffmpeg::util::{format::pixel::Pixel, frame::video::Video};
    use ffmpeg_next as ffmpeg;
    use tracing::instrument;

    use super::{FrameSource, VideoInfo};
    use crate::{Frame, PipelineError, Resolution, config::FrameWindow};

    /// Container decoded up front into memory for random access.
    pub struct FfmpegSource {
        frames: Vec<Frame>,
        info: VideoInfo,
    }

    impl FfmpegSource {
        #[instrument(skip_all, fields(path = %path.display()))]
        pub fn open(path: &Path, window: FrameWindow) -> Result<Self, PipelineError> {
            ffmpeg::init().map_err(|err| decode_error(format!("ffmpeg init failed: {err}")))?;

            let mut context = ffmpeg::format::input(&path)
                .map_err(|err| decode_error(format!("{}: open failed: {err}", path.display())))?;
            let stream = context
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| decode_error("no video stream found".to_string()))?;
            let stream_index = stream.index();
            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() == 0 {
                0.0
            } else {
                f64::from(rate)
            };

            let decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .map_err(|err| decode_error(format!("codec context: {err}")))?;
            let mut decoder = decoder_ctx
                .decoder()
                .video()
                .map_err(|err| decode_error(format!("video decoder: {err}")))?;
            let mut scaler = Scaler::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                Pixel::RGB24,
                decoder.width(),
                decoder.height(),
                Flags::BILINEAR,
            )
            .map_err(|err| decode_error(format!("scaler init failed: {err}")))?;

            let mut state = DrainState::new(window);
            for (stream, packet) in context.packets() {
                if stream.index() != stream_index {
                    continue;
                }
                decoder
                    .send_packet(&packet)
                    .map_err(|err| decode_error(format!("send packet: {err}")))?;
                match drain_decoder(&mut decoder, &mut scaler, &mut state)? {
                    DrainOutcome::NeedsMoreInput => {}
                    DrainOutcome::FrameLimitReached | DrainOutcome::EndOfStream => break,
                }
            }
            if state.has_remaining_budget() {
                decoder
                    .send_eof()
                    .map_err(|err| decode_error(format!("send eof: {err}")))?;
                drain_decoder(&mut decoder, &mut scaler, &mut state)?;
            }

            let frames = state.frames;
            let resolution = frames
                .first()
                .map(Frame::resolution)
                .ok_or_else(|| decode_error(format!("{}: no frames in window", path.display())))?;
            Ok(Self {
                info: VideoInfo {
                    frame_count: frames.len(),
                    fps,
                    resolution,
                },
                frames,
            })
        }
    }

    impl FrameSource for FfmpegSource {
        fn info(&self) -> VideoInfo {
            self.info
        }

        fn read(&mut self, index: usize) -> Result<Frame, PipelineError> {
            self.frames.get(index).cloned().ok_or_else(|| {
                PipelineError::Io(format!(
                    "frame {index} beyond {} frames",
                    self.info.frame_count
                ))
            })
        }
    }

    /// Outcome returned by [`drain_decoder`] describing the decoder's state.
    enum DrainOutcome {
        NeedsMoreInput,
        FrameLimitReached,
        EndOfStream,
    }

    /// Tracks decode progress against the requested window.
    struct DrainState {
        decoded: usize,
        window: FrameWindow,
        frames: Vec<Frame>,
    }

    impl DrainState {
        fn new(window: FrameWindow) -> Self {
            Self {
                decoded: 0,
                window,
                frames: Vec::new(),
            }
        }

        fn has_remaining_budget(&self) -> bool {
            self.window
                .max_frames
                .is_none_or(|max| self.frames.len() < max)
        }
    }

    fn drain_decoder(
        decoder: &mut VideoDecoder,
        scaler: &mut Scaler,
        state: &mut DrainState,
    ) -> Result<DrainOutcome, PipelineError> {
        let mut decoded = Video::empty();
        let mut converted = Video::empty();
        while state.has_remaining_budget() {
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let position = state.decoded;
                    state.decoded += 1;
                    if position < state.window.start {
                        continue;
                    }
                    let index = state.frames.len();
                    state
                        .frames
                        .push(convert_frame(scaler, &decoded, &mut converted, index)?);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    return Ok(DrainOutcome::NeedsMoreInput);
                }
                Err(ffmpeg::Error::Eof) => return Ok(DrainOutcome::EndOfStream),
                Err(err) => return Err(decode_error(format!("receive frame: {err}"))),
            }
        }
        Ok(DrainOutcome::FrameLimitReached)
    }

    /// Converts the decoded frame into packed RGB24, dropping row padding.
    fn convert_frame(
        scaler: &mut Scaler,
        decoded: &Video,
        converted: &mut Video,
        index: usize,
    ) -> Result<Frame, PipelineError> {
        scaler
            .run(decoded, converted)
            .map_err(|err| decode_error(format!("scale frame: {err}")))?;

        let width = converted.width() as usize;
        let height = converted.height() as usize;
        let stride = converted.stride(0);
        let row = width * Frame::CHANNELS;
        let plane = converted.data(0);
        if plane.len() < stride * (height.saturating_sub(1)) + row {
            return Err(decode_error(
                "decoded plane smaller than expected".to_string(),
            ));
        }
        let mut bytes = Vec::with_capacity(row * height);
        for y in 0..height {
            bytes.extend_from_slice(&plane[y * stride..y * stride + row]);
        }
        Frame::from_rgb(
            index,
            Resolution::new(width as u32, height as u32),
            bytes,
        )
    }

    fn decode_error(message: String) -> PipelineError {
        PipelineError::Io(format!("decode: {message}"))
    }
}
