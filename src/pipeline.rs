//! Decode -> segment -> compose loop feeding a dedicated writer thread.
//!
//! The loop runs on the caller's thread and owns the segmenter, so at most
//! one inference is in flight. Composed frames travel to the writer through
//! a bounded queue; the loop only blocks when the queue is full and when it
//! drains the writer at the end of a run.

use crate::capture::FrameSource;
use crate::error::{ImageError, PipelineError, SinkError, SourceError};
use crate::frame::Frame;
use crate::imaging::{apply_mask, fit_with_letterbox, recolor_visible};
use crate::output::FrameSink;
use crate::segmentation::{empty_mask, InferenceEngine, Segmenter};
use crossbeam_channel::{bounded, Receiver, Sender};
use image::{imageops, Rgba, RgbaImage};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const MICROS_PER_SECOND: u64 = 1_000_000;

/// Frames between timing summaries
const STATS_INTERVAL: u64 = 30;

/// A fatal stage error and when it happened
type StageFailure = (PipelineError, Instant);

/// What the lower half of each output frame shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BottomLayer {
    /// The frame with its background cleared
    #[default]
    Composite,
    /// The mask itself, painted in `mask_color`
    Mask,
}

impl FromStr for BottomLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "composite" => Ok(Self::Composite),
            "mask" => Ok(Self::Mask),
            other => Err(format!("unknown bottom layer '{other}' (expected composite or mask)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Width of both halves of the output
    pub canvas_width: u32,
    /// Height of one half; output frames are twice as tall
    pub canvas_height: u32,
    pub output_fps: u32,
    /// Longest stretch of the source that is processed
    pub duration_limit_secs: f64,
    /// Consecutive failed fetches of one frame before the run fails
    pub retry_cap: u32,
    pub retry_backoff: Duration,
    /// Composed frames buffered ahead of the writer
    pub queue_depth: usize,
    pub bottom_layer: BottomLayer,
    pub mask_color: Rgba<u8>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            canvas_width: 1024,
            canvas_height: 1024,
            output_fps: 30,
            duration_limit_secs: 6.0,
            retry_cap: 8,
            retry_backoff: Duration::from_millis(10),
            queue_depth: 4,
            bottom_layer: BottomLayer::Composite,
            mask_color: Rgba([255, 255, 255, 255]),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: &str| Err(PipelineError::Config(reason.to_string()));

        if self.canvas_width == 0 || self.canvas_height == 0 {
            return invalid("canvas must have a non-zero size");
        }
        if self.canvas_height.checked_mul(2).is_none() {
            return invalid("canvas is too tall");
        }
        if self.output_fps == 0 || u64::from(self.output_fps) > MICROS_PER_SECOND {
            return invalid("output fps must be between 1 and 1000000");
        }
        if !(self.duration_limit_secs.is_finite() && self.duration_limit_secs > 0.0) {
            return invalid("duration limit must be positive");
        }
        if self.retry_cap == 0 {
            return invalid("retry cap must be at least 1");
        }
        if self.queue_depth == 0 {
            return invalid("queue depth must be at least 1");
        }
        Ok(())
    }

    /// Size of the stacked output frame
    pub fn output_size(&self) -> (u32, u32) {
        (self.canvas_width, self.canvas_height * 2)
    }

    /// Time between consecutive output frames
    pub fn frame_delta_us(&self) -> u64 {
        MICROS_PER_SECOND / u64::from(self.output_fps)
    }
}

/// Number of frames a run produces for a source of the given length
pub fn frame_budget(source_duration_secs: f64, duration_limit_secs: f64, output_fps: u32) -> u64 {
    let seconds = source_duration_secs.min(duration_limit_secs);
    if !(seconds > 0.0) {
        return 0;
    }
    // Nudge so products like 2.3 * 30 do not floor to 68
    (seconds * f64::from(output_fps) + 1e-9).floor() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Priming,
    Running,
    Draining,
    Finished,
    Failed,
}

/// Cloneable handle asking a running pipeline to wind down
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub frames_written: u64,
    pub frame_budget: u64,
    pub elapsed: Duration,
    /// Frames composed with an empty mask because inference failed
    pub inference_fallbacks: u64,
    /// Failed frame fetches that were retried or exhausted
    pub acquisition_retries: u64,
    /// The run ended early on a stop request
    pub stopped: bool,
}

#[derive(Debug, Default)]
struct ProduceOutcome {
    frames_sent: u64,
    inference_fallbacks: u64,
    acquisition_retries: u64,
    stopped: bool,
}

#[derive(Debug, Default)]
struct StageTimes {
    acquire: Duration,
    segment: Duration,
    compose: Duration,
}

pub struct FramePipeline<E> {
    config: PipelineConfig,
    segmenter: Segmenter<E>,
    state: PipelineState,
    stop: StopSignal,
}

impl<E: InferenceEngine> FramePipeline<E> {
    pub fn new(config: PipelineConfig, segmenter: Segmenter<E>) -> Self {
        Self {
            config,
            segmenter,
            state: PipelineState::Idle,
            stop: StopSignal::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle that stops the run at the start of its next iteration
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run the pipeline once.
    ///
    /// `open_source` opens the input; `open_sink` receives the stacked output
    /// size and opens the destination, which is then moved to the writer
    /// thread. A sink reporting any other resolution fails with `SinkOpen`.
    /// Once the writer is running, the sink is finished and the source
    /// closed before this returns.
    pub fn run<S, K, OS, OK>(
        &mut self,
        open_source: OS,
        open_sink: OK,
    ) -> Result<PipelineReport, PipelineError>
    where
        S: FrameSource,
        K: FrameSink + 'static,
        OS: FnOnce() -> Result<S, SourceError>,
        OK: FnOnce(u32, u32) -> Result<K, SinkError>,
    {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::Config(format!(
                "pipeline cannot start from {:?}",
                self.state
            )));
        }
        if let Err(err) = self.config.validate() {
            return Err(self.fail(err));
        }

        let started = Instant::now();
        self.transition(PipelineState::Priming);

        let mut source = match open_source() {
            Ok(source) => source,
            Err(err) => return Err(self.fail(PipelineError::SourceOpen(err))),
        };

        let (output_width, output_height) = self.config.output_size();
        let sink = match open_sink(output_width, output_height) {
            Ok(sink) => sink,
            Err(err) => {
                close_source(&mut source);
                return Err(self.fail(PipelineError::SinkOpen(err)));
            }
        };

        let (sink_width, sink_height) = sink.resolution();
        if (sink_width, sink_height) != (output_width, output_height) {
            close_source(&mut source);
            return Err(self.fail(PipelineError::SinkOpen(SinkError::SizeMismatch {
                expected_width: output_width,
                expected_height: output_height,
                actual_width: sink_width,
                actual_height: sink_height,
            })));
        }

        let budget = frame_budget(
            source.duration_secs(),
            self.config.duration_limit_secs,
            self.config.output_fps,
        );
        let (source_width, source_height) = source.resolution();
        tracing::info!(
            "Source {}x{} ({:.2}s), producing {} frames at {}fps into {}x{}",
            source_width,
            source_height,
            source.duration_secs(),
            budget,
            self.config.output_fps,
            output_width,
            output_height
        );

        let (frames_tx, frames_rx) = bounded(self.config.queue_depth);
        let writer = match spawn_writer(sink, frames_rx) {
            Ok(writer) => writer,
            Err(err) => {
                close_source(&mut source);
                return Err(self.fail(PipelineError::WriterSpawn(err)));
            }
        };

        self.transition(PipelineState::Running);
        let produced = self
            .produce(&mut source, &frames_tx, budget)
            .map_err(|err| (err, Instant::now()));

        self.transition(PipelineState::Draining);
        drop(frames_tx);
        let written = writer
            .join()
            .unwrap_or_else(|_| Err((PipelineError::WriterPanicked, Instant::now())));
        close_source(&mut source);

        let (outcome, frames_written) = match (produced, written) {
            (Ok(outcome), Ok(frames_written)) => (outcome, frames_written),
            (Ok(_), Err((err, _))) | (Err((err, _)), Ok(_)) => return Err(self.fail(err)),
            (Err(frame_loop), Err(writer)) => {
                return Err(self.fail(earliest_failure(frame_loop, writer)));
            }
        };

        self.transition(PipelineState::Finished);
        let report = PipelineReport {
            frames_written,
            frame_budget: budget,
            elapsed: started.elapsed(),
            inference_fallbacks: outcome.inference_fallbacks,
            acquisition_retries: outcome.acquisition_retries,
            stopped: outcome.stopped,
        };
        tracing::info!(
            "Finished {} of {} frames in {:.2}s",
            report.frames_written,
            report.frame_budget,
            report.elapsed.as_secs_f64()
        );

        Ok(report)
    }

    fn produce<S: FrameSource>(
        &mut self,
        source: &mut S,
        frames: &Sender<Frame>,
        budget: u64,
    ) -> Result<ProduceOutcome, PipelineError> {
        let frame_delta = self.config.frame_delta_us();
        let (canvas_width, canvas_height) = (self.config.canvas_width, self.config.canvas_height);
        let mut outcome = ProduceOutcome::default();
        let mut times = StageTimes::default();

        tracing::info!("Starting frame loop");

        for frame_index in 0..budget {
            if self.stop.is_stop_requested() {
                tracing::info!("Stop requested after {} frames", frame_index);
                outcome.stopped = true;
                break;
            }

            let timestamp_us = frame_index * frame_delta;
            tracing::debug!("Frame {} at {}us", frame_index, timestamp_us);

            let acquire_start = Instant::now();
            let image = self.acquire(source, frame_index, timestamp_us, &mut outcome)?;
            times.acquire += acquire_start.elapsed();

            let segment_start = Instant::now();
            let working = fit_with_letterbox(&image, canvas_width, canvas_height)
                .map_err(|source| PipelineError::Image {
                    frame_index,
                    source,
                })?;
            let mask = match self.segmenter.segment_frame(&working) {
                Some(mask) => mask,
                None => {
                    tracing::warn!("Frame {}: using empty mask", frame_index);
                    outcome.inference_fallbacks += 1;
                    empty_mask(canvas_width, canvas_height)
                }
            };
            times.segment += segment_start.elapsed();

            let compose_start = Instant::now();
            let composed = self
                .compose(&working, &mask)
                .map_err(|source| PipelineError::Image {
                    frame_index,
                    source,
                })?;
            times.compose += compose_start.elapsed();

            if frames.send(Frame::new(composed, timestamp_us)).is_err() {
                tracing::warn!("Writer stopped, abandoning frame {}", frame_index);
                break;
            }
            outcome.frames_sent += 1;

            if outcome.frames_sent % STATS_INTERVAL == 0 {
                log_stats(outcome.frames_sent, &times);
            }
        }

        Ok(outcome)
    }

    /// Fetch one frame, retrying in place up to the configured cap
    fn acquire<S: FrameSource>(
        &self,
        source: &mut S,
        frame_index: u64,
        timestamp_us: u64,
        outcome: &mut ProduceOutcome,
    ) -> Result<RgbaImage, PipelineError> {
        let cap = self.config.retry_cap;

        for attempt in 1..=cap {
            if let Some(image) = source.frame_at(timestamp_us) {
                return Ok(image);
            }

            outcome.acquisition_retries += 1;
            tracing::warn!(
                "No frame at {}us (frame {}), attempt {}/{}",
                timestamp_us,
                frame_index,
                attempt,
                cap
            );
            if attempt < cap && !self.config.retry_backoff.is_zero() {
                thread::sleep(self.config.retry_backoff);
            }
        }

        Err(PipelineError::FrameAcquisitionExhausted {
            frame_index,
            timestamp_us,
            attempts: cap,
        })
    }

    /// Stack the letterboxed frame over its segmented counterpart
    fn compose(&self, working: &RgbaImage, mask: &RgbaImage) -> Result<RgbaImage, ImageError> {
        let bottom = match self.config.bottom_layer {
            BottomLayer::Composite => apply_mask(working, mask)?,
            BottomLayer::Mask => recolor_visible(mask, self.config.mask_color),
        };

        let (width, height) = self.config.output_size();
        let mut canvas = RgbaImage::new(width, height);
        imageops::replace(&mut canvas, working, 0, 0);
        imageops::replace(&mut canvas, &bottom, 0, i64::from(self.config.canvas_height));

        Ok(canvas)
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!("Pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        tracing::error!("Pipeline failed: {}", err);
        self.transition(PipelineState::Failed);
        err
    }
}

/// Pick the error that happened first when both stages failed
fn earliest_failure(frame_loop: StageFailure, writer: StageFailure) -> PipelineError {
    let ((loop_err, loop_at), (writer_err, writer_at)) = (frame_loop, writer);
    if writer_at < loop_at {
        tracing::error!("Writer failed first; frame loop later failed with: {}", loop_err);
        writer_err
    } else {
        tracing::error!("Frame loop failed first; writer later failed with: {}", writer_err);
        loop_err
    }
}

fn close_source<S: FrameSource>(source: &mut S) {
    if let Err(err) = source.close() {
        tracing::warn!("Failed to close source: {}", err);
    }
}

fn log_stats(frames: u64, times: &StageTimes) {
    let avg_ms = |total: Duration| total.as_secs_f64() * 1000.0 / frames as f64;
    let acquire_ms = avg_ms(times.acquire);
    let segment_ms = avg_ms(times.segment);
    let compose_ms = avg_ms(times.compose);
    let total_ms = acquire_ms + segment_ms + compose_ms;

    tracing::info!(
        "Frame {}: acquire={:.1}ms, segment={:.1}ms, compose={:.1}ms, total={:.1}ms, fps={:.1}",
        frames,
        acquire_ms,
        segment_ms,
        compose_ms,
        total_ms,
        1000.0 / total_ms
    );
}

/// Spawn the thread that owns the sink and drains the frame queue.
///
/// On a write error the thread drops its end of the queue, which makes the
/// producer's next send fail, then still finishes the sink.
fn spawn_writer<K: FrameSink + 'static>(
    mut sink: K,
    frames: Receiver<Frame>,
) -> std::io::Result<JoinHandle<Result<u64, StageFailure>>> {
    thread::Builder::new()
        .name("frame-writer".to_string())
        .spawn(move || {
            let mut written = 0u64;
            let mut failure = None;

            while let Ok(frame) = frames.recv() {
                if let Err(source) = sink.write_frame(&frame) {
                    let err = PipelineError::Write {
                        frame_index: written,
                        timestamp_us: frame.timestamp_us,
                        source,
                    };
                    failure = Some((err, Instant::now()));
                    break;
                }
                written += 1;
            }
            drop(frames);

            let finished = sink.finish();
            if let Some((err, failed_at)) = failure {
                tracing::error!("Write failed: {}", err);
                if let Err(finish_err) = finished {
                    tracing::warn!("Finish after write failure also failed: {}", finish_err);
                }
                return Err((err, failed_at));
            }
            finished.map_err(|err| (PipelineError::Finish(err), Instant::now()))?;

            tracing::debug!("Writer drained {} frames", written);
            Ok(written)
        })
}
