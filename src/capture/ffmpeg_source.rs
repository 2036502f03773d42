use super::FrameSource;
use crate::error::SourceError;
use image::RgbaImage;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

const BYTES_PER_PIXEL: usize = 4;

/// Video file decoded by an `ffmpeg` child process.
///
/// The decoder emits raw RGBA frames resampled to `fps`, so frame `n` is
/// the one shown at `n / fps` seconds. Requests move forward through the
/// stream; asking for an earlier frame restarts the decoder with a seek.
pub struct FfmpegSource {
    path: PathBuf,
    width: u32,
    height: u32,
    duration_secs: f64,
    fps: u32,
    decoder: Option<Decoder>,
}

struct Decoder {
    child: Child,
    stdout: ChildStdout,
    /// Index of the next frame the child will emit
    next_index: u64,
    last: Option<(u64, RgbaImage)>,
}

impl FfmpegSource {
    pub fn open<P: AsRef<Path>>(path: P, fps: u32) -> Result<Self, SourceError> {
        let path = path.as_ref();
        tracing::info!("Opening video source {}", path.display());

        if fps == 0 {
            return Err(open_error(path, "frame rate must be positive"));
        }

        let probe = probe(path)?;
        tracing::info!(
            "Source {}x{}, {:.2}s",
            probe.width,
            probe.height,
            probe.duration_secs
        );

        Ok(Self {
            path: path.to_path_buf(),
            width: probe.width,
            height: probe.height,
            duration_secs: probe.duration_secs,
            fps,
            decoder: None,
        })
    }

    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    fn spawn_decoder(&self, start_index: u64) -> Result<Decoder, SourceError> {
        let start_secs = start_index as f64 / f64::from(self.fps);
        tracing::debug!("Starting decoder at {:.3}s", start_secs);

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-noautorotate")
            .arg("-ss")
            .arg(format!("{start_secs:.6}"))
            .arg("-i")
            .arg(&self.path)
            .arg("-an")
            .arg("-vf")
            .arg(format!("fps={}", self.fps))
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn()?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                return Err(SourceError::Decode(std::io::Error::other(
                    "failed to capture ffmpeg stdout",
                )));
            }
        };

        Ok(Decoder {
            child,
            stdout,
            next_index: start_index,
            last: None,
        })
    }

    fn decode_index(&mut self, index: u64) -> Result<RgbaImage, SourceError> {
        let next_index = self.decoder.as_ref().map(|decoder| decoder.next_index);
        if needs_restart(next_index, index) {
            if let Some(decoder) = self.decoder.take() {
                decoder.shutdown();
            }
            self.decoder = Some(self.spawn_decoder(index)?);
        }

        let frame_bytes = self.frame_bytes();
        let (width, height) = (self.width, self.height);
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(SourceError::Decode(std::io::Error::other("decoder not running")));
        };

        if let Some((last_index, image)) = &decoder.last {
            if *last_index == index {
                return Ok(image.clone());
            }
        }

        while decoder.next_index <= index {
            let mut buffer = vec![0u8; frame_bytes];
            decoder.stdout.read_exact(&mut buffer)?;

            let image = RgbaImage::from_raw(width, height, buffer).ok_or_else(|| {
                SourceError::Decode(std::io::Error::other("short frame buffer"))
            })?;
            decoder.last = Some((decoder.next_index, image));
            decoder.next_index += 1;
        }

        match &decoder.last {
            Some((_, image)) => Ok(image.clone()),
            None => Err(SourceError::Decode(std::io::Error::other("no frame decoded"))),
        }
    }
}

impl FrameSource for FfmpegSource {
    fn frame_at(&mut self, timestamp_us: u64) -> Option<RgbaImage> {
        let index = frame_index(timestamp_us, self.fps);

        match self.decode_index(index) {
            Ok(image) => Some(image),
            Err(err) => {
                tracing::warn!("Failed to decode frame at {}us: {}", timestamp_us, err);
                if let Some(decoder) = self.decoder.take() {
                    decoder.shutdown();
                }
                None
            }
        }
    }

    fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.child.kill()?;
            decoder.child.wait()?;
        }
        tracing::info!("Closed video source {}", self.path.display());
        Ok(())
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            decoder.shutdown();
        }
    }
}

impl Decoder {
    fn shutdown(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Nearest frame on a grid of `fps` frames per second
fn frame_index(timestamp_us: u64, fps: u32) -> u64 {
    (timestamp_us * u64::from(fps) + 500_000) / 1_000_000
}

/// The decoder only moves forward, so an earlier frame needs a fresh one
fn needs_restart(next_index: Option<u64>, index: u64) -> bool {
    match next_index {
        Some(next) => index < next,
        None => true,
    }
}

#[derive(Debug, PartialEq)]
struct Probe {
    width: u32,
    height: u32,
    duration_secs: f64,
}

fn open_error(path: &Path, reason: impl Into<String>) -> SourceError {
    SourceError::Open {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn probe(path: &Path) -> Result<Probe, SourceError> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height:format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1")
        .arg(path)
        .output()
        .map_err(|err| open_error(path, format!("failed to run ffprobe: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(open_error(path, stderr.trim().to_string()));
    }

    parse_probe(&String::from_utf8_lossy(&output.stdout)).map_err(|reason| open_error(path, reason))
}

fn parse_probe(text: &str) -> Result<Probe, String> {
    let mut width = None;
    let mut height = None;
    let mut duration = None;

    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "width" => width = value.parse::<u32>().ok(),
            "height" => height = value.parse::<u32>().ok(),
            "duration" => duration = value.parse::<f64>().ok(),
            _ => {}
        }
    }

    let (width, height) = match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("no video stream with a valid size".to_string()),
    };
    let duration_secs = match duration {
        Some(d) if d.is_finite() && d > 0.0 => d,
        _ => return Err("unknown duration".to_string()),
    };

    Ok(Probe {
        width,
        height,
        duration_secs,
    })
}
