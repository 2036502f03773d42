use super::FrameSink;
use crate::error::SinkError;
use crate::frame::Frame;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

/// H.264 file written by an `ffmpeg` child process fed raw RGBA frames.
pub struct FfmpegSink {
    path: PathBuf,
    width: u32,
    height: u32,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    frames_written: u64,
}

impl FfmpegSink {
    pub fn open<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref();
        tracing::info!(
            "Opening video sink at {} ({}x{} @ {}fps)",
            path.display(),
            width,
            height,
            fps
        );

        let open_error = |reason: String| SinkError::Open {
            path: path.to_path_buf(),
            reason,
        };

        // yuv420p needs even dimensions
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(open_error(format!("unsupported output size {width}x{height}")));
        }
        if fps == 0 {
            return Err(open_error("frame rate must be positive".to_string()));
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(fps.to_string())
            .arg("-i")
            .arg("-")
            .arg("-an")
            .arg("-c:v")
            .arg("libx264")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg(path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|err| open_error(format!("failed to start ffmpeg: {err}")))?;
        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                return Err(open_error("failed to capture ffmpeg stdin".to_string()));
            }
        };

        tracing::info!("Video sink opened successfully");

        Ok(Self::with_encoder(path, width, height, child, stdin))
    }

    fn with_encoder(
        path: &Path,
        width: u32,
        height: u32,
        child: Child,
        stdin: ChildStdin,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            width,
            height,
            child,
            stdin: Some(BufWriter::with_capacity(4 * 1024 * 1024, stdin)),
            frames_written: 0,
        }
    }
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let (width, height) = frame.dimensions();
        if (width, height) != (self.width, self.height) {
            return Err(SinkError::SizeMismatch {
                expected_width: width,
                expected_height: height,
                actual_width: self.width,
                actual_height: self.height,
            });
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SinkError::Write("sink already finished".to_string()))?;

        stdin
            .write_all(frame.image.as_raw())
            .map_err(|err| SinkError::Write(format!("{}: {err}", self.path.display())))?;

        self.frames_written += 1;
        if self.frames_written % 100 == 0 {
            tracing::debug!("Encoded {} frames", self.frames_written);
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        // Dropping stdin closes the pipe so the encoder sees end of input
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush(),
            None => Ok(()),
        };

        let status = self
            .child
            .wait()
            .map_err(|err| SinkError::Finish(format!("failed to wait for ffmpeg: {err}")))?;
        flushed.map_err(|err| SinkError::Finish(format!("flush failed: {err}")))?;
        if !status.success() {
            return Err(SinkError::Finish(format!("ffmpeg exited with {status}")));
        }

        tracing::info!(
            "Wrote {} frames to {}",
            self.frames_written,
            self.path.display()
        );
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        // Dropped without finish(): abort the encoder instead of finalizing
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
