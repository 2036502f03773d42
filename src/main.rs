use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use image::Rgba;
use std::path::PathBuf;
use videoseg::capture::FfmpegSource;
use videoseg::output::FfmpegSink;
use videoseg::pipeline::{BottomLayer, FramePipeline, PipelineConfig};
use videoseg::segmentation::{self, DeviceHint, MobileUnet, Segmenter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a video with each frame stacked over its segmentation
    Video(VideoArgs),
    /// Segment a single image and save the extracted foreground
    Image(ImageArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Path to segmentation model (ONNX file)
    #[arg(long)]
    model: PathBuf,

    /// Execution device: cpu, cuda or tensorrt
    #[arg(long, default_value = "cpu")]
    device: DeviceHint,

    /// Pad frames to a square before inference
    #[arg(long)]
    square_input: bool,
}

#[derive(Args, Debug)]
struct VideoArgs {
    /// Source video
    #[arg(short, long)]
    input: PathBuf,

    /// Destination video (H.264)
    #[arg(short, long)]
    output: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    /// Width of each half of the output
    #[arg(long, default_value_t = 1024)]
    width: u32,

    /// Height of each half of the output
    #[arg(long, default_value_t = 1024)]
    height: u32,

    /// Output frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Seconds of the source to process
    #[arg(long, default_value_t = 6.0)]
    duration_limit: f64,

    /// Failed fetches of a single frame before giving up
    #[arg(long, default_value_t = 8)]
    retry_cap: u32,

    /// Composed frames buffered ahead of the encoder
    #[arg(long, default_value_t = 4)]
    queue_depth: usize,

    /// Lower half content: composite or mask
    #[arg(long, default_value = "composite")]
    bottom: BottomLayer,

    /// Mask colour as RRGGBB, used with --bottom mask
    #[arg(long, default_value = "ffffff", value_parser = parse_color)]
    mask_color: Rgba<u8>,
}

#[derive(Args, Debug)]
struct ImageArgs {
    /// Source image
    #[arg(short, long)]
    input: PathBuf,

    /// Directory receiving the extracted PNGs
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    #[command(flatten)]
    model: ModelArgs,
}

fn parse_color(value: &str) -> Result<Rgba<u8>, String> {
    let hex = value.trim_start_matches('#');
    if hex.len() != 6 {
        return Err(format!("expected RRGGBB, got '{value}'"));
    }
    let rgb = u32::from_str_radix(hex, 16)
        .map_err(|err| format!("invalid colour '{value}': {err}"))?;
    Ok(Rgba([(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8, 255]))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("videoseg starting");

    match cli.command {
        Command::Video(args) => run_video(args),
        Command::Image(args) => run_image(args),
    }
}

fn load_segmenter(args: &ModelArgs) -> Result<Segmenter<MobileUnet>> {
    let segmenter = segmentation::create_default_segmenter(&args.model, args.device)
        .context("Failed to load segmentation model")?;
    Ok(segmenter.with_square_padding(args.square_input))
}

fn run_video(args: VideoArgs) -> Result<()> {
    let config = PipelineConfig {
        canvas_width: args.width,
        canvas_height: args.height,
        output_fps: args.fps,
        duration_limit_secs: args.duration_limit,
        retry_cap: args.retry_cap,
        queue_depth: args.queue_depth,
        bottom_layer: args.bottom,
        mask_color: args.mask_color,
        ..PipelineConfig::default()
    };
    config.validate().context("Invalid pipeline settings")?;

    tracing::info!("Input: {}", args.input.display());
    tracing::info!("Output: {}", args.output.display());
    tracing::info!("Canvas: {}x{} per half", config.canvas_width, config.canvas_height);
    tracing::info!("Target FPS: {}", config.output_fps);

    let segmenter = load_segmenter(&args.model)?;
    let mut pipeline = FramePipeline::new(config, segmenter);

    let stop = pipeline.stop_signal();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupt received, stopping after the current frame");
        stop.request_stop();
    })
    .context("Failed to install Ctrl+C handler")?;
    tracing::info!("Press Ctrl+C to stop");

    let fps = args.fps;
    let (input, output) = (args.input, args.output);
    let report = pipeline
        .run(
            || FfmpegSource::open(&input, fps),
            |width, height| FfmpegSink::open(&output, width, height, fps),
        )
        .context("Segmentation pipeline failed")?;

    tracing::info!(
        "Wrote {} frames to {} in {:.2}s ({} empty masks, {} fetch retries{})",
        report.frames_written,
        output.display(),
        report.elapsed.as_secs_f64(),
        report.inference_fallbacks,
        report.acquisition_retries,
        if report.stopped { ", stopped early" } else { "" }
    );

    Ok(())
}

fn run_image(args: ImageArgs) -> Result<()> {
    let image = image::open(&args.input)
        .with_context(|| format!("Failed to read image {}", args.input.display()))?
        .to_rgba8();
    tracing::info!(
        "Segmenting {} ({}x{})",
        args.input.display(),
        image.width(),
        image.height()
    );

    let mut segmenter = load_segmenter(&args.model)?;
    let result = segmenter
        .segment_image(image)
        .context("Failed to segment image")?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;

    let stem = args
        .input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image");
    let body_path = args.out_dir.join(format!("body_{stem}.png"));
    let full_size_path = args.out_dir.join(format!("full_size_body_{stem}.png"));

    result
        .body
        .save(&body_path)
        .with_context(|| format!("Failed to save {}", body_path.display()))?;
    tracing::info!("Body saved to {}", body_path.display());

    result
        .full_size_body
        .save(&full_size_path)
        .with_context(|| format!("Failed to save {}", full_size_path.display()))?;
    tracing::info!("Full size body saved to {}", full_size_path.display());

    let rect = result.crop_rect;
    tracing::info!(
        "Crop rect: x={}, y={}, width={}, height={}",
        rect.x,
        rect.y,
        rect.width,
        rect.height
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_colours() {
        assert_eq!(parse_color("ff8000"), Ok(Rgba([255, 128, 0, 255])));
        assert_eq!(parse_color("#00ff00"), Ok(Rgba([0, 255, 0, 255])));
        assert!(parse_color("fff").is_err());
        assert!(parse_color("zzzzzz").is_err());
    }

    #[test]
    fn cli_parses_video_command() {
        let cli = Cli::try_parse_from([
            "videoseg", "video", "-i", "in.mp4", "-o", "out.mp4", "--model", "m.onnx",
            "--bottom", "mask", "--duration-limit", "2",
        ])
        .unwrap();

        match cli.command {
            Command::Video(args) => {
                assert_eq!(args.bottom, BottomLayer::Mask);
                assert_eq!(args.duration_limit, 2.0);
                assert_eq!(args.model.device, DeviceHint::Cpu);
                assert_eq!(args.width, 1024);
            }
            Command::Image(_) => panic!("expected video command"),
        }
    }
}
