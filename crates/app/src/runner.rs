//! Demo pipeline runner.
//!
//! Reads a pipeline configuration, starts a UDF manager between two bounded
//! queues, feeds it frames (a PNG/JPEG file or a synthetic gradient), and
//! prints the envelope emitted for every surviving frame.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use frame_core::{EncodeType, Frame, FrameQueue};
use tracing::{info, warn};
use udf_runtime::UdfManager;

#[derive(Debug, Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Feed frames through a configured UDF chain"
)]
pub struct RunArgs {
    /// Pipeline configuration file (JSON document with a "udfs" array).
    #[arg(long)]
    pub config: PathBuf,

    /// Number of frames to feed before draining and exiting.
    #[arg(long, default_value_t = 10)]
    pub frames: usize,

    /// Image file fed as every frame; a synthetic gradient is used when
    /// omitted.
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Synthetic frame size as WIDTHxHEIGHT.
    #[arg(long, default_value = "320x240")]
    pub size: String,

    /// Output encoding applied by the manager, e.g. "jpeg:85" or "png:4".
    #[arg(long)]
    pub encode: Option<String>,
}

pub fn run(args: RunArgs) -> Result<()> {
    let doc: serde_json::Value = {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", args.config.display()))?
    };
    let target_encoding = parse_encoding(args.encode.as_deref())?;

    let input = FrameQueue::bounded(16);
    let output = FrameQueue::bounded(16);
    let mut manager = UdfManager::from_config(&doc, input.clone(), output.clone(), target_encoding)
        .context("constructing UDF manager")?;
    manager.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    }

    let (pixels, width, height, channels) = source_frame(&args)?;
    info!(width, height, channels, frames = args.frames, "feeding frames");

    let producer = {
        let input = input.clone();
        let shutdown = shutdown.clone();
        let count = args.frames;
        thread::spawn(move || {
            for _ in 0..count {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let mut frame = match Frame::new(
                    pixels.clone(),
                    width,
                    height,
                    channels,
                    EncodeType::None,
                    0,
                ) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("failed to build frame: {err}");
                        break;
                    }
                };
                let _ = frame
                    .meta_data_mut()
                    .put("timestamp", Utc::now().timestamp_millis());
                input.push_wait(frame);
            }
        })
    };

    let mut received = 0usize;
    let mut idle = 0u32;
    while received < args.frames && !shutdown.load(Ordering::Relaxed) {
        match output.pop_timeout(Duration::from_millis(250)) {
            Some(frame) => {
                idle = 0;
                received += 1;
                describe(received, frame)?;
            }
            None => {
                idle += 1;
                // Frames may legitimately never arrive (drop/error UDFs);
                // give the pipeline a few quiet polls before giving up.
                if idle >= 20 {
                    warn!(received, "no more frames arriving, stopping");
                    break;
                }
            }
        }
    }

    let _ = producer.join();
    manager.stop();
    info!(received, "pipeline run complete");
    Ok(())
}

fn describe(index: usize, frame: Frame) -> Result<()> {
    let planes = frame.frame_count();
    let envelope = frame.serialize().context("serializing output frame")?;
    let blob_bytes: usize = (0..envelope.blob_count())
        .filter_map(|i| envelope.blob(i).ok())
        .map(|blob| blob.len())
        .sum();
    println!(
        "frame {index}: {planes} plane(s), {blob_bytes} payload bytes, meta {}",
        serde_json::to_string(&envelope.to_json())?
    );
    Ok(())
}

fn source_frame(args: &RunArgs) -> Result<(Vec<u8>, u32, u32, u32)> {
    if let Some(path) = &args.image {
        let img = image::open(path)
            .with_context(|| format!("opening {}", path.display()))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        return Ok((img.into_raw(), width, height, 3));
    }

    let (width, height) = parse_size(&args.size)?;
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x * 255 / width.max(1)) as u8);
            pixels.push((y * 255 / height.max(1)) as u8);
            pixels.push(((x + y) % 256) as u8);
        }
    }
    Ok((pixels, width, height, 3))
}

fn parse_size(size: &str) -> Result<(u32, u32)> {
    let Some((width, height)) = size.split_once('x') else {
        bail!("--size must look like 320x240");
    };
    let width = width.parse::<u32>().context("--size width")?;
    let height = height.parse::<u32>().context("--size height")?;
    if width == 0 || height == 0 {
        bail!("--size dimensions must be positive");
    }
    Ok((width, height))
}

fn parse_encoding(spec: Option<&str>) -> Result<(EncodeType, i32)> {
    let Some(spec) = spec else {
        return Ok((EncodeType::None, 0));
    };
    let (name, level) = match spec.split_once(':') {
        Some((name, level)) => (name, level.parse::<i32>().context("--encode level")?),
        None => (spec, 0),
    };
    let encode = match name {
        "jpeg" => EncodeType::Jpeg,
        "png" => EncodeType::Png,
        "none" => EncodeType::None,
        other => bail!("unknown encoding {other:?} (expected jpeg, png, or none)"),
    };
    if !encode.level_valid(level) {
        bail!("encoding level {level} is out of range for {name}");
    }
    Ok((encode, level))
}
