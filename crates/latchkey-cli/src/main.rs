use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use latchkey_core::detector::{StageThresholds, DEFAULT_MIN_FACE_SIZE};
use latchkey_core::{TensorLayout, DEFAULT_TOLERANCE};
use tracing_subscriber::EnvFilter;

mod identify;
mod models;
mod servo;

#[derive(Parser)]
#[command(name = "latchkey", version, about = "Latchkey gate controller tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Where the models live and how to run them.
#[derive(Args)]
struct ModelArgs {
    /// ONNX model directory [default: per-user or system model dir]
    #[arg(long, env = "LATCHKEY_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Detector per-stage thresholds, "pnet,rnet,onet"
    #[arg(long, default_value = "0.5,0.8,0.9", value_parser = parse_thresholds)]
    thresholds: StageThresholds,
    /// Smallest face side in pixels the detector searches for
    #[arg(long, default_value_t = DEFAULT_MIN_FACE_SIZE)]
    min_face_size: u32,
    /// Encoder input layout (nhwc or nchw)
    #[arg(long, default_value = "nhwc")]
    layout: TensorLayout,
}

impl ModelArgs {
    fn dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(latchkey_core::default_model_dir)
    }
}

fn parse_thresholds(s: &str) -> Result<StageThresholds, String> {
    s.parse().map_err(|e: latchkey_core::detector::DetectorError| e.to_string())
}

#[derive(Subcommand)]
enum Command {
    /// Check that every model is present and matches SHA256SUMS if provided
    CheckModels {
        #[arg(long, env = "LATCHKEY_MODEL_DIR")]
        model_dir: Option<PathBuf>,
    },
    /// Enroll the gallery directory and list the identities found
    Gallery {
        #[arg(long, env = "LATCHKEY_GALLERY_DIR", default_value = "./face_dataset")]
        gallery_dir: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Match every face in one image against the gallery
    Identify {
        image: PathBuf,
        #[arg(long, env = "LATCHKEY_GALLERY_DIR", default_value = "./face_dataset")]
        gallery_dir: PathBuf,
        #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
        tolerance: f32,
        #[command(flatten)]
        models: ModelArgs,
        #[arg(long)]
        json: bool,
    },
    /// Move the servo, hold, then return to rest
    Servo {
        /// Target angle in degrees (0-180)
        #[arg(long)]
        angle: f32,
        /// How long to hold the target angle
        #[arg(long, default_value_t = 1000)]
        hold_ms: u64,
        #[arg(long, default_value_t = 0.0)]
        rest_angle: f32,
        #[arg(long, env = "LATCHKEY_PWM_CHIP", default_value_t = 0)]
        chip: u32,
        #[arg(long, env = "LATCHKEY_PWM_CHANNEL", default_value_t = 0)]
        channel: u32,
        /// Log the commands instead of driving hardware
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::CheckModels { model_dir } => {
            models::check(model_dir.unwrap_or_else(latchkey_core::default_model_dir))
        }
        Command::Gallery {
            gallery_dir,
            models,
            json,
        } => identify::list_gallery(&gallery_dir, &models, json),
        Command::Identify {
            image,
            gallery_dir,
            tolerance,
            models,
            json,
        } => identify::identify(&image, &gallery_dir, tolerance, &models, json),
        Command::Servo {
            angle,
            hold_ms,
            rest_angle,
            chip,
            channel,
            dry_run,
        } => servo::run(servo::Move {
            angle,
            rest_angle,
            hold: std::time::Duration::from_millis(hold_ms),
            chip,
            channel,
            dry_run,
        }),
    }
}
