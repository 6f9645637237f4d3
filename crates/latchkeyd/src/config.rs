use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use latchkey_core::detector::{DetectorError, StageThresholds, DEFAULT_MIN_FACE_SIZE};
use latchkey_core::{TensorLayout, DEFAULT_TOLERANCE};
use latchkey_hw::servo::MAX_ANGLE;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("LATCHKEY_TOLERANCE must be a non-negative number, got {0}")]
    Tolerance(f32),
    #[error("LATCHKEY_{name} must lie in 0-180 degrees, got {value}")]
    Angle { name: &'static str, value: f32 },
    #[error("LATCHKEY_DETECT_THRESHOLDS: {0}")]
    Thresholds(#[from] DetectorError),
    #[error("LATCHKEY_MIN_FACE_SIZE must be at least 12 pixels, got {0}")]
    MinFaceSize(u32),
}

/// Which actuator backend drives the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServoBackend {
    /// Linux sysfs PWM channel.
    #[default]
    Pwm,
    /// Log commands only.
    DryRun,
}

impl FromStr for ServoBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pwm" => Ok(Self::Pwm),
            "dry-run" | "dryrun" | "none" => Ok(Self::DryRun),
            other => Err(format!("unknown servo backend '{other}'")),
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Replay still images from this directory instead of opening the camera.
    pub frame_dir: Option<PathBuf>,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Enrollment directory, one reference image per identity.
    pub gallery_dir: PathBuf,
    /// Maximum Euclidean distance accepted as a positive identification.
    pub tolerance: f32,
    /// Raw per-stage detector thresholds; range-checked by [`Config::validate`].
    pub detect_thresholds: [f32; 3],
    pub min_face_size: u32,
    pub encoder_layout: TensorLayout,
    pub servo: ServoBackend,
    pub pwm_chip: u32,
    pub pwm_channel: u32,
    pub open_angle: f32,
    pub rest_angle: f32,
    /// How long the gate stays open after a trigger.
    pub dwell: Duration,
    /// How long re-triggering is suppressed after the gate closes.
    pub cooldown: Duration,
    /// Write annotated frames here when set.
    pub display_dir: Option<PathBuf>,
    /// TrueType font for annotation text. Without one only boxes are drawn.
    pub font_path: Option<PathBuf>,
    /// Stop after this many frames; 0 runs until signalled.
    pub max_frames: u64,
    /// Consecutive failed grabs tolerated before the loop gives up.
    pub max_grab_failures: u32,
    /// Frames discarded after opening the camera (AGC/AE settling).
    pub warmup_frames: usize,
}

impl Config {
    /// Load configuration from `LATCHKEY_*` environment variables with defaults.
    ///
    /// Unparseable values fall back to their default; parseable but
    /// out-of-range values are caught by [`Config::validate`].
    pub fn from_env() -> Self {
        let model_dir = std::env::var("LATCHKEY_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| latchkey_core::default_model_dir());

        Self {
            camera_device: std::env::var("LATCHKEY_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            frame_dir: env_path("LATCHKEY_FRAME_DIR"),
            model_dir,
            gallery_dir: env_path("LATCHKEY_GALLERY_DIR")
                .unwrap_or_else(|| PathBuf::from("./face_dataset")),
            tolerance: env_parse("LATCHKEY_TOLERANCE", DEFAULT_TOLERANCE),
            detect_thresholds: env_thresholds("LATCHKEY_DETECT_THRESHOLDS", [0.5, 0.8, 0.9]),
            min_face_size: env_parse("LATCHKEY_MIN_FACE_SIZE", DEFAULT_MIN_FACE_SIZE),
            encoder_layout: env_parse("LATCHKEY_ENCODER_LAYOUT", TensorLayout::Nhwc),
            servo: env_parse("LATCHKEY_SERVO", ServoBackend::Pwm),
            pwm_chip: env_parse("LATCHKEY_PWM_CHIP", 0),
            pwm_channel: env_parse("LATCHKEY_PWM_CHANNEL", 0),
            open_angle: env_parse("LATCHKEY_OPEN_ANGLE", 180.0),
            rest_angle: env_parse("LATCHKEY_REST_ANGLE", 0.0),
            dwell: Duration::from_millis(env_parse("LATCHKEY_DWELL_MS", 4000)),
            cooldown: Duration::from_millis(env_parse("LATCHKEY_COOLDOWN_MS", 1000)),
            display_dir: env_path("LATCHKEY_DISPLAY_DIR"),
            font_path: env_path("LATCHKEY_FONT_PATH"),
            max_frames: env_parse("LATCHKEY_MAX_FRAMES", 0),
            max_grab_failures: env_parse("LATCHKEY_MAX_GRAB_FAILURES", 30),
            warmup_frames: env_parse("LATCHKEY_WARMUP_FRAMES", 4),
        }
    }

    /// Reject values that parsed but make no sense. Run before touching hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance >= 0.0) {
            return Err(ConfigError::Tolerance(self.tolerance));
        }
        for (name, value) in [("OPEN_ANGLE", self.open_angle), ("REST_ANGLE", self.rest_angle)] {
            if !(0.0..=MAX_ANGLE).contains(&value) {
                return Err(ConfigError::Angle { name, value });
            }
        }
        // P-Net's receptive field is 12 px; anything smaller makes the pyramid scale > 1.
        if self.min_face_size < 12 {
            return Err(ConfigError::MinFaceSize(self.min_face_size));
        }
        self.stage_thresholds()?;
        Ok(())
    }

    pub fn stage_thresholds(&self) -> Result<StageThresholds, ConfigError> {
        Ok(StageThresholds::new(self.detect_thresholds)?)
    }

    pub fn pnet_path(&self) -> String {
        self.model_path(latchkey_models::PNET)
    }

    pub fn rnet_path(&self) -> String {
        self.model_path(latchkey_models::RNET)
    }

    pub fn onet_path(&self) -> String {
        self.model_path(latchkey_models::ONET)
    }

    pub fn facenet_path(&self) -> String {
        self.model_path(latchkey_models::FACENET)
    }

    fn model_path(&self, name: &str) -> String {
        self.model_dir.join(name).to_string_lossy().into_owned()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// `"a,b,c"` as three floats; range is not checked here.
fn env_thresholds(key: &str, default: [f32; 3]) -> [f32; 3] {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_triple(&v))
        .unwrap_or(default)
}

fn parse_triple(s: &str) -> Option<[f32; 3]> {
    let values = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().ok())
        .collect::<Option<Vec<_>>>()?;
    values.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config {
            camera_device: "/dev/video0".into(),
            frame_dir: None,
            model_dir: PathBuf::from("/tmp/models"),
            gallery_dir: PathBuf::from("./face_dataset"),
            tolerance: DEFAULT_TOLERANCE,
            detect_thresholds: [0.5, 0.8, 0.9],
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            encoder_layout: TensorLayout::Nhwc,
            servo: ServoBackend::Pwm,
            pwm_chip: 0,
            pwm_channel: 0,
            open_angle: 180.0,
            rest_angle: 0.0,
            dwell: Duration::from_millis(4000),
            cooldown: Duration::from_millis(1000),
            display_dir: None,
            font_path: None,
            max_frames: 0,
            max_grab_failures: 30,
            warmup_frames: 4,
        }
    }

    #[test]
    fn test_defaults_validate() {
        defaults().validate().unwrap();
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut c = defaults();
        c.tolerance = -0.1;
        assert!(matches!(c.validate(), Err(ConfigError::Tolerance(_))));

        let mut c = defaults();
        c.open_angle = 270.0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Angle { name: "OPEN_ANGLE", .. })
        ));

        let mut c = defaults();
        c.detect_thresholds = [0.5, 1.5, 0.9];
        assert!(matches!(c.validate(), Err(ConfigError::Thresholds(_))));

        let mut c = defaults();
        c.tolerance = f32::NAN;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_parse_triple() {
        assert_eq!(parse_triple("0.6, 0.7,0.8"), Some([0.6, 0.7, 0.8]));
        assert_eq!(parse_triple("0.6,0.7"), None);
        assert_eq!(parse_triple("a,b,c"), None);
    }

    #[test]
    fn test_servo_backend_parse() {
        assert_eq!("PWM".parse::<ServoBackend>().unwrap(), ServoBackend::Pwm);
        assert_eq!("dry-run".parse::<ServoBackend>().unwrap(), ServoBackend::DryRun);
        assert!("gpio".parse::<ServoBackend>().is_err());
    }

    #[test]
    fn test_model_paths() {
        let c = defaults();
        assert_eq!(c.pnet_path(), "/tmp/models/pnet.onnx");
        assert_eq!(c.facenet_path(), "/tmp/models/facenet.onnx");
    }
}
