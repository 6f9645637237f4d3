//! Hobby servo driven by a 50 Hz PWM signal.
//!
//! Pulse width maps linearly onto the horn angle: 2.5 % duty (0.5 ms) is 0°,
//! 12.5 % duty (2.5 ms) is 180°.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

/// 50 Hz carrier.
pub const PERIOD_NS: u64 = 20_000_000;
pub const MAX_ANGLE: f32 = 180.0;

const SYSFS_PWM_ROOT: &str = "/sys/class/pwm";
const EXPORT_POLL: Duration = Duration::from_millis(10);
const EXPORT_ATTEMPTS: u32 = 50;

#[derive(Error, Debug)]
pub enum ServoError {
    #[error("angle {0} outside 0-180 degrees")]
    AngleOutOfRange(f32),
    #[error("PWM chip not found: {0}")]
    ChipNotFound(PathBuf),
    #[error("PWM channel {0} did not appear after export")]
    ExportTimeout(PathBuf),
    #[error("PWM write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts angle commands. Commands are fire-and-forget: success means the
/// signal was set, not that the horn reached the angle.
pub trait Servo: Send {
    fn set_angle(&mut self, degrees: f32) -> Result<(), ServoError>;

    /// Stop emitting pulses, leaving the servo unpowered in place.
    fn release(&mut self) -> Result<(), ServoError>;
}

impl<S: Servo + ?Sized> Servo for Box<S> {
    fn set_angle(&mut self, degrees: f32) -> Result<(), ServoError> {
        (**self).set_angle(degrees)
    }

    fn release(&mut self) -> Result<(), ServoError> {
        (**self).release()
    }
}

/// Duty cycle in percent for an angle.
pub fn duty_percent(degrees: f32) -> f32 {
    2.5 + degrees / 360.0 * 20.0
}

fn duty_ns(degrees: f32) -> u64 {
    (PERIOD_NS as f64 * duty_percent(degrees) as f64 / 100.0).round() as u64
}

fn check_angle(degrees: f32) -> Result<(), ServoError> {
    if !(0.0..=MAX_ANGLE).contains(&degrees) {
        return Err(ServoError::AngleOutOfRange(degrees));
    }
    Ok(())
}

/// Servo on a Linux sysfs PWM channel (`/sys/class/pwm/pwmchipN/pwmM`).
pub struct SysfsPwmServo {
    chip_dir: PathBuf,
    pwm_dir: PathBuf,
    channel: u32,
    exported_here: bool,
}

impl SysfsPwmServo {
    pub fn open(chip: u32, channel: u32) -> Result<Self, ServoError> {
        Self::open_at(Path::new(SYSFS_PWM_ROOT), chip, channel)
    }

    /// Open under an alternative sysfs root.
    pub fn open_at(root: &Path, chip: u32, channel: u32) -> Result<Self, ServoError> {
        let chip_dir = root.join(format!("pwmchip{chip}"));
        if !chip_dir.is_dir() {
            return Err(ServoError::ChipNotFound(chip_dir));
        }
        let pwm_dir = chip_dir.join(format!("pwm{channel}"));

        let mut exported_here = false;
        if !pwm_dir.is_dir() {
            write_attr(&chip_dir.join("export"), &channel.to_string())?;
            exported_here = true;
            // udev may need a moment to create the node and fix permissions.
            let mut attempts = 0;
            while !pwm_dir.join("enable").exists() {
                attempts += 1;
                if attempts > EXPORT_ATTEMPTS {
                    return Err(ServoError::ExportTimeout(pwm_dir));
                }
                std::thread::sleep(EXPORT_POLL);
            }
        }

        let servo = Self {
            chip_dir,
            pwm_dir,
            channel,
            exported_here,
        };
        // Duty must never exceed the period, so zero it before resizing.
        servo.write("duty_cycle", "0")?;
        servo.write("period", &PERIOD_NS.to_string())?;
        servo.write("enable", "1")?;
        tracing::info!(pwm = %servo.pwm_dir.display(), "servo PWM enabled at 50 Hz");
        Ok(servo)
    }

    fn write(&self, attr: &str, value: &str) -> Result<(), ServoError> {
        write_attr(&self.pwm_dir.join(attr), value)
    }
}

impl Servo for SysfsPwmServo {
    fn set_angle(&mut self, degrees: f32) -> Result<(), ServoError> {
        check_angle(degrees)?;
        let duty = duty_ns(degrees);
        tracing::debug!(degrees, duty_ns = duty, "servo command");
        self.write("enable", "1")?;
        self.write("duty_cycle", &duty.to_string())
    }

    fn release(&mut self) -> Result<(), ServoError> {
        self.write("duty_cycle", "0")?;
        self.write("enable", "0")
    }
}

impl Drop for SysfsPwmServo {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "servo release on drop failed");
        }
        if self.exported_here {
            if let Err(e) = write_attr(&self.chip_dir.join("unexport"), &self.channel.to_string()) {
                tracing::warn!(error = %e, "PWM unexport failed");
            }
        }
    }
}

fn write_attr(path: &Path, value: &str) -> Result<(), ServoError> {
    fs::write(path, value).map_err(|source| ServoError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// A command as seen by a [`DryRunServo`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoCommand {
    Angle(f32),
    Release,
}

/// Shared view of the commands a [`DryRunServo`] has received.
pub type CommandLog = Arc<Mutex<Vec<ServoCommand>>>;

/// Logs commands instead of driving hardware.
pub struct DryRunServo {
    log: CommandLog,
}

impl DryRunServo {
    pub fn new() -> (Self, CommandLog) {
        let log = CommandLog::default();
        (Self { log: log.clone() }, log)
    }

    fn record(&self, command: ServoCommand) {
        if let Ok(mut log) = self.log.lock() {
            log.push(command);
        }
    }
}

impl Servo for DryRunServo {
    fn set_angle(&mut self, degrees: f32) -> Result<(), ServoError> {
        check_angle(degrees)?;
        tracing::info!(degrees, duty_percent = duty_percent(degrees), "dry-run servo command");
        self.record(ServoCommand::Angle(degrees));
        Ok(())
    }

    fn release(&mut self) -> Result<(), ServoError> {
        tracing::info!("dry-run servo released");
        self.record(ServoCommand::Release);
        Ok(())
    }
}
