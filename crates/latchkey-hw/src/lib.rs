//! latchkey-hw: the physical ends of the loop, frames in and servo pulses out.

pub mod camera;
pub mod replay;
pub mod servo;

pub use camera::{Camera, CameraError};
pub use replay::ImageDirSource;
pub use servo::{CommandLog, DryRunServo, Servo, ServoCommand, ServoError, SysfsPwmServo};

use image::RgbImage;

/// Produces successive RGB frames on demand.
pub trait FrameSource {
    /// Block until the next frame is available.
    ///
    /// `Ok(None)` means the stream is exhausted. `Err` is a failed grab;
    /// the caller decides whether to try again.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError>;
}
