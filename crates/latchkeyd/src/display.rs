//! Frame annotation and the display sinks that consume annotated frames.

use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use chrono::{SecondsFormat, Utc};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use latchkey_core::{BoundingBox, MatchResult};
use thiserror::Error;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const NAME_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const DISTANCE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const FPS_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_SCALE: f32 = 20.0;
const FPS_SCALE: f32 = 32.0;
const LABEL_OFFSET: i32 = 15;
const BOX_THICKNESS: i32 = 2;

const LATEST_FRAME: &str = "latest.jpg";
const STOP_FILE: &str = "stop";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("display I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("not a usable font: {0}")]
    Font(PathBuf),
}

/// What the loop should do after a frame has been presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    Stop,
}

/// Consumer of annotated frames.
pub trait FrameSink {
    fn present(&mut self, frame: &RgbImage) -> Result<SinkControl, SinkError>;

    /// Keep a copy of the frame that opened the gate.
    fn snapshot(&mut self, _frame: &RgbImage, _name: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Discards every frame.
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &RgbImage) -> Result<SinkControl, SinkError> {
        Ok(SinkControl::Continue)
    }
}

/// Writes frames into a directory.
///
/// `latest.jpg` is replaced atomically on every frame, so a viewer polling
/// the file never sees a torn image. Gate openings are kept as
/// `<rfc3339>_<name>.jpg`. Creating a file named `stop` in the directory
/// asks the loop to exit.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn create(dir: &Path) -> Result<Self, SinkError> {
        std::fs::create_dir_all(dir).map_err(|source| SinkError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        tracing::info!(dir = %dir.display(), "writing annotated frames");
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
        move |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl FrameSink for DirectorySink {
    fn present(&mut self, frame: &RgbImage) -> Result<SinkControl, SinkError> {
        let tmp = self.dir.join(".latest.jpg.tmp");
        let latest = self.dir.join(LATEST_FRAME);
        frame.save_with_format(&tmp, image::ImageFormat::Jpeg)?;
        std::fs::rename(&tmp, &latest).map_err(Self::io_err(&latest))?;

        let stop = self.dir.join(STOP_FILE);
        if stop.exists() {
            std::fs::remove_file(&stop).map_err(Self::io_err(&stop))?;
            tracing::info!("stop requested through display directory");
            return Ok(SinkControl::Stop);
        }
        Ok(SinkControl::Continue)
    }

    fn snapshot(&mut self, frame: &RgbImage, name: &str) -> Result<(), SinkError> {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let path = self.dir.join(format!("{stamp}_{}.jpg", sanitize(name)));
        frame.save_with_format(&path, image::ImageFormat::Jpeg)?;
        tracing::debug!(path = %path.display(), "snapshot saved");
        Ok(())
    }
}

/// Keep identity names safe to use as a filename component.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Draws boxes, labels and the frame rate onto frames.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Boxes only; text needs a font.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font_file(path: &Path) -> Result<Self, SinkError> {
        let bytes = std::fs::read(path).map_err(|source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let font = FontVec::try_from_vec(bytes).map_err(|_| SinkError::Font(path.to_path_buf()))?;
        Ok(Self { font: Some(font) })
    }

    /// Box around the face region, name under its bottom-left corner and
    /// distance under its bottom-right.
    pub fn draw_face(&self, frame: &mut RgbImage, region: &BoundingBox, result: &MatchResult) {
        for t in 0..BOX_THICKNESS {
            let (w, h) = (region.width() - 2 * t, region.height() - 2 * t);
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(region.left + t, region.top + t).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(frame, rect, BOX_COLOR);
        }

        let Some(font) = &self.font else {
            return;
        };
        let y = region.bottom - LABEL_OFFSET;
        let scale = PxScale::from(LABEL_SCALE);
        draw_text_mut(frame, NAME_COLOR, region.left, y, scale, font, &result.name);
        let distance = if result.distance.is_finite() {
            format!("{:.2}", result.distance)
        } else {
            "inf".to_string()
        };
        draw_text_mut(frame, DISTANCE_COLOR, region.right, y, scale, font, &distance);
    }

    pub fn draw_fps(&self, frame: &mut RgbImage, fps: f32) {
        if let Some(font) = &self.font {
            let text = format!("FPS {fps:.2}");
            draw_text_mut(frame, FPS_COLOR, 50, 50, PxScale::from(FPS_SCALE), font, &text);
        }
    }
}
