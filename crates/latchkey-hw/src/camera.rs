//! V4L2 camera capture.

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::FrameSource;

const BUFFER_COUNT: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("cannot open camera {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported pixel format {0} (need YUYV, RGB3 or MJPG)")]
    UnsupportedFormat(String),
    #[error("frame too short: expected {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },
    #[error("cannot decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Yuyv,
    Rgb3,
    Mjpg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb3),
            b"MJPG" => Some(Self::Mjpg),
            _ => None,
        }
    }
}

/// Memory-mapped V4L2 capture at the device's current resolution.
///
/// The device handle is shared with the stream and closed when the camera
/// is dropped.
pub struct Camera {
    stream: Stream<'static>,
    format: PixelFormat,
    stride: usize,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
}

impl Camera {
    /// Open the device and ask for YUYV; the driver may settle on another
    /// supported format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let mut device = Device::with_path(device_path).map_err(|source| CameraError::Open {
            path: device_path.to_string(),
            source,
        })?;

        let mut requested = device.format()?;
        requested.fourcc = FourCC::new(b"YUYV");
        let format = device.set_format(&requested)?;

        let pixel_format = PixelFormat::from_fourcc(format.fourcc)
            .ok_or_else(|| CameraError::UnsupportedFormat(format.fourcc.to_string()))?;

        let stream = Stream::with_buffers(&mut device, Type::VideoCapture, BUFFER_COUNT)?;

        Ok(Self {
            stream,
            format: pixel_format,
            stride: format.stride as usize,
            width: format.width,
            height: format.height,
            fourcc: format.fourcc,
        })
    }

    /// Grab and convert one frame.
    pub fn capture_frame(&mut self) -> Result<RgbImage, CameraError> {
        let (buf, meta) = CaptureStream::next(&mut self.stream)?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = &buf[..used];
        match self.format {
            PixelFormat::Yuyv => yuyv_to_rgb(data, self.width, self.height, self.stride),
            PixelFormat::Rgb3 => rgb3_to_rgb(data, self.width, self.height, self.stride),
            PixelFormat::Mjpg => {
                Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8())
            }
        }
    }

    /// Drop `count` frames while exposure settles.
    pub fn discard(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.capture_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
        self.capture_frame().map(Some)
    }
}

/// BT.601 YUYV 4:2:2 to packed RGB. `stride` of 0 means tightly packed.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: usize) -> Result<RgbImage, CameraError> {
    let row_bytes = width as usize * 2;
    let stride = if stride == 0 { row_bytes } else { stride };
    let expected = stride * (height as usize).saturating_sub(1) + row_bytes;
    if height == 0 || data.len() < expected {
        return Err(CameraError::ShortFrame {
            expected,
            got: data.len(),
        });
    }

    let mut out = RgbImage::new(width, height);
    for y in 0..height as usize {
        let row = &data[y * stride..y * stride + row_bytes];
        for (pair, px) in row.chunks_exact(4).enumerate() {
            let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
            let x = (pair * 2) as u32;
            out.put_pixel(x, y as u32, image::Rgb(yuv_to_rgb(y0, u, v)));
            if x + 1 < width {
                out.put_pixel(x + 1, y as u32, image::Rgb(yuv_to_rgb(y1, u, v)));
            }
        }
    }
    Ok(out)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

fn rgb3_to_rgb(data: &[u8], width: u32, height: u32, stride: usize) -> Result<RgbImage, CameraError> {
    let row_bytes = width as usize * 3;
    let stride = if stride == 0 { row_bytes } else { stride };
    let expected = stride * (height as usize).saturating_sub(1) + row_bytes;
    if height == 0 || data.len() < expected {
        return Err(CameraError::ShortFrame {
            expected,
            got: data.len(),
        });
    }

    let mut raw = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        raw.extend_from_slice(&data[y * stride..y * stride + row_bytes]);
    }
    RgbImage::from_raw(width, height, raw).ok_or(CameraError::ShortFrame {
        expected,
        got: data.len(),
    })
}
