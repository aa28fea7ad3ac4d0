//! Shared types for the capture pipeline.
//!
//! Leaf definitions used by every other crate: pixel formats, negotiated
//! frame geometry, converted output frames and the cooperative cancellation
//! token consulted by the streaming loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

/// A fourcc tag that does not map to any format the pipeline understands.
///
/// Negotiation treats this as fatal: passing unrecognized raw bytes through
/// to a sink would corrupt the display, so there is no default fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unrecognized pixel format fourcc {}", fourcc_string(.0))]
pub struct UnknownFourcc(pub [u8; 4]);

/// Printable rendering of a fourcc tag; non-printable bytes are escaped.
fn fourcc_string(fourcc: &[u8; 4]) -> String {
    let mut out = String::with_capacity(4);
    for &b in fourcc {
        if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}

/// Pixel formats the pipeline can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Full-resolution luma plane followed by half-resolution interleaved
    /// CbCr. May arrive as one contiguous plane or as two device planes.
    Nv12,
    /// Planar YUV 4:2:0 (I420): Y, then U, then V.
    Yuv420,
    /// 4 bytes per pixel, blue-green-red-alpha. Passthrough on conversion.
    Bgra,
}

impl PixelFormat {
    /// Convert from V4L2 fourcc bytes to PixelFormat.
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Result<Self, UnknownFourcc> {
        match fourcc {
            b"NV12" => Ok(PixelFormat::Nv12),
            b"YU12" | b"I420" => Ok(PixelFormat::Yuv420),
            b"BA24" | b"AR24" => Ok(PixelFormat::Bgra),
            other => Err(UnknownFourcc(*other)),
        }
    }

    pub fn to_fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yuv420 => *b"YU12",
            PixelFormat::Bgra => *b"BA24",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&fourcc_string(&self.to_fourcc()))
    }
}

/// Frame geometry negotiated with the device at session start.
///
/// Set once from the device's reported format and immutable for the
/// session's lifetime; there is no mid-stream resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Number of device planes per buffer (1 for contiguous variants).
    pub plane_count: u32,
}

impl FrameGeometry {
    /// Byte size of each device plane implied by this geometry.
    ///
    /// For single-plane layouts the whole frame lives in plane 0; NV12
    /// split across two planes has a full-size luma plane and a half-size
    /// chroma plane.
    pub fn plane_sizes(&self) -> Vec<usize> {
        let pixels = self.width as usize * self.height as usize;
        match (self.format, self.plane_count) {
            (PixelFormat::Nv12, 2) => vec![pixels, pixels / 2],
            (PixelFormat::Nv12, _) | (PixelFormat::Yuv420, _) => vec![pixels * 3 / 2],
            (PixelFormat::Bgra, _) => vec![pixels * 4],
        }
    }

    /// Size in bytes of one converted BGRA output frame.
    pub fn output_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// A converted, display-ready frame handed to a sink.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub timestamp: SystemTime,
    pub sequence: u64,
    /// BGRA payload, `width * height * 4` bytes.
    pub data: Bytes,
}

/// Cooperative cancellation flag shared between a signal handler and the
/// streaming loop.
///
/// The loop consults it at iteration boundaries only; in-flight conversion
/// or sink I/O is always allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
