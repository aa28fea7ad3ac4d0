//! The capture device seam.
//!
//! [`CaptureDevice`] is the narrow interface the pipeline needs from a
//! kernel-managed capture source: negotiate geometry, reserve buffer slots,
//! map plane memory, move buffers across the queue boundary and toggle
//! streaming. [`crate::v4l2::V4l2Device`] implements it with raw ioctls;
//! tests drive the pipeline with a scripted double.

use std::io;
use std::time::Duration;

use fbcast_core::FrameGeometry;

use crate::ring::PlaneMapping;
use crate::CaptureError;

/// Byte length and device-side mapping offset of one plane of one buffer.
/// Immutable after buffer negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDescriptor {
    pub length: u32,
    pub mem_offset: u32,
}

/// Per-buffer plane layout reported by the device during negotiation.
#[derive(Debug, Clone)]
pub struct BufferLayout {
    /// Stable index matching the device's own buffer numbering.
    pub index: u32,
    pub planes: Vec<PlaneDescriptor>,
}

/// A filled buffer handed back by the device.
#[derive(Debug, Clone)]
pub struct DequeuedFrame {
    pub index: u32,
    /// Bytes the driver actually wrote into each plane. May be less than
    /// the mapped plane length.
    pub bytes_used: Vec<u32>,
}

pub trait CaptureDevice {
    /// Read the negotiated frame geometry. Called once at session start;
    /// the result is ground truth for the rest of the session.
    fn query_format(&mut self) -> Result<FrameGeometry, CaptureError>;

    /// Reserve up to `count` buffer slots and report the plane layout of
    /// each slot actually granted. The returned length is the accepted
    /// count and may be smaller than `count`; zero-length is reported as is
    /// and turned into `ResourceExhausted` by the ring.
    fn request_buffers(&mut self, count: u32) -> Result<Vec<BufferLayout>, CaptureError>;

    /// Establish the shared memory mapping for one plane. The ring
    /// attributes a failure to its buffer and plane index.
    fn map_plane(&mut self, plane: &PlaneDescriptor) -> Result<PlaneMapping, io::Error>;

    /// Hand a buffer to the device for filling.
    fn enqueue(&mut self, index: u32) -> Result<(), CaptureError>;

    /// Block until a queued buffer is ready or the timeout elapses.
    /// `Ok(false)` is a timeout, not an error; an `Err` is fatal.
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool, CaptureError>;

    /// Take the oldest filled buffer back from the device. Only called
    /// after `wait_ready` reported data.
    fn dequeue(&mut self) -> Result<DequeuedFrame, CaptureError>;

    /// Toggle the device's streaming state.
    fn set_streaming(&mut self, on: bool) -> Result<(), CaptureError>;
}
