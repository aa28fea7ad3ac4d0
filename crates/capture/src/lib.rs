//! Multi-planar frame capture pipeline.
//!
//! Drives a request/queue/dequeue capture device through a fixed ring of
//! memory-mapped buffers and delivers converted frames to a raw byte sink.
//! The pieces, leaf first:
//!
//! - [`ring`]: the buffer ring, mapped memory plus the per-buffer
//!   Unqueued/Queued/Ready ownership state machine.
//! - [`device`]: the [`device::CaptureDevice`] seam and its wire types.
//! - [`v4l2`]: the real device backend, raw V4L2 multi-planar ioctls.
//! - [`sink`]: framebuffer and file sinks for converted frames.
//! - [`stream`]: the session state machine and the steady-state capture
//!   loop.

use std::io;

use fbcast_convert::ConvertError;
use thiserror::Error;

pub mod device;
pub mod ring;
pub mod sink;
pub mod stream;
pub mod v4l2;

#[cfg(test)]
pub(crate) mod testutil;

pub use sink::SinkError;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// A queue-protocol or negotiation call failed at the device level.
    /// Fatal to the session; the queue relationship with the driver is not
    /// resumed after one of these.
    #[error("device error during {op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The device granted zero buffers for the ring.
    #[error("device granted no buffers (requested {requested})")]
    ResourceExhausted { requested: u32 },

    /// Establishing a shared mapping for one plane failed. Any mappings
    /// already established for the ring are unwound before this propagates.
    #[error("failed to map plane {plane} of buffer {buffer}: {source}")]
    MappingFailed {
        buffer: u32,
        plane: usize,
        #[source]
        source: io::Error,
    },

    /// The device reports a pixel format the converter has no path for.
    #[error(transparent)]
    UnsupportedFormat(#[from] fbcast_core::UnknownFourcc),

    /// Programmer misuse of the session or buffer state machine, e.g.
    /// starting a stream twice or reading a buffer the device still owns.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}
