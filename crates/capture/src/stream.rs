//! The streaming session: negotiation, the steady-state capture loop and
//! teardown.
//!
//! A session walks `Idle → Negotiated → Streaming → Draining → Stopped`.
//! The steady state is one sequential loop: wait for readiness with a
//! bounded timeout, dequeue a filled buffer, convert, emit to the sink,
//! re-enqueue the same buffer. Cancellation is cooperative and only
//! observed between frames; a timeout with no data is not an error.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fbcast_convert::{convert_to_bgra, validate_geometry, ConvertError};
use fbcast_core::{CancelToken, Frame, FrameGeometry};
use tracing::{debug, info, trace, warn};

use crate::device::CaptureDevice;
use crate::ring::BufferRing;
use crate::sink::FrameSink;
use crate::CaptureError;

/// Default bound on one readiness wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiated,
    Streaming,
    Draining,
    Stopped,
}

pub struct CaptureSession<D: CaptureDevice, S: FrameSink> {
    device: D,
    sink: S,
    cancel: CancelToken,
    wait_timeout: Duration,
    state: SessionState,
    geometry: Option<FrameGeometry>,
    ring: Option<BufferRing>,
    frames_delivered: u64,
}

impl<D: CaptureDevice, S: FrameSink> CaptureSession<D, S> {
    pub fn new(device: D, sink: S, cancel: CancelToken) -> Self {
        Self {
            device,
            sink,
            cancel,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            state: SessionState::Idle,
            geometry: None,
            ring: None,
            frames_delivered: 0,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Geometry negotiated with the device, available once `negotiate` has
    /// succeeded.
    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.geometry
    }

    /// Idle → Negotiated: read the device's frame geometry and allocate
    /// and map the buffer ring. The queried geometry is ground truth.
    pub fn negotiate(&mut self, requested: u32) -> Result<(), CaptureError> {
        if self.state != SessionState::Idle {
            return Err(CaptureError::InvalidState("session already negotiated"));
        }

        let geometry = self.device.query_format()?;
        info!(
            width = geometry.width,
            height = geometry.height,
            format = %geometry.format,
            planes = geometry.plane_count,
            "negotiated device format"
        );
        // Geometry the converter cannot handle fails here, before any
        // buffer is mapped.
        validate_geometry(&geometry)?;

        let ring = BufferRing::allocate(&mut self.device, requested)?;
        info!(buffers = ring.len(), "buffer ring ready");

        self.geometry = Some(geometry);
        self.ring = Some(ring);
        self.state = SessionState::Negotiated;
        Ok(())
    }

    /// Negotiated → Streaming: hand every ring buffer to the device once,
    /// then start the stream. Starting twice is a programmer error.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match self.state {
            SessionState::Negotiated => {}
            SessionState::Streaming => {
                return Err(CaptureError::InvalidState("stream already started"))
            }
            _ => return Err(CaptureError::InvalidState("negotiate before starting")),
        }

        let ring = self
            .ring
            .as_mut()
            .ok_or(CaptureError::InvalidState("negotiate before starting"))?;
        let indices: Vec<u32> = ring.buffers().iter().map(|b| b.index()).collect();
        for index in indices {
            self.device.enqueue(index)?;
            ring.mark_queued(index)?;
        }

        self.device.set_streaming(true)?;
        self.state = SessionState::Streaming;
        debug!("streaming started");
        Ok(())
    }

    /// The steady-state loop. Runs until cancellation or a fatal error and
    /// leaves the session in `Draining` either way. Returns the number of
    /// frames delivered to the sink.
    pub fn run(&mut self) -> Result<u64, CaptureError> {
        if self.state != SessionState::Streaming {
            return Err(CaptureError::InvalidState("start the stream before running"));
        }

        let result = self.pump();
        self.state = SessionState::Draining;
        match &result {
            Ok(frames) => info!(frames, "streaming loop finished"),
            Err(err) => warn!(error = %err, "streaming loop aborted"),
        }
        result.map(|_| self.frames_delivered)
    }

    fn pump(&mut self) -> Result<u64, CaptureError> {
        let geometry = self
            .geometry
            .ok_or(CaptureError::InvalidState("start the stream before running"))?;
        let mut frames = 0u64;

        loop {
            // Cancellation is only observed here, never mid-frame.
            if self.cancel.is_cancelled() {
                debug!("cancellation observed, draining");
                return Ok(frames);
            }

            // A timeout is not an error; loop back to the cancellation
            // check and wait again.
            if !self.device.wait_ready(self.wait_timeout)? {
                trace!("readiness wait timed out");
                continue;
            }

            let dequeued = self.device.dequeue()?;
            let ring = self
                .ring
                .as_mut()
                .ok_or(CaptureError::InvalidState("negotiate before running"))?;
            ring.mark_ready(dequeued.index)?;

            let converted = {
                let ring = self
                    .ring
                    .as_ref()
                    .ok_or(CaptureError::InvalidState("negotiate before running"))?;
                let mut planes: Vec<&[u8]> = Vec::with_capacity(dequeued.bytes_used.len());
                for (plane, &used) in dequeued.bytes_used.iter().enumerate() {
                    let data = ring.plane_data(dequeued.index, plane)?;
                    planes.push(&data[..data.len().min(used as usize)]);
                }
                convert_to_bgra(&planes, &geometry)
            };

            match converted {
                Ok(bgra) => {
                    self.frames_delivered += 1;
                    let frame = Frame {
                        width: geometry.width,
                        height: geometry.height,
                        timestamp: SystemTime::now(),
                        sequence: self.frames_delivered,
                        data: Bytes::from(bgra),
                    };
                    self.sink.write_frame(&frame)?;
                    frames += 1;
                    trace!(
                        buffer = dequeued.index,
                        sequence = self.frames_delivered,
                        "frame delivered"
                    );
                }
                // Under-filled frame: drop it and carry on. The buffer is
                // still re-enqueued below.
                Err(ConvertError::ShortFrame {
                    plane,
                    expected,
                    actual,
                }) => {
                    warn!(
                        buffer = dequeued.index,
                        plane, expected, actual, "dropping short frame"
                    );
                }
                Err(err) => return Err(err.into()),
            }

            self.device.enqueue(dequeued.index)?;
            self.ring
                .as_mut()
                .ok_or(CaptureError::InvalidState("negotiate before running"))?
                .mark_queued(dequeued.index)?;
        }
    }

    /// Streaming/Draining → Stopped: stop the device stream and unmap the
    /// ring, exactly once. Stopping a session that never started streaming
    /// is a programmer error.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        match self.state {
            SessionState::Streaming | SessionState::Draining => {}
            _ => return Err(CaptureError::InvalidState("stop without a prior start")),
        }

        // Stream off first so the driver stops touching the mappings, then
        // release them. Unmapping is best effort.
        let stream_result = self.device.set_streaming(false);
        let release_result = self
            .ring
            .as_mut()
            .map(BufferRing::release_all)
            .unwrap_or(Ok(()));

        self.state = SessionState::Stopped;
        info!(frames = self.frames_delivered, "session stopped");

        stream_result?;
        release_result
    }
}
