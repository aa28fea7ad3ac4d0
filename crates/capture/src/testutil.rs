//! Scripted capture device used by the ring and streaming loop tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fbcast_core::{CancelToken, FrameGeometry, PixelFormat};

use crate::device::{BufferLayout, CaptureDevice, DequeuedFrame, PlaneDescriptor};
use crate::ring::PlaneMapping;
use crate::CaptureError;

/// In-memory device double. Grants a fixed number of buffers, backs plane
/// mappings with heap memory pre-filled with a black NV12 pattern, and
/// "fills" a queued buffer as soon as it is enqueued.
pub(crate) struct MockDevice {
    geometry: FrameGeometry,
    grant: u32,
    streaming: bool,
    queued: VecDeque<u32>,
    map_calls: usize,
    live_mappings: Arc<AtomicUsize>,
    fail_map_at: Option<usize>,
    fail_unmap_at: Option<usize>,
    fail_next_dequeue: bool,
    fail_next_enqueue: bool,
    short_frames: VecDeque<Vec<u32>>,
    cancel_on_wait: Option<CancelToken>,
    cancel_after_frames: Option<(CancelToken, u64)>,
    pub enqueue_calls: usize,
    pub dequeue_calls: usize,
    pub wait_calls: usize,
}

impl MockDevice {
    /// 4x4 NV12 device granting `grant` single-plane buffers of 24 bytes.
    pub fn nv12_4x4(grant: u32) -> Self {
        Self::with_size(4, 4, grant)
    }

    /// 3x3 NV12 device: odd geometry that negotiation must reject.
    pub fn nv12_3x3(grant: u32) -> Self {
        Self::with_size(3, 3, grant)
    }

    fn with_size(width: u32, height: u32, grant: u32) -> Self {
        Self {
            geometry: FrameGeometry {
                width,
                height,
                format: PixelFormat::Nv12,
                plane_count: 1,
            },
            grant,
            streaming: false,
            queued: VecDeque::new(),
            map_calls: 0,
            live_mappings: Arc::new(AtomicUsize::new(0)),
            fail_map_at: None,
            fail_unmap_at: None,
            fail_next_dequeue: false,
            fail_next_enqueue: false,
            short_frames: VecDeque::new(),
            cancel_on_wait: None,
            cancel_after_frames: None,
            enqueue_calls: 0,
            dequeue_calls: 0,
            wait_calls: 0,
        }
    }

    pub fn map_calls(&self) -> usize {
        self.map_calls
    }

    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }

    /// Fail the nth `map_plane` call (0-based).
    pub fn fail_map_at(&mut self, call: usize) {
        self.fail_map_at = Some(call);
    }

    /// Make the mapping produced by the nth `map_plane` call (0-based)
    /// refuse to unmap.
    pub fn fail_unmap_at(&mut self, call: usize) {
        self.fail_unmap_at = Some(call);
    }

    pub fn fail_next_dequeue(&mut self) {
        self.fail_next_dequeue = true;
    }

    pub fn fail_next_enqueue(&mut self) {
        self.fail_next_enqueue = true;
    }

    /// Make the next dequeue report the given per-plane byte counts
    /// instead of the full plane size.
    pub fn push_bytes_used(&mut self, bytes_used: Vec<u32>) {
        self.short_frames.push_back(bytes_used);
    }

    /// Simulate a cancellation signal arriving while the loop is parked in
    /// the readiness wait: the wait times out and the token is set.
    pub fn cancel_on_wait(&mut self, token: CancelToken) {
        self.cancel_on_wait = Some(token);
    }

    /// Set the token after `frames` successful dequeues.
    pub fn cancel_after_frames(&mut self, token: CancelToken, frames: u64) {
        self.cancel_after_frames = Some((token, frames));
    }

    fn plane_sizes(&self) -> Vec<usize> {
        self.geometry.plane_sizes()
    }
}

impl CaptureDevice for MockDevice {
    fn query_format(&mut self) -> Result<FrameGeometry, CaptureError> {
        Ok(self.geometry)
    }

    fn request_buffers(&mut self, count: u32) -> Result<Vec<BufferLayout>, CaptureError> {
        let accepted = count.min(self.grant);
        let sizes = self.plane_sizes();
        Ok((0..accepted)
            .map(|index| BufferLayout {
                index,
                planes: sizes
                    .iter()
                    .enumerate()
                    .map(|(plane, &len)| PlaneDescriptor {
                        length: len as u32,
                        mem_offset: index * 0x1000 + plane as u32 * 0x100,
                    })
                    .collect(),
            })
            .collect())
    }

    fn map_plane(&mut self, plane: &PlaneDescriptor) -> Result<PlaneMapping, io::Error> {
        let call = self.map_calls;
        self.map_calls += 1;
        if self.fail_map_at == Some(call) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        // Black NV12: luma 16, chroma 128. The luma span of the 4x4 test
        // layout is the first 16 bytes of the 24-byte plane.
        let len = plane.length as usize;
        let mut data = vec![128u8; len];
        let luma = (self.geometry.width * self.geometry.height) as usize;
        for byte in data.iter_mut().take(luma.min(len)) {
            *byte = 16;
        }
        if self.fail_unmap_at == Some(call) {
            return Ok(PlaneMapping::anonymous_failing(
                data.into_boxed_slice(),
                Arc::clone(&self.live_mappings),
            ));
        }
        Ok(PlaneMapping::anonymous_tracked(
            data.into_boxed_slice(),
            Arc::clone(&self.live_mappings),
        ))
    }

    fn enqueue(&mut self, index: u32) -> Result<(), CaptureError> {
        self.enqueue_calls += 1;
        if self.fail_next_enqueue {
            self.fail_next_enqueue = false;
            return Err(CaptureError::Device {
                op: "enqueue",
                source: io::Error::from_raw_os_error(libc::EIO),
            });
        }
        if self.queued.contains(&index) {
            return Err(CaptureError::Device {
                op: "enqueue",
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> Result<bool, CaptureError> {
        self.wait_calls += 1;
        if let Some(token) = &self.cancel_on_wait {
            token.cancel();
            return Ok(false);
        }
        Ok(self.streaming && !self.queued.is_empty())
    }

    fn dequeue(&mut self) -> Result<DequeuedFrame, CaptureError> {
        self.dequeue_calls += 1;
        if self.fail_next_dequeue {
            self.fail_next_dequeue = false;
            return Err(CaptureError::Device {
                op: "dequeue",
                source: io::Error::from_raw_os_error(libc::EIO),
            });
        }
        let index = self.queued.pop_front().ok_or(CaptureError::Device {
            op: "dequeue",
            source: io::Error::from_raw_os_error(libc::EAGAIN),
        })?;
        let bytes_used = self
            .short_frames
            .pop_front()
            .unwrap_or_else(|| self.plane_sizes().iter().map(|&s| s as u32).collect());
        if let Some((token, frames)) = &mut self.cancel_after_frames {
            *frames -= 1;
            if *frames == 0 {
                token.cancel();
            }
        }
        Ok(DequeuedFrame { index, bytes_used })
    }

    fn set_streaming(&mut self, on: bool) -> Result<(), CaptureError> {
        self.streaming = on;
        Ok(())
    }
}
