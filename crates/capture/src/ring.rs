//! The buffer ring: mapped memory and buffer ownership bookkeeping.
//!
//! A [`BufferRing`] owns exactly the buffers the device granted and every
//! mapped plane region of every buffer. Mappings are established once,
//! immediately after negotiation, and torn down exactly once at shutdown.
//!
//! Each buffer is always in exactly one of three ownership states. `Queued`
//! means the device owns the memory and the application must not touch it;
//! that rule is enforced here by refusing to hand out plane data for
//! anything but a `Ready` buffer.

use std::io;

use tracing::{debug, warn};

use crate::device::{BufferLayout, CaptureDevice, PlaneDescriptor};
use crate::CaptureError;

/// Ownership of one buffer's memory at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Mapped but not yet handed to the device.
    Unqueued,
    /// Owned by the device; may be filled asynchronously at any time.
    Queued,
    /// Dequeued, filled with valid data, exclusively ours until re-queued.
    Ready,
}

/// One mapped plane region. Backed either by a device mapping (`mmap`) or,
/// for the test double, by anonymous heap memory.
#[derive(Debug)]
pub struct PlaneMapping {
    backing: Backing,
}

#[derive(Debug)]
enum Backing {
    Device {
        ptr: *mut libc::c_void,
        len: usize,
    },
    Heap {
        data: Box<[u8]>,
        /// Live-mapping counter, decremented on unmap so tests can assert
        /// that teardown really released everything.
        live: Option<std::sync::Arc<std::sync::atomic::AtomicUsize>>,
    },
    /// Heap region whose unmap always fails, exercising the
    /// continue-past-failure path of `release_all`.
    #[cfg(test)]
    FailingHeap {
        data: Box<[u8]>,
        live: Option<std::sync::Arc<std::sync::atomic::AtomicUsize>>,
    },
    Released,
}

// The device-backed pointer is only ever dereferenced through &self/&mut
// self, and the ring is confined to the session's single thread of control.
unsafe impl Send for PlaneMapping {}

impl PlaneMapping {
    /// Wrap a region returned by `mmap`. The pointer must be valid for
    /// `len` bytes until `unmap` is called.
    pub(crate) fn from_device(ptr: *mut libc::c_void, len: usize) -> Self {
        Self {
            backing: Backing::Device { ptr, len },
        }
    }

    /// Heap-backed region standing in for device memory in tests.
    pub fn anonymous(data: Box<[u8]>) -> Self {
        Self {
            backing: Backing::Heap { data, live: None },
        }
    }

    /// Heap-backed region that decrements `live` when unmapped.
    pub(crate) fn anonymous_tracked(
        data: Box<[u8]>,
        live: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Self {
            backing: Backing::Heap {
                data,
                live: Some(live),
            },
        }
    }

    /// Heap-backed region whose unmap fails, for teardown tests.
    #[cfg(test)]
    pub(crate) fn anonymous_failing(
        data: Box<[u8]>,
        live: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Self {
            backing: Backing::FailingHeap {
                data,
                live: Some(live),
            },
        }
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Device { len, .. } => *len,
            Backing::Heap { data, .. } => data.len(),
            #[cfg(test)]
            Backing::FailingHeap { data, .. } => data.len(),
            Backing::Released => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Device { ptr, len } => unsafe {
                std::slice::from_raw_parts(*ptr as *const u8, *len)
            },
            Backing::Heap { data, .. } => data,
            #[cfg(test)]
            Backing::FailingHeap { data, .. } => data,
            Backing::Released => &[],
        }
    }

    /// Address of the region, used only to verify mappings do not alias.
    fn addr(&self) -> usize {
        match &self.backing {
            Backing::Device { ptr, .. } => *ptr as usize,
            Backing::Heap { data, .. } => data.as_ptr() as usize,
            #[cfg(test)]
            Backing::FailingHeap { data, .. } => data.as_ptr() as usize,
            Backing::Released => 0,
        }
    }

    /// Tear the mapping down. Safe to call more than once; only the first
    /// call does work.
    fn unmap(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.backing, Backing::Released) {
            Backing::Device { ptr, len } => {
                let ret = unsafe { libc::munmap(ptr, len) };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }
            Backing::Heap { data, live } => {
                drop(data);
                if let Some(live) = live {
                    live.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                }
                Ok(())
            }
            // The region stays in place and stays counted as live so the
            // failure is observable from outside.
            #[cfg(test)]
            Backing::FailingHeap { data, live } => {
                self.backing = Backing::FailingHeap { data, live };
                Err(io::Error::from_raw_os_error(libc::EINVAL))
            }
            Backing::Released => Ok(()),
        }
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        let _ = self.unmap();
    }
}

/// One ring slot: the device's buffer index, its negotiated plane layout,
/// the mapped regions and the current ownership state.
#[derive(Debug)]
pub struct Buffer {
    index: u32,
    planes: Vec<PlaneDescriptor>,
    mappings: Vec<PlaneMapping>,
    state: BufferState,
}

impl Buffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn planes(&self) -> &[PlaneDescriptor] {
        &self.planes
    }

    pub fn state(&self) -> BufferState {
        self.state
    }
}

#[derive(Debug)]
pub struct BufferRing {
    buffers: Vec<Buffer>,
    released: bool,
}

impl BufferRing {
    /// Reserve buffer slots with the device and map every plane of every
    /// granted buffer.
    ///
    /// The accepted count, not the requested count, sizes the ring. If the
    /// device grants nothing this is `ResourceExhausted` and no mapping is
    /// attempted. If any single plane fails to map, every mapping already
    /// established is unwound before the error propagates.
    pub fn allocate<D: CaptureDevice>(
        device: &mut D,
        requested: u32,
    ) -> Result<Self, CaptureError> {
        let layouts = device.request_buffers(requested)?;
        if layouts.is_empty() {
            return Err(CaptureError::ResourceExhausted { requested });
        }
        let accepted = layouts.len();

        let mut buffers: Vec<Buffer> = Vec::with_capacity(accepted);
        for layout in &layouts {
            match Self::map_buffer(device, layout) {
                Ok(mappings) => buffers.push(Buffer {
                    index: layout.index,
                    planes: layout.planes.clone(),
                    mappings,
                    state: BufferState::Unqueued,
                }),
                Err(err) => {
                    // Unwind everything mapped so far; no leaked mapping
                    // may survive a failed setup.
                    for buffer in &mut buffers {
                        for mapping in &mut buffer.mappings {
                            if let Err(unmap_err) = mapping.unmap() {
                                warn!(
                                    buffer = buffer.index,
                                    error = %unmap_err,
                                    "failed to unwind mapping after setup error"
                                );
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }

        debug!(requested, accepted, "buffer ring mapped");
        Ok(Self {
            buffers,
            released: false,
        })
    }

    fn map_buffer<D: CaptureDevice>(
        device: &mut D,
        layout: &BufferLayout,
    ) -> Result<Vec<PlaneMapping>, CaptureError> {
        let mut mappings = Vec::with_capacity(layout.planes.len());
        for (plane_index, plane) in layout.planes.iter().enumerate() {
            match device.map_plane(plane) {
                Ok(mapping) => mappings.push(mapping),
                Err(source) => {
                    // Partially mapped buffer: roll back this buffer's
                    // planes here, the caller rolls back earlier buffers.
                    for mapping in &mut mappings {
                        if let Err(unmap_err) = mapping.unmap() {
                            warn!(
                                buffer = layout.index,
                                error = %unmap_err,
                                "failed to unwind partially mapped buffer"
                            );
                        }
                    }
                    return Err(CaptureError::MappingFailed {
                        buffer: layout.index,
                        plane: plane_index,
                        source,
                    });
                }
            }
        }
        Ok(mappings)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    fn buffer_mut(&mut self, index: u32) -> Result<&mut Buffer, CaptureError> {
        self.buffers
            .iter_mut()
            .find(|b| b.index == index)
            .ok_or(CaptureError::InvalidState("unknown buffer index"))
    }

    fn buffer(&self, index: u32) -> Result<&Buffer, CaptureError> {
        self.buffers
            .iter()
            .find(|b| b.index == index)
            .ok_or(CaptureError::InvalidState("unknown buffer index"))
    }

    pub fn state(&self, index: u32) -> Result<BufferState, CaptureError> {
        Ok(self.buffer(index)?.state)
    }

    /// Record that a buffer crossed into device ownership. Valid from
    /// `Unqueued` (initial fill of the queue) and from `Ready`
    /// (re-enqueue after processing).
    pub fn mark_queued(&mut self, index: u32) -> Result<(), CaptureError> {
        let buffer = self.buffer_mut(index)?;
        match buffer.state {
            BufferState::Unqueued | BufferState::Ready => {
                buffer.state = BufferState::Queued;
                Ok(())
            }
            BufferState::Queued => Err(CaptureError::InvalidState(
                "buffer is already queued at the device",
            )),
        }
    }

    /// Record that the device handed a filled buffer back to us.
    pub fn mark_ready(&mut self, index: u32) -> Result<(), CaptureError> {
        let buffer = self.buffer_mut(index)?;
        match buffer.state {
            BufferState::Queued => {
                buffer.state = BufferState::Ready;
                Ok(())
            }
            BufferState::Unqueued | BufferState::Ready => Err(CaptureError::InvalidState(
                "dequeue reported a buffer we did not queue",
            )),
        }
    }

    /// Borrow the mapped bytes of one plane of a `Ready` buffer.
    ///
    /// Refusing any other state is what keeps device-owned memory
    /// unreachable: a `Queued` buffer may be written by the driver at any
    /// moment.
    pub fn plane_data(&self, index: u32, plane: usize) -> Result<&[u8], CaptureError> {
        let buffer = self.buffer(index)?;
        if buffer.state != BufferState::Ready {
            return Err(CaptureError::InvalidState(
                "plane data is only readable while the buffer is ready",
            ));
        }
        buffer
            .mappings
            .get(plane)
            .map(PlaneMapping::as_slice)
            .ok_or(CaptureError::InvalidState("plane index out of range"))
    }

    /// Unmap every plane of every buffer, best effort.
    ///
    /// Unmapping continues past the first failure so one stuck region does
    /// not pin the rest; the first failure is still reported. Repeat calls
    /// are no-ops.
    pub fn release_all(&mut self) -> Result<(), CaptureError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first_error: Option<(u32, usize, io::Error)> = None;
        for buffer in &mut self.buffers {
            for (plane, mapping) in buffer.mappings.iter_mut().enumerate() {
                if let Err(err) = mapping.unmap() {
                    warn!(
                        buffer = buffer.index,
                        plane,
                        error = %err,
                        "failed to unmap plane, continuing"
                    );
                    if first_error.is_none() {
                        first_error = Some((buffer.index, plane, err));
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some((buffer, plane, source)) => Err(CaptureError::MappingFailed {
                buffer,
                plane,
                source,
            }),
        }
    }

    /// True once `release_all` has run.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Verify no two mapped regions overlap. Diagnostic used by tests.
    pub fn regions_are_disjoint(&self) -> bool {
        let mut regions: Vec<(usize, usize)> = self
            .buffers
            .iter()
            .flat_map(|b| b.mappings.iter())
            .map(|m| (m.addr(), m.len()))
            .collect();
        regions.sort_unstable();
        regions
            .windows(2)
            .all(|pair| pair[0].0 + pair[0].1 <= pair[1].0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDevice;

    #[test]
    fn accepted_count_governs_ring_size() {
        // Device grants 2 of the 4 requested; the ring must size to 2.
        let mut device = MockDevice::nv12_4x4(2);
        let ring = BufferRing::allocate(&mut device, 4).unwrap();
        assert_eq!(ring.len(), 2);
        for buffer in ring.buffers() {
            assert_eq!(buffer.state(), BufferState::Unqueued);
        }
        assert!(ring.regions_are_disjoint());
    }

    #[test]
    fn zero_buffers_is_resource_exhausted() {
        let mut device = MockDevice::nv12_4x4(0);
        let err = BufferRing::allocate(&mut device, 2).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::ResourceExhausted { requested: 2 }
        ));
        assert_eq!(device.map_calls(), 0);
    }

    #[test]
    fn mapping_failure_unwinds_earlier_buffers() {
        let mut device = MockDevice::nv12_4x4(2);
        // Buffer 0 maps fine, buffer 1 plane 0 fails.
        device.fail_map_at(1);
        let err = BufferRing::allocate(&mut device, 2).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::MappingFailed {
                buffer: 1,
                plane: 0,
                ..
            }
        ));
        // Buffer 0's mapping was rolled back before the error propagated.
        assert_eq!(device.live_mappings(), 0);
    }

    #[test]
    fn state_transitions_follow_the_table() {
        let mut device = MockDevice::nv12_4x4(1);
        let mut ring = BufferRing::allocate(&mut device, 1).unwrap();

        ring.mark_queued(0).unwrap();
        assert_eq!(ring.state(0).unwrap(), BufferState::Queued);

        // Double enqueue is rejected.
        assert!(matches!(
            ring.mark_queued(0),
            Err(CaptureError::InvalidState(_))
        ));

        ring.mark_ready(0).unwrap();
        assert_eq!(ring.state(0).unwrap(), BufferState::Ready);

        // Ready again without an intervening enqueue is rejected.
        assert!(matches!(
            ring.mark_ready(0),
            Err(CaptureError::InvalidState(_))
        ));

        // Re-enqueue after processing is the normal path.
        ring.mark_queued(0).unwrap();
        assert_eq!(ring.state(0).unwrap(), BufferState::Queued);
    }

    #[test]
    fn queued_memory_is_unreachable() {
        let mut device = MockDevice::nv12_4x4(1);
        let mut ring = BufferRing::allocate(&mut device, 1).unwrap();

        // Unqueued: not yet valid data.
        assert!(ring.plane_data(0, 0).is_err());

        ring.mark_queued(0).unwrap();
        // Queued: device owns the memory.
        assert!(ring.plane_data(0, 0).is_err());

        ring.mark_ready(0).unwrap();
        let data = ring.plane_data(0, 0).unwrap();
        assert_eq!(data.len(), 24);
    }

    #[test]
    fn release_all_runs_once_and_unmaps_everything() {
        let mut device = MockDevice::nv12_4x4(2);
        let mut ring = BufferRing::allocate(&mut device, 2).unwrap();
        assert_eq!(device.live_mappings(), 2);

        ring.release_all().unwrap();
        assert!(ring.is_released());
        assert_eq!(device.live_mappings(), 0);

        // Second call is a no-op, not a double unmap.
        ring.release_all().unwrap();
    }

    #[test]
    fn release_all_continues_past_an_unmap_failure() {
        let mut device = MockDevice::nv12_4x4(2);
        // Buffer 0's only plane refuses to unmap.
        device.fail_unmap_at(0);
        let mut ring = BufferRing::allocate(&mut device, 2).unwrap();
        assert_eq!(device.live_mappings(), 2);

        let err = ring.release_all().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::MappingFailed {
                buffer: 0,
                plane: 0,
                ..
            }
        ));
        // Buffer 1 was still released; only the stuck region remains.
        assert!(ring.is_released());
        assert_eq!(device.live_mappings(), 1);
    }
}
