//! Raw V4L2 multi-planar capture backend.
//!
//! Implements [`CaptureDevice`] directly on top of the kernel's
//! request/queue/dequeue protocol for `V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE`
//! devices: `VIDIOC_G_FMT`, `VIDIOC_REQBUFS`/`VIDIOC_QUERYBUF`,
//! `VIDIOC_QBUF`/`VIDIOC_DQBUF` and `VIDIOC_STREAMON`/`STREAMOFF`, with
//! plane memory mapped via `mmap` and readiness via `poll`.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fbcast_core::{FrameGeometry, PixelFormat};
use tracing::debug;

use crate::device::{BufferLayout, CaptureDevice, DequeuedFrame, PlaneDescriptor};
use crate::ring::PlaneMapping;
use crate::CaptureError;

const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
const V4L2_MEMORY_MMAP: u32 = 1;
const VIDEO_MAX_PLANES: usize = 8;

/// Plane descriptor exchanged with the kernel. The kernel's `m` union is
/// collapsed to its MMAP variant; the pad preserves the union's 64-bit
/// footprint.
#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Plane {
    bytesused: u32,
    length: u32,
    mem_offset: u32,
    _m_pad: u32,
    data_offset: u32,
    reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

/// `struct v4l2_buffer` with the `m` union collapsed to the multi-planar
/// variant (a pointer to a `V4l2Plane` array).
#[repr(C)]
struct V4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    planes: u64,
    length: u32,
    reserved2: u32,
    request_fd: u32,
}

#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2PlanePixFormat {
    sizeimage: u32,
    bytesperline: u32,
    reserved: [u16; 6],
}

#[repr(C)]
struct V4l2PixFormatMplane {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    colorspace: u32,
    plane_fmt: [V4l2PlanePixFormat; VIDEO_MAX_PLANES],
    num_planes: u8,
    flags: u8,
    ycbcr_enc: u8,
    quantization: u8,
    xfer_func: u8,
    reserved: [u8; 7],
}

/// `struct v4l2_format` with the payload union collapsed to `pix_mp`. The
/// pad keeps `pix_mp` at offset 8 (the kernel union is pointer-aligned) and
/// the tail fills the union out to its full 200 bytes.
#[repr(C)]
struct V4l2Format {
    type_: u32,
    _pad: u32,
    pix_mp: V4l2PixFormatMplane,
    _union_tail: [u8; 200 - size_of::<V4l2PixFormatMplane>()],
}

// Wire sizes the ioctl numbers below are derived from. A mismatch here
// would make the kernel reject every call with ENOTTY.
const _: () = assert!(size_of::<V4l2Plane>() == 64);
const _: () = assert!(size_of::<V4l2Buffer>() == 88);
const _: () = assert!(size_of::<V4l2RequestBuffers>() == 20);
const _: () = assert!(size_of::<V4l2PixFormatMplane>() == 192);
const _: () = assert!(size_of::<V4l2Format>() == 208);

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn vidioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((b'V' as libc::c_ulong) << 8) | nr
}

const VIDIOC_G_FMT: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 4, size_of::<V4l2Format>());
const VIDIOC_REQBUFS: libc::c_ulong =
    vidioc(IOC_READ | IOC_WRITE, 8, size_of::<V4l2RequestBuffers>());
const VIDIOC_QUERYBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 9, size_of::<V4l2Buffer>());
const VIDIOC_QBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 15, size_of::<V4l2Buffer>());
const VIDIOC_DQBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 17, size_of::<V4l2Buffer>());
const VIDIOC_STREAMON: libc::c_ulong = vidioc(IOC_WRITE, 18, size_of::<libc::c_int>());
const VIDIOC_STREAMOFF: libc::c_ulong = vidioc(IOC_WRITE, 19, size_of::<libc::c_int>());

/// Issue an ioctl, retrying on EINTR, mapping failure to `CaptureError`.
fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T, op: &'static str) -> Result<(), CaptureError> {
    loop {
        let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(CaptureError::Device { op, source: err });
    }
}

fn zeroed_buffer(index: u32, planes: &mut [V4l2Plane; VIDEO_MAX_PLANES]) -> V4l2Buffer {
    let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
    buf.index = index;
    buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
    buf.memory = V4L2_MEMORY_MMAP;
    buf.planes = planes.as_mut_ptr() as u64;
    buf.length = VIDEO_MAX_PLANES as u32;
    buf
}

/// A multi-planar V4L2 capture device node.
pub struct V4l2Device {
    file: File,
    path: PathBuf,
    /// Plane count reported by the negotiated format; drives the plane
    /// arrays of every queue operation.
    num_planes: u32,
}

impl V4l2Device {
    /// Open a capture device node, e.g. `/dev/video0`. Non-blocking so a
    /// dequeue can never stall past its readiness wait.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path.as_ref())
            .map_err(|source| CaptureError::Device { op: "open", source })?;
        debug!(path = %path.as_ref().display(), "opened capture device");
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            num_planes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl CaptureDevice for V4l2Device {
    fn query_format(&mut self) -> Result<FrameGeometry, CaptureError> {
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        xioctl(self.fd(), VIDIOC_G_FMT, &mut fmt, "VIDIOC_G_FMT")?;

        let fourcc = fmt.pix_mp.pixelformat.to_le_bytes();
        let format = PixelFormat::from_fourcc(&fourcc)?;
        self.num_planes = fmt.pix_mp.num_planes as u32;

        Ok(FrameGeometry {
            width: fmt.pix_mp.width,
            height: fmt.pix_mp.height,
            format,
            plane_count: self.num_planes,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<Vec<BufferLayout>, CaptureError> {
        let mut req: V4l2RequestBuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        req.memory = V4L2_MEMORY_MMAP;
        xioctl(self.fd(), VIDIOC_REQBUFS, &mut req, "VIDIOC_REQBUFS")?;
        debug!(requested = count, accepted = req.count, "buffers granted");

        let mut layouts = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut planes = [unsafe { std::mem::zeroed::<V4l2Plane>() }; VIDEO_MAX_PLANES];
            let mut buf = zeroed_buffer(index, &mut planes);
            xioctl(self.fd(), VIDIOC_QUERYBUF, &mut buf, "VIDIOC_QUERYBUF")?;

            let plane_count = (buf.length as usize).min(VIDEO_MAX_PLANES);
            layouts.push(BufferLayout {
                index,
                planes: planes[..plane_count]
                    .iter()
                    .map(|p| PlaneDescriptor {
                        length: p.length,
                        mem_offset: p.mem_offset,
                    })
                    .collect(),
            });
        }
        Ok(layouts)
    }

    fn map_plane(&mut self, plane: &PlaneDescriptor) -> Result<PlaneMapping, io::Error> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                plane.length as usize,
                libc::PROT_READ,
                libc::MAP_SHARED,
                self.fd(),
                plane.mem_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(PlaneMapping::from_device(ptr, plane.length as usize))
    }

    fn enqueue(&mut self, index: u32) -> Result<(), CaptureError> {
        let mut planes = [unsafe { std::mem::zeroed::<V4l2Plane>() }; VIDEO_MAX_PLANES];
        let mut buf = zeroed_buffer(index, &mut planes);
        xioctl(self.fd(), VIDIOC_QBUF, &mut buf, "VIDIOC_QBUF")
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool, CaptureError> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret > 0 {
            return Ok(true);
        }
        if ret == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            // Interrupted by the cancellation signal; report a timeout so
            // the loop re-checks the token.
            return Ok(false);
        }
        Err(CaptureError::Device {
            op: "poll",
            source: err,
        })
    }

    fn dequeue(&mut self) -> Result<DequeuedFrame, CaptureError> {
        let mut planes = [unsafe { std::mem::zeroed::<V4l2Plane>() }; VIDEO_MAX_PLANES];
        let mut buf = zeroed_buffer(0, &mut planes);
        xioctl(self.fd(), VIDIOC_DQBUF, &mut buf, "VIDIOC_DQBUF")?;

        let plane_count = (self.num_planes as usize)
            .max(1)
            .min(VIDEO_MAX_PLANES);
        Ok(DequeuedFrame {
            index: buf.index,
            bytes_used: planes[..plane_count].iter().map(|p| p.bytesused).collect(),
        })
    }

    fn set_streaming(&mut self, on: bool) -> Result<(), CaptureError> {
        let mut buf_type: libc::c_int = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as libc::c_int;
        if on {
            xioctl(self.fd(), VIDIOC_STREAMON, &mut buf_type, "VIDIOC_STREAMON")
        } else {
            xioctl(self.fd(), VIDIOC_STREAMOFF, &mut buf_type, "VIDIOC_STREAMOFF")
        }
    }
}

/// Discover capture device nodes under `/dev`.
///
/// Returns full paths, e.g. `/dev/video0`, sorted.
pub fn discover_devices() -> Vec<PathBuf> {
    let mut devices = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("video") {
                devices.push(entry.path());
            }
        }
    }
    devices.sort();
    devices
}
