//! Pixel format conversion for captured frames.
//!
//! A single pure entry point, [`convert_to_bgra`], turns the raw plane bytes
//! of a dequeued buffer into a display-ready BGRA payload. Dispatch is by the
//! negotiated [`PixelFormat`]; no state, no I/O.

use fbcast_core::{FrameGeometry, PixelFormat};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// The negotiated format has no conversion path. Raw bytes are never
    /// passed through to the sink under a format the sink cannot interpret.
    #[error("no conversion path for pixel format {0}")]
    UnsupportedFormat(PixelFormat),

    /// Subsampled chroma cannot describe odd frame dimensions; a device
    /// reporting odd geometry for NV12 or YUV 4:2:0 has no conversion path.
    #[error("odd frame dimensions {width}x{height} for a chroma-subsampled format")]
    OddDimensions { width: u32, height: u32 },

    /// The driver delivered fewer bytes than the geometry requires.
    #[error("short frame in plane {plane}: expected {expected} bytes, got {actual}")]
    ShortFrame {
        plane: usize,
        expected: usize,
        actual: usize,
    },

    /// The device handed over a different number of planes than negotiated.
    #[error("expected {expected} planes, got {actual}")]
    PlaneCountMismatch { expected: usize, actual: usize },
}

/// Check that a negotiated geometry has a conversion path.
///
/// Called once at session negotiation so a device reporting odd dimensions
/// for a 4:2:0 format fails before any buffer is mapped; `convert_to_bgra`
/// repeats the check per frame.
pub fn validate_geometry(geometry: &FrameGeometry) -> Result<(), ConvertError> {
    match geometry.format {
        PixelFormat::Nv12 | PixelFormat::Yuv420
            if geometry.width % 2 != 0 || geometry.height % 2 != 0 =>
        {
            Err(ConvertError::OddDimensions {
                width: geometry.width,
                height: geometry.height,
            })
        }
        _ => Ok(()),
    }
}

/// Convert the raw planes of one captured frame into BGRA.
///
/// `planes` holds one slice per device plane, trimmed to the byte count the
/// driver actually wrote. The output is always `width * height * 4` bytes,
/// row-major, channel order B, G, R, A.
///
/// The same input always yields byte-identical output.
pub fn convert_to_bgra(planes: &[&[u8]], geometry: &FrameGeometry) -> Result<Vec<u8>, ConvertError> {
    validate_geometry(geometry)?;
    let expected_sizes = geometry.plane_sizes();
    if planes.len() != expected_sizes.len() {
        return Err(ConvertError::PlaneCountMismatch {
            expected: expected_sizes.len(),
            actual: planes.len(),
        });
    }
    for (plane, (&data, &expected)) in planes.iter().zip(expected_sizes.iter()).enumerate() {
        if data.len() < expected {
            return Err(ConvertError::ShortFrame {
                plane,
                expected,
                actual: data.len(),
            });
        }
    }

    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let pixels = width * height;

    match geometry.format {
        PixelFormat::Nv12 => {
            // Contiguous NV12 is luma followed by interleaved chroma in one
            // plane; the two-plane variant delivers them separately.
            let (luma, chroma) = if planes.len() == 2 {
                (planes[0], planes[1])
            } else {
                planes[0].split_at(pixels)
            };
            Ok(nv12_to_bgra(luma, chroma, width, height))
        }
        PixelFormat::Yuv420 => {
            let (luma, rest) = planes[0].split_at(pixels);
            let (u, v) = rest.split_at(pixels / 4);
            Ok(yuv420_to_bgra(luma, u, v, width, height))
        }
        PixelFormat::Bgra => Ok(planes[0][..pixels * 4].to_vec()),
    }
}

/// BT.601 limited-range YCbCr to 8-bit RGB.
#[inline]
fn ycbcr_to_bgra(y: u8, cb: u8, cr: u8, out: &mut [u8]) {
    let c = y as i32 - 16;
    let d = cb as i32 - 128;
    let e = cr as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    out[0] = b.clamp(0, 255) as u8;
    out[1] = g.clamp(0, 255) as u8;
    out[2] = r.clamp(0, 255) as u8;
    out[3] = 255;
}

fn nv12_to_bgra(luma: &[u8], chroma: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * height * 4];
    for row in 0..height {
        for col in 0..width {
            let y = luma[row * width + col];
            let chroma_index = (row / 2) * width + (col / 2) * 2;
            let cb = chroma[chroma_index];
            let cr = chroma[chroma_index + 1];
            let offset = (row * width + col) * 4;
            ycbcr_to_bgra(y, cb, cr, &mut out[offset..offset + 4]);
        }
    }
    out
}

fn yuv420_to_bgra(luma: &[u8], u: &[u8], v: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * height * 4];
    for row in 0..height {
        for col in 0..width {
            let y = luma[row * width + col];
            let chroma_index = (row / 2) * (width / 2) + col / 2;
            let cb = u[chroma_index];
            let cr = v[chroma_index];
            let offset = (row * width + col) * 4;
            ycbcr_to_bgra(y, cb, cr, &mut out[offset..offset + 4]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv12_geometry(width: u32, height: u32) -> FrameGeometry {
        FrameGeometry {
            width,
            height,
            format: PixelFormat::Nv12,
            plane_count: 1,
        }
    }

    /// 4x4 NV12 frame: 16 luma bytes plus 8 interleaved chroma bytes.
    fn black_nv12_4x4() -> Vec<u8> {
        let mut frame = vec![16u8; 16];
        frame.extend_from_slice(&[128u8; 8]);
        frame
    }

    #[test]
    fn nv12_output_size_is_width_height_4() {
        let frame = black_nv12_4x4();
        let out = convert_to_bgra(&[&frame], &nv12_geometry(4, 4)).unwrap();
        assert_eq!(out.len(), 64);
    }

    #[test]
    fn nv12_black_and_white_levels() {
        let geometry = nv12_geometry(2, 2);
        let black = [16, 16, 16, 16, 128, 128];
        let out = convert_to_bgra(&[&black[..]], &geometry).unwrap();
        assert_eq!(&out[..4], &[0, 0, 0, 255]);

        let white = [235, 235, 235, 235, 128, 128];
        let out = convert_to_bgra(&[&white[..]], &geometry).unwrap();
        assert_eq!(&out[..4], &[255, 255, 255, 255]);
    }

    #[test]
    fn nv12_two_plane_variant_matches_contiguous() {
        let frame = black_nv12_4x4();
        let contiguous = convert_to_bgra(&[&frame], &nv12_geometry(4, 4)).unwrap();

        let geometry = FrameGeometry {
            plane_count: 2,
            ..nv12_geometry(4, 4)
        };
        let split = convert_to_bgra(&[&frame[..16], &frame[16..]], &geometry).unwrap();
        assert_eq!(contiguous, split);
    }

    #[test]
    fn conversion_is_deterministic() {
        let geometry = nv12_geometry(4, 4);
        let frame: Vec<u8> = (0..24).map(|i| (i * 11) as u8).collect();
        let first = convert_to_bgra(&[&frame], &geometry).unwrap();
        let second = convert_to_bgra(&[&frame], &geometry).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn yuv420_output_size_and_levels() {
        let geometry = FrameGeometry {
            width: 4,
            height: 4,
            format: PixelFormat::Yuv420,
            plane_count: 1,
        };
        let mut frame = vec![235u8; 16];
        frame.extend_from_slice(&[128u8; 8]);
        let out = convert_to_bgra(&[&frame], &geometry).unwrap();
        assert_eq!(out.len(), 64);
        assert_eq!(&out[..4], &[255, 255, 255, 255]);
    }

    #[test]
    fn bgra_is_passthrough() {
        let geometry = FrameGeometry {
            width: 2,
            height: 2,
            format: PixelFormat::Bgra,
            plane_count: 1,
        };
        let frame: Vec<u8> = (0..16).collect();
        let out = convert_to_bgra(&[&frame], &geometry).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn short_plane_is_rejected() {
        let frame = vec![0u8; 23];
        let err = convert_to_bgra(&[&frame], &nv12_geometry(4, 4)).unwrap_err();
        assert_eq!(
            err,
            ConvertError::ShortFrame {
                plane: 0,
                expected: 24,
                actual: 23
            }
        );
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        // 3x3 NV12: the 13-byte plane holds only 4 chroma bytes, not enough
        // for the half-resolution grid an odd width implies.
        let geometry = nv12_geometry(3, 3);
        let frame = vec![16u8; geometry.plane_sizes()[0]];
        let err = convert_to_bgra(&[&frame], &geometry).unwrap_err();
        assert_eq!(err, ConvertError::OddDimensions { width: 3, height: 3 });

        let odd_yuv = FrameGeometry {
            format: PixelFormat::Yuv420,
            ..geometry
        };
        assert!(validate_geometry(&odd_yuv).is_err());
        assert!(validate_geometry(&nv12_geometry(4, 4)).is_ok());
    }

    #[test]
    fn plane_count_mismatch_is_rejected() {
        let frame = black_nv12_4x4();
        let err = convert_to_bgra(&[&frame[..16], &frame[16..]], &nv12_geometry(4, 4)).unwrap_err();
        assert_eq!(
            err,
            ConvertError::PlaneCountMismatch {
                expected: 1,
                actual: 2
            }
        );
    }
}
