// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pixel formats understood by both the transform device and the display.
//!
//! The transform device speaks V4L2 fourcc codes while the display planes
//! advertise DRM fourcc codes. [`PixelFormat`] is the single vocabulary used
//! across the crate and carries both encodings along with the memory layout
//! rules used to size buffer objects.

use crate::error::{Error, Result};
use core::fmt;
use drm::buffer::DrmFourcc;
use videostream::fourcc::FourCC;

/// NV12 4:2:0 YUV semi-planar, CbCr order
pub const NV12: FourCC = FourCC(*b"NV12");

/// NV21 4:2:0 YUV semi-planar, CrCb order
pub const NV21: FourCC = FourCC(*b"NV21");

/// NV16 4:2:2 YUV semi-planar, CbCr order
pub const NV16: FourCC = FourCC(*b"NV16");

/// NV61 4:2:2 YUV semi-planar, CrCb order
pub const NV61: FourCC = FourCC(*b"NV61");

/// YUV 4:2:0 fully planar (I420)
pub const YU12: FourCC = FourCC(*b"YU12");

/// YUV 4:2:2 fully planar
pub const YUV422P: FourCC = FourCC(*b"422P");

/// 32-bit ARGB
pub const ARGB32: FourCC = FourCC(*b"BA24");

/// 32-bit XRGB, alpha ignored
pub const XRGB32: FourCC = FourCC(*b"BX24");

/// 32-bit ABGR
pub const ABGR32: FourCC = FourCC(*b"AR24");

/// 32-bit XBGR, alpha ignored
pub const XBGR32: FourCC = FourCC(*b"XR24");

/// 24-bit RGB (8 bits per channel, no alpha)
pub const RGB24: FourCC = FourCC(*b"RGB3");

/// 16-bit RGB 5:6:5
pub const RGB565: FourCC = FourCC(*b"RGBP");

/// 16-bit ARGB 1:5:5:5
pub const ARGB555: FourCC = FourCC(*b"AR15");

/// 16-bit ARGB 4:4:4:4
pub const ARGB444: FourCC = FourCC(*b"AR12");

/// Pixel formats supported by the transform pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Nv12,
    Nv21,
    Nv16,
    Nv61,
    Yuv420,
    Yuv422p,
    Argb32,
    Xrgb32,
    Abgr32,
    Xbgr32,
    Rgb24,
    Rgb565,
    Argb555,
    Argb444,
}

/// Memory layout of one frame: per-plane pitch and offset plus total size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub planes: usize,
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub size: usize,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 14] = [
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::Nv16,
        PixelFormat::Nv61,
        PixelFormat::Yuv420,
        PixelFormat::Yuv422p,
        PixelFormat::Argb32,
        PixelFormat::Xrgb32,
        PixelFormat::Abgr32,
        PixelFormat::Xbgr32,
        PixelFormat::Rgb24,
        PixelFormat::Rgb565,
        PixelFormat::Argb555,
        PixelFormat::Argb444,
    ];

    /// V4L2 fourcc used when negotiating with the transform device.
    pub const fn v4l2(self) -> FourCC {
        match self {
            PixelFormat::Nv12 => NV12,
            PixelFormat::Nv21 => NV21,
            PixelFormat::Nv16 => NV16,
            PixelFormat::Nv61 => NV61,
            PixelFormat::Yuv420 => YU12,
            PixelFormat::Yuv422p => YUV422P,
            PixelFormat::Argb32 => ARGB32,
            PixelFormat::Xrgb32 => XRGB32,
            PixelFormat::Abgr32 => ABGR32,
            PixelFormat::Xbgr32 => XBGR32,
            PixelFormat::Rgb24 => RGB24,
            PixelFormat::Rgb565 => RGB565,
            PixelFormat::Argb555 => ARGB555,
            PixelFormat::Argb444 => ARGB444,
        }
    }

    /// DRM fourcc used when matching display planes and creating
    /// framebuffers.
    pub const fn drm(self) -> DrmFourcc {
        match self {
            PixelFormat::Nv12 => DrmFourcc::Nv12,
            PixelFormat::Nv21 => DrmFourcc::Nv21,
            PixelFormat::Nv16 => DrmFourcc::Nv16,
            PixelFormat::Nv61 => DrmFourcc::Nv61,
            PixelFormat::Yuv420 => DrmFourcc::Yuv420,
            PixelFormat::Yuv422p => DrmFourcc::Yuv422,
            PixelFormat::Argb32 => DrmFourcc::Argb8888,
            PixelFormat::Xrgb32 => DrmFourcc::Xrgb8888,
            PixelFormat::Abgr32 => DrmFourcc::Abgr8888,
            PixelFormat::Xbgr32 => DrmFourcc::Xbgr8888,
            PixelFormat::Rgb24 => DrmFourcc::Rgb888,
            PixelFormat::Rgb565 => DrmFourcc::Rgb565,
            PixelFormat::Argb555 => DrmFourcc::Argb1555,
            PixelFormat::Argb444 => DrmFourcc::Argb4444,
        }
    }

    /// Looks up the format matching a raw V4L2 fourcc code.
    pub fn from_v4l2(code: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|fmt| u32::from(fmt.v4l2()) == code)
    }

    pub const fn is_yuv(self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12
                | PixelFormat::Nv21
                | PixelFormat::Nv16
                | PixelFormat::Nv61
                | PixelFormat::Yuv420
                | PixelFormat::Yuv422p
        )
    }

    /// Average bits per pixel across all planes.
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420 => 12,
            PixelFormat::Nv16 | PixelFormat::Nv61 | PixelFormat::Yuv422p => 16,
            PixelFormat::Argb32
            | PixelFormat::Xrgb32
            | PixelFormat::Abgr32
            | PixelFormat::Xbgr32 => 32,
            PixelFormat::Rgb24 => 24,
            PixelFormat::Rgb565 | PixelFormat::Argb555 | PixelFormat::Argb444 => 16,
        }
    }

    /// Computes the plane layout of a `width` x `height` frame.
    ///
    /// Packed RGB formats use `bpp` bits per pixel when it is non-zero,
    /// otherwise the format's own depth. YUV formats always use 8-bit luma
    /// and chroma samples and ignore `bpp`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] when the frame does not fit in 32 bits.
    pub fn layout(self, width: u32, height: u32, bpp: u32) -> Result<Layout> {
        self.layout_with_pitch(width, height, bpp, 0)
    }

    /// Same as [`PixelFormat::layout`] with the first plane `pitch` bytes
    /// wide, as reported by a device that pads its lines. Chroma planes
    /// follow the luma pitch. A zero `pitch` is derived from the width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] when `pitch` is shorter than one line or
    /// the frame does not fit in 32 bits.
    pub fn layout_with_pitch(
        self,
        width: u32,
        height: u32,
        bpp: u32,
        pitch: u32,
    ) -> Result<Layout> {
        let overflow = || {
            Error::Allocation(format!(
                "{self} {width}x{height} frame does not fit in 32 bits"
            ))
        };

        let (w, h) = (u64::from(width), u64::from(height));
        let line = if self.is_yuv() {
            w
        } else {
            let bpp = if bpp == 0 { self.bits_per_pixel() } else { bpp };
            w.checked_mul(u64::from(bpp)).ok_or_else(overflow)?.div_ceil(8)
        };
        let pitch = match u64::from(pitch) {
            0 => line,
            p if p >= line => p,
            p => {
                return Err(Error::Allocation(format!(
                    "pitch {p} is shorter than a {width} pixel {self} line of {line} bytes"
                )))
            }
        };

        let mul = |a: u64, b: u64| a.checked_mul(b).ok_or_else(overflow);
        let add = |a: u64, b: u64| a.checked_add(b).ok_or_else(overflow);
        let luma = mul(pitch, h)?;
        let (planes, pitches, offsets, size) = match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Nv16 | PixelFormat::Nv61 => {
                let rows = match self {
                    PixelFormat::Nv12 | PixelFormat::Nv21 => h.div_ceil(2),
                    _ => h,
                };
                let cpitch = pitch.max(w.div_ceil(2) * 2);
                let chroma = mul(cpitch, rows)?;
                (2, [pitch, cpitch, 0, 0], [0, luma, 0, 0], add(luma, chroma)?)
            }
            PixelFormat::Yuv420 | PixelFormat::Yuv422p => {
                let rows = match self {
                    PixelFormat::Yuv420 => h.div_ceil(2),
                    _ => h,
                };
                let cpitch = pitch.div_ceil(2);
                let chroma = mul(cpitch, rows)?;
                let second = add(luma, chroma)?;
                (
                    3,
                    [pitch, cpitch, cpitch, 0],
                    [0, luma, second, 0],
                    add(second, chroma)?,
                )
            }
            _ => (1, [pitch, 0, 0, 0], [0; 4], luma),
        };

        // frame lengths travel as 32-bit values through V4L2 and DRM
        let narrow = |v: u64| u32::try_from(v).map_err(|_| overflow());
        Ok(Layout {
            planes,
            pitches: [
                narrow(pitches[0])?,
                narrow(pitches[1])?,
                narrow(pitches[2])?,
                narrow(pitches[3])?,
            ],
            offsets: [
                narrow(offsets[0])?,
                narrow(offsets[1])?,
                narrow(offsets[2])?,
                narrow(offsets[3])?,
            ],
            size: narrow(size)? as usize,
        })
    }

    /// Byte length of a `width` x `height` frame at the format's own depth.
    pub fn frame_size(self, width: u32, height: u32) -> Result<usize> {
        Ok(self.layout(width, height, 0)?.size)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.v4l2())
    }
}

/// Rectangle specification for crop and plane placement.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of top-left corner
    pub x: i32,
    /// Y coordinate of top-left corner
    pub y: i32,
    /// Width of the rectangle in pixels
    pub width: u32,
    /// Height of the rectangle in pixels
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn is_zero(&self) -> bool {
        self.x == 0 && self.y == 0 && self.width == 0 && self.height == 0
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() -> Result<()> {
        assert_eq!(PixelFormat::Nv12.frame_size(1024, 768)?, 1179648);
        assert_eq!(PixelFormat::Yuv420.frame_size(1920, 1080)?, 3110400);
        assert_eq!(PixelFormat::Nv16.frame_size(1920, 1080)?, 4147200);
        assert_eq!(PixelFormat::Rgb24.frame_size(1920, 1080)?, 6220800);
        assert_eq!(PixelFormat::Argb32.frame_size(1920, 1080)?, 8294400);
        assert_eq!(PixelFormat::Rgb565.frame_size(640, 480)?, 614400);
        Ok(())
    }

    #[test]
    fn test_explicit_bpp() -> Result<()> {
        let layout = PixelFormat::Xrgb32.layout(100, 10, 24)?;
        assert_eq!(layout.pitches[0], 300);
        assert_eq!(layout.size, 3000);

        // YUV ignores the requested depth
        assert_eq!(PixelFormat::Nv12.layout(16, 16, 32)?.size, 384);
        Ok(())
    }

    #[test]
    fn test_planar_offsets() -> Result<()> {
        let layout = PixelFormat::Yuv420.layout(640, 480, 0)?;
        assert_eq!(layout.planes, 3);
        assert_eq!(layout.pitches, [640, 320, 320, 0]);
        assert_eq!(layout.offsets, [0, 307200, 384000, 0]);

        let layout = PixelFormat::Nv12.layout(641, 481, 0)?;
        assert_eq!(layout.pitches[1], 642);
        assert_eq!(layout.size, 641 * 481 + 642 * 241);
        Ok(())
    }

    #[test]
    fn test_padded_pitch() -> Result<()> {
        let layout = PixelFormat::Argb32.layout_with_pitch(1000, 600, 0, 4032)?;
        assert_eq!(layout.pitches[0], 4032);
        assert_eq!(layout.size, 4032 * 600);

        let layout = PixelFormat::Nv12.layout_with_pitch(1000, 600, 0, 1024)?;
        assert_eq!(layout.pitches, [1024, 1024, 0, 0]);
        assert_eq!(layout.offsets[1], 1024 * 600);
        assert_eq!(layout.size, 1024 * 600 + 1024 * 300);

        let layout = PixelFormat::Yuv420.layout_with_pitch(640, 480, 0, 704)?;
        assert_eq!(layout.pitches, [704, 352, 352, 0]);

        assert!(matches!(
            PixelFormat::Argb32.layout_with_pitch(1000, 600, 0, 3999),
            Err(Error::Allocation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_oversized_frames() {
        for (fmt, width, height) in [
            (PixelFormat::Argb32, 65536, 65536),
            (PixelFormat::Nv12, u32::MAX, u32::MAX),
            (PixelFormat::Rgb565, u32::MAX, 1),
            (PixelFormat::Yuv422p, 70000, 70000),
        ] {
            assert!(
                matches!(fmt.layout(width, height, 0), Err(Error::Allocation(_))),
                "{fmt} {width}x{height}"
            );
        }
        assert!(PixelFormat::Xrgb32.layout(16, 16, u32::MAX).is_err());
        // the largest ARGB frame that still fits
        assert!(PixelFormat::Argb32.layout(32768, 32767, 0).is_ok());
    }

    #[test]
    fn test_v4l2_lookup() {
        for fmt in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_v4l2(u32::from(fmt.v4l2())), Some(fmt));
        }
        assert_eq!(PixelFormat::from_v4l2(u32::from(FourCC(*b"MJPG"))), None);
    }
}
