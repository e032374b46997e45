// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! V4L2 memory-to-memory device.
//!
//! Only the single-planar DMABUF subset of the V4L2 API used by the
//! transform session is bound here. The source queue of the session maps to
//! the V4L2 `OUTPUT` buffer type and the destination queue to `CAPTURE`.

use crate::{
    error::{Error, Result},
    format::{PixelFormat, Rect},
    transform::{Capabilities, Completion, Control, Direction, FrameFormat, TransformDevice},
};
use libc::{c_int, c_ulong, c_void, timeval};
use nix::{
    ioctl_read, ioctl_readwrite, ioctl_write_ptr,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use std::{
    ffi::CStr,
    fs::{File, OpenOptions},
    io,
    mem::zeroed,
    os::fd::{AsFd, AsRawFd, BorrowedFd},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, trace};

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
const V4L2_MEMORY_DMABUF: u32 = 4;
const V4L2_FIELD_ANY: u32 = 0;

const V4L2_SEL_TGT_CROP: u32 = 0x0000;
const V4L2_SEL_TGT_COMPOSE: u32 = 0x0100;

const V4L2_CAP_VIDEO_M2M: u32 = 0x0000_8000;
const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

const V4L2_CID_BASE: u32 = 0x0098_0900;
const V4L2_CID_HFLIP: u32 = V4L2_CID_BASE + 20;
const V4L2_CID_VFLIP: u32 = V4L2_CID_BASE + 21;
const V4L2_CID_ROTATE: u32 = V4L2_CID_BASE + 34;
const V4L2_CID_BG_COLOR: u32 = V4L2_CID_BASE + 35;
const V4L2_CID_RGA_OP: u32 = V4L2_CID_BASE | 0x1001;
const V4L2_CID_RGA_ALPHA_REG0: u32 = V4L2_CID_BASE | 0x1002;
const V4L2_CID_RGA_ALPHA_REG1: u32 = V4L2_CID_BASE | 0x1003;

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
#[derive(Copy, Clone)]
struct v4l2_pix_format {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
union v4l2_format_union {
    pix: v4l2_pix_format,
    raw_data: [u8; 200],
    _align: [*const c_void; 0],
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_format {
    type_: u32,
    fmt: v4l2_format_union,
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_requestbuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    reserved: [u32; 1],
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
union v4l2_buffer_m {
    offset: u32,
    userptr: c_ulong,
    planes: *mut c_void,
    fd: i32,
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: timeval,
    timecode: v4l2_timecode,
    sequence: u32,
    memory: u32,
    m: v4l2_buffer_m,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_control {
    id: u32,
    value: i32,
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_rect {
    left: i32,
    top: i32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_selection {
    type_: u32,
    target: u32,
    flags: u32,
    r: v4l2_rect,
    reserved: [u32; 9],
}

ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, v4l2_control);
ioctl_readwrite!(vidioc_s_selection, b'V', 95, v4l2_selection);

const fn buf_type(direction: Direction) -> u32 {
    match direction {
        Direction::Input => V4L2_BUF_TYPE_VIDEO_OUTPUT,
        Direction::Output => V4L2_BUF_TYPE_VIDEO_CAPTURE,
    }
}

const fn control_id(control: Control) -> u32 {
    match control {
        Control::HFlip => V4L2_CID_HFLIP,
        Control::VFlip => V4L2_CID_VFLIP,
        Control::Rotate => V4L2_CID_ROTATE,
        Control::FillColor => V4L2_CID_BG_COLOR,
        Control::Operation => V4L2_CID_RGA_OP,
        Control::Alpha0 => V4L2_CID_RGA_ALPHA_REG0,
        Control::Alpha1 => V4L2_CID_RGA_ALPHA_REG1,
    }
}

fn c_string(bytes: &[u8]) -> String {
    CStr::from_bytes_until_nul(bytes)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

/// An open V4L2 memory-to-memory device node.
pub struct V4l2Device {
    file: File,
    path: PathBuf,
}

impl V4l2Device {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?;
        debug!("opened {:?}", path);
        Ok(V4l2Device { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> c_int {
        self.file.as_raw_fd()
    }

    /// Waits until a buffer of `direction` is ready to be dequeued.
    fn wait(&self, direction: Direction, timeout: Duration) -> io::Result<()> {
        let events = match direction {
            Direction::Input => PollFlags::POLLOUT,
            Direction::Output => PollFlags::POLLIN,
        };
        let timeout = PollTimeout::try_from(timeout).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "poll timeout out of range")
        })?;
        let mut fds = [PollFd::new(self.file.as_fd(), events)];
        match poll(&mut fds, timeout)? {
            0 => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{direction} buffer not ready"),
            )),
            _ => Ok(()),
        }
    }
}

impl TransformDevice for V4l2Device {
    fn capabilities(&self) -> io::Result<Capabilities> {
        let mut cap: v4l2_capability = unsafe { zeroed() };
        unsafe { vidioc_querycap(self.fd(), &mut cap) }?;

        let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        Ok(Capabilities {
            driver: c_string(&cap.driver),
            card: c_string(&cap.card),
            bus_info: c_string(&cap.bus_info),
            mem2mem: caps & V4L2_CAP_VIDEO_M2M != 0,
            streaming: caps & V4L2_CAP_STREAMING != 0,
        })
    }

    fn set_control(&self, control: Control, value: i32) -> io::Result<()> {
        let mut ctrl = v4l2_control {
            id: control_id(control),
            value,
        };
        unsafe { vidioc_s_ctrl(self.fd(), &mut ctrl) }?;
        Ok(())
    }

    fn set_format(
        &self,
        direction: Direction,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> io::Result<FrameFormat> {
        let mut fmt: v4l2_format = unsafe { zeroed() };
        fmt.type_ = buf_type(direction);
        fmt.fmt.pix = v4l2_pix_format {
            width,
            height,
            pixelformat: u32::from(format.v4l2()),
            field: V4L2_FIELD_ANY,
            ..unsafe { zeroed() }
        };
        unsafe { vidioc_s_fmt(self.fd(), &mut fmt) }?;

        let pix = unsafe { fmt.fmt.pix };
        let negotiated = PixelFormat::from_v4l2(pix.pixelformat).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unknown fourcc {:#010x}", pix.pixelformat),
            )
        })?;
        Ok(FrameFormat {
            format: negotiated,
            width: pix.width,
            height: pix.height,
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        })
    }

    fn set_crop(&self, direction: Direction, rect: Rect) -> io::Result<()> {
        let mut sel = v4l2_selection {
            type_: buf_type(direction),
            target: match direction {
                Direction::Input => V4L2_SEL_TGT_CROP,
                Direction::Output => V4L2_SEL_TGT_COMPOSE,
            },
            flags: 0,
            r: v4l2_rect {
                left: rect.x,
                top: rect.y,
                width: rect.width,
                height: rect.height,
            },
            reserved: [0; 9],
        };
        unsafe { vidioc_s_selection(self.fd(), &mut sel) }?;
        Ok(())
    }

    fn request_buffers(&self, direction: Direction, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: buf_type(direction),
            memory: V4L2_MEMORY_DMABUF,
            capabilities: 0,
            reserved: [0],
        };
        unsafe { vidioc_reqbufs(self.fd(), &mut req) }?;
        Ok(req.count)
    }

    fn queue(
        &self,
        direction: Direction,
        index: u32,
        fd: BorrowedFd<'_>,
        length: u32,
        bytes_used: u32,
    ) -> io::Result<()> {
        let mut buf: v4l2_buffer = unsafe { zeroed() };
        buf.index = index;
        buf.type_ = buf_type(direction);
        buf.memory = V4L2_MEMORY_DMABUF;
        buf.m.fd = fd.as_raw_fd();
        buf.length = length;
        buf.bytesused = bytes_used;
        unsafe { vidioc_qbuf(self.fd(), &mut buf) }?;
        trace!("{} qbuf index {} fd {}", direction, index, fd.as_raw_fd());
        Ok(())
    }

    fn dequeue(&self, direction: Direction, timeout: Option<Duration>) -> io::Result<Completion> {
        if let Some(timeout) = timeout {
            self.wait(direction, timeout)?;
        }
        let mut buf: v4l2_buffer = unsafe { zeroed() };
        buf.type_ = buf_type(direction);
        buf.memory = V4L2_MEMORY_DMABUF;
        unsafe { vidioc_dqbuf(self.fd(), &mut buf) }?;
        trace!(
            "{} dqbuf index {} bytes {} seq {}",
            direction,
            buf.index,
            buf.bytesused,
            buf.sequence
        );
        Ok(Completion {
            index: buf.index,
            bytes_used: buf.bytesused,
        })
    }

    fn stream_on(&self, direction: Direction) -> io::Result<()> {
        let type_ = buf_type(direction) as c_int;
        unsafe { vidioc_streamon(self.fd(), &type_) }?;
        Ok(())
    }

    fn stream_off(&self, direction: Direction) -> io::Result<()> {
        let type_ = buf_type(direction) as c_int;
        unsafe { vidioc_streamoff(self.fd(), &type_) }?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<v4l2_capability>(), 104);
        assert_eq!(size_of::<v4l2_control>(), 8);
        assert_eq!(size_of::<v4l2_requestbuffers>(), 20);
        assert_eq!(size_of::<v4l2_selection>(), 64);
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(size_of::<v4l2_format>(), 208);
            assert_eq!(size_of::<v4l2_buffer>(), 88);
        }
    }

    #[test]
    fn test_direction_mapping() {
        assert_eq!(buf_type(Direction::Input), V4L2_BUF_TYPE_VIDEO_OUTPUT);
        assert_eq!(buf_type(Direction::Output), V4L2_BUF_TYPE_VIDEO_CAPTURE);
    }

    #[test]
    fn test_control_ids() {
        assert_eq!(control_id(Control::HFlip), 0x0098_0914);
        assert_eq!(control_id(Control::VFlip), 0x0098_0915);
        assert_eq!(control_id(Control::Rotate), 0x0098_0922);
        assert_eq!(control_id(Control::FillColor), 0x0098_0923);
        assert_eq!(control_id(Control::Operation), 0x0098_1901);
        assert_eq!(control_id(Control::Alpha1), 0x0098_1903);
    }

    #[test]
    fn test_c_string() {
        let mut raw = [0u8; 16];
        raw[..7].copy_from_slice(b"rockchi");
        assert_eq!(c_string(&raw), "rockchi");
        assert_eq!(c_string(b"full"), "full");
    }

    #[test]
    fn test_open_missing_device() {
        let res = V4l2Device::open("/dev/edgefirst-missing-video");
        assert!(matches!(res, Err(Error::Open { .. })));
    }
}
