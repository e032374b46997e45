// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! In-memory device backends for unit tests.

use crate::{
    bo::{BufferAllocator, BufferObject, BufferRequest},
    display::{ConnectorInfo, DisplayBackend, EncoderInfo, PlaneInfo, PlaneUpdate, PropertySet},
    error::{Error, Result},
    format::{PixelFormat, Rect},
    transform::{Capabilities, Completion, Control, Direction, FrameFormat, TransformDevice},
};
use std::{
    cell::{Cell, RefCell, RefMut},
    collections::{HashMap, HashSet, VecDeque},
    io,
    os::fd::{BorrowedFd, FromRawFd, OwnedFd},
    rc::Rc,
    time::Duration,
};

/// Allocates buffer objects from anonymous memfd files.
#[derive(Debug, Default)]
pub struct MemfdAllocator {
    live: Cell<usize>,
}

impl MemfdAllocator {
    /// Buffers allocated and not yet released.
    pub fn live(&self) -> usize {
        self.live.get()
    }
}

impl BufferAllocator for MemfdAllocator {
    fn allocate(&self, request: &BufferRequest) -> Result<BufferObject> {
        let layout = request.layout()?;
        let fd = unsafe { libc::memfd_create(c"edgefirst-bo".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Allocation(io::Error::last_os_error().to_string()));
        }
        let memory = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::ftruncate(fd, layout.size as libc::off_t) } != 0 {
            return Err(Error::Allocation(io::Error::last_os_error().to_string()));
        }
        self.live.set(self.live.get() + 1);
        Ok(BufferObject::new(request, layout, memory, None))
    }

    fn release(&self, bo: BufferObject) -> Result<()> {
        drop(bo.into_parts());
        self.live.set(self.live.get() - 1);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MockMode {
    pub width: u32,
    pub height: u32,
}

impl MockMode {
    pub fn new(width: u32, height: u32) -> Self {
        MockMode { width, height }
    }
}

const PLANE_PROPERTIES: [&str; 12] = [
    "type", "FB_ID", "CRTC_ID", "zpos", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y",
    "SRC_W", "SRC_H",
];

#[derive(Default)]
struct DisplayState {
    atomic: bool,
    connectors: Vec<ConnectorInfo<MockMode>>,
    encoders: Vec<EncoderInfo>,
    crtcs: Vec<u32>,
    planes: Vec<PlaneInfo>,
    reject_planes: bool,
    fail_modesets: bool,
    fail_releases: bool,
    next_fb: u32,
    framebuffers: HashSet<u32>,
    modesets: Vec<(u32, u32, u32, MockMode)>,
    plane_updates: Vec<PlaneUpdate>,
    commits: Vec<PropertySet>,
}

/// Scripted display with memfd backed buffers. Clones share state.
#[derive(Clone, Default)]
pub struct MockDisplay {
    alloc: Rc<MemfdAllocator>,
    state: Rc<RefCell<DisplayState>>,
}

impl MockDisplay {
    /// One connected 1920x1080 output on the first of two CRTCs.
    ///
    /// Planes: 50 (RGB, pipe 0), 51 (NV12 and ARGB, pipe 0), 52 (NV12,
    /// pipe 1) and 53 (NV12 and XRGB, both pipes).
    pub fn single_output() -> Self {
        let fourcc = |formats: &[PixelFormat]| formats.iter().map(|f| f.drm() as u32).collect();
        let state = DisplayState {
            atomic: true,
            connectors: vec![ConnectorInfo {
                id: 30,
                connected: true,
                modes: vec![MockMode::new(1920, 1080), MockMode::new(1280, 720)],
                encoder: Some(35),
                encoders: vec![35],
            }],
            encoders: vec![EncoderInfo {
                id: 35,
                crtc: Some(40),
                possible_crtcs: 0b11,
            }],
            crtcs: vec![40, 41],
            planes: vec![
                PlaneInfo {
                    id: 50,
                    possible_crtcs: 0b01,
                    formats: fourcc(&[PixelFormat::Xrgb32, PixelFormat::Argb32]),
                },
                PlaneInfo {
                    id: 51,
                    possible_crtcs: 0b01,
                    formats: fourcc(&[PixelFormat::Nv12, PixelFormat::Argb32]),
                },
                PlaneInfo {
                    id: 52,
                    possible_crtcs: 0b10,
                    formats: fourcc(&[PixelFormat::Nv12]),
                },
                PlaneInfo {
                    id: 53,
                    possible_crtcs: 0b11,
                    formats: fourcc(&[PixelFormat::Nv12, PixelFormat::Xrgb32]),
                },
            ],
            next_fb: 100,
            ..Default::default()
        };
        MockDisplay {
            alloc: Rc::default(),
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Same resources as [`MockDisplay::single_output`] with nothing plugged
    /// in.
    pub fn disconnected() -> Self {
        let display = Self::single_output();
        display.state.borrow_mut().connectors[0].connected = false;
        display
    }

    pub fn with_atomic(self, atomic: bool) -> Self {
        self.state.borrow_mut().atomic = atomic;
        self
    }

    pub fn reject_plane_updates(&self, reject: bool) {
        self.state.borrow_mut().reject_planes = reject;
    }

    pub fn fail_modesets(&self, fail: bool) {
        self.state.borrow_mut().fail_modesets = fail;
    }

    /// Buffers are still freed but `release` reports an error.
    pub fn fail_releases(&self, fail: bool) {
        self.state.borrow_mut().fail_releases = fail;
    }

    /// `(crtc, fb, connector, mode)` of every mode set.
    pub fn modesets(&self) -> Vec<(u32, u32, u32, MockMode)> {
        self.state.borrow().modesets.clone()
    }

    pub fn plane_updates(&self) -> Vec<PlaneUpdate> {
        self.state.borrow().plane_updates.clone()
    }

    pub fn commits(&self) -> Vec<PropertySet> {
        self.state.borrow().commits.clone()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.alloc.live()
    }
}

impl BufferAllocator for MockDisplay {
    fn allocate(&self, request: &BufferRequest) -> Result<BufferObject> {
        self.alloc.allocate(request)
    }

    fn release(&self, bo: BufferObject) -> Result<()> {
        self.alloc.release(bo)?;
        if self.state.borrow().fail_releases {
            return Err(Error::Allocation("scripted release failure".to_string()));
        }
        Ok(())
    }
}

impl DisplayBackend for MockDisplay {
    type Mode = MockMode;

    fn supports_atomic(&self) -> bool {
        self.state.borrow().atomic
    }

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo<MockMode>>> {
        Ok(self.state.borrow().connectors.clone())
    }

    fn encoders(&self) -> io::Result<Vec<EncoderInfo>> {
        Ok(self.state.borrow().encoders.clone())
    }

    fn crtcs(&self) -> io::Result<Vec<u32>> {
        Ok(self.state.borrow().crtcs.clone())
    }

    fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
        Ok(self.state.borrow().planes.clone())
    }

    fn plane_properties(&self, plane: u32) -> io::Result<Vec<(String, u32)>> {
        Ok(PLANE_PROPERTIES
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), plane * 100 + i as u32))
            .collect())
    }

    fn mode_size(&self, mode: &MockMode) -> (u32, u32) {
        (mode.width, mode.height)
    }

    fn add_framebuffer(&self, _bo: &BufferObject) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        let fb = state.next_fb;
        state.next_fb += 1;
        state.framebuffers.insert(fb);
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        if self.state.borrow_mut().framebuffers.remove(&fb) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn set_crtc(&self, crtc: u32, fb: u32, connector: u32, mode: &MockMode) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_modesets {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        state.modesets.push((crtc, fb, connector, *mode));
        Ok(())
    }

    fn set_plane(&self, plane: u32, crtc: u32, fb: u32, dst: Rect, src: Rect) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.reject_planes {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.plane_updates.push(PlaneUpdate {
            plane,
            crtc,
            fb,
            dst,
            src,
        });
        Ok(())
    }

    fn atomic_commit(&self, set: &PropertySet) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.reject_planes {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.commits.push(set.clone());
        Ok(())
    }
}

/// Observable state of a [`MockTransform`].
pub struct TransformState {
    pub capabilities: Capabilities,
    /// Most slots granted per queue.
    pub max_buffers: u32,
    pub reject_controls: Vec<Control>,
    pub reject_crop: bool,
    /// Format reported back instead of the requested one.
    pub substitute: Option<PixelFormat>,
    pub fail_dequeue: bool,
    /// Queued buffers never complete.
    pub stall: bool,
    /// Rows are padded to a multiple of this many bytes.
    pub row_alignment: Option<u32>,
    /// Slot index reported by the next dequeue instead of the oldest one.
    pub complete_index: Option<u32>,
    pub controls: Vec<(Control, i32)>,
    pub crops: Vec<(Direction, Rect)>,
    pub formats: HashMap<Direction, FrameFormat>,
    pub granted: HashMap<Direction, u32>,
    pub submitted: Vec<(Direction, u32)>,
    pub pending: HashMap<Direction, VecDeque<(u32, u32)>>,
    pub streaming: HashSet<Direction>,
    /// `(direction, on)` for every stream on / off.
    pub stream_log: Vec<(Direction, bool)>,
}

impl Default for TransformState {
    fn default() -> Self {
        TransformState {
            capabilities: Capabilities {
                driver: "mock".to_string(),
                card: "mock m2m".to_string(),
                bus_info: "platform:mock".to_string(),
                mem2mem: true,
                streaming: true,
            },
            max_buffers: 4,
            reject_controls: Vec::new(),
            reject_crop: false,
            substitute: None,
            fail_dequeue: false,
            stall: false,
            row_alignment: None,
            complete_index: None,
            controls: Vec::new(),
            crops: Vec::new(),
            formats: HashMap::new(),
            granted: HashMap::new(),
            submitted: Vec::new(),
            pending: HashMap::new(),
            streaming: HashSet::new(),
            stream_log: Vec::new(),
        }
    }
}

/// Scripted memory-to-memory device that completes buffers in order.
/// Clones share state.
#[derive(Clone, Default)]
pub struct MockTransform {
    state: Rc<RefCell<TransformState>>,
}

impl MockTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RefMut<'_, TransformState> {
        self.state.borrow_mut()
    }

    /// Whether a session still holds the device.
    pub fn is_open(&self) -> bool {
        Rc::strong_count(&self.state) > 1
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl TransformDevice for MockTransform {
    fn capabilities(&self) -> io::Result<Capabilities> {
        Ok(self.state.borrow().capabilities.clone())
    }

    fn set_control(&self, control: Control, value: i32) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.reject_controls.contains(&control) {
            return Err(einval());
        }
        state.controls.push((control, value));
        Ok(())
    }

    fn set_format(
        &self,
        direction: Direction,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> io::Result<FrameFormat> {
        let mut state = self.state.borrow_mut();
        let format = state.substitute.unwrap_or(format);
        let line = format.layout(width, height, 0).map_err(|_| einval())?.pitches[0];
        let pitch = match state.row_alignment {
            Some(align) => line.div_ceil(align) * align,
            None => line,
        };
        let layout = format
            .layout_with_pitch(width, height, 0, pitch)
            .map_err(|_| einval())?;
        let negotiated = FrameFormat {
            format,
            width,
            height,
            bytes_per_line: layout.pitches[0],
            size_image: layout.size as u32,
        };
        state.formats.insert(direction, negotiated);
        Ok(negotiated)
    }

    fn set_crop(&self, direction: Direction, rect: Rect) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.reject_crop {
            return Err(einval());
        }
        state.crops.push((direction, rect));
        Ok(())
    }

    fn request_buffers(&self, direction: Direction, count: u32) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        let granted = count.min(state.max_buffers);
        state.granted.insert(direction, granted);
        Ok(granted)
    }

    fn queue(
        &self,
        direction: Direction,
        index: u32,
        _fd: BorrowedFd<'_>,
        length: u32,
        bytes_used: u32,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let granted = state.granted.get(&direction).copied().unwrap_or_default();
        let size = state
            .formats
            .get(&direction)
            .map(|f| f.size_image)
            .unwrap_or_default();
        if index >= granted || length < size {
            return Err(einval());
        }
        let bytes_used = match direction {
            Direction::Input => bytes_used,
            Direction::Output => size,
        };
        state.submitted.push((direction, index));
        state
            .pending
            .entry(direction)
            .or_default()
            .push_back((index, bytes_used));
        Ok(())
    }

    fn dequeue(&self, direction: Direction, timeout: Option<Duration>) -> io::Result<Completion> {
        let mut state = self.state.borrow_mut();
        if state.fail_dequeue {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let completed = if state.stall {
            None
        } else {
            state.pending.get_mut(&direction).and_then(VecDeque::pop_front)
        };
        let Some((index, bytes_used)) = completed else {
            return Err(match timeout {
                Some(_) => io::Error::from(io::ErrorKind::TimedOut),
                None => io::Error::from(io::ErrorKind::WouldBlock),
            });
        };
        let index = state.complete_index.take().unwrap_or(index);
        Ok(Completion { index, bytes_used })
    }

    fn stream_on(&self, direction: Direction) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.streaming.insert(direction);
        state.stream_log.push((direction, true));
        Ok(())
    }

    fn stream_off(&self, direction: Direction) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.streaming.remove(&direction);
        state.pending.remove(&direction);
        state.stream_log.push((direction, false));
        Ok(())
    }
}
