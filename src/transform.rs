// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory-to-memory transform session.
//!
//! A [`Session`] drives a transform device through
//! `Closed → Configured → Streaming → Draining → Closed`. The device itself
//! is reached through the [`TransformDevice`] trait, implemented for real
//! hardware by [`crate::v4l2::V4l2Device`].
//!
//! The *input* queue feeds source frames into the device and the *output*
//! queue receives the transformed frames. Each queue is an arena of
//! [`Slot`]s sized by the count the device granted.

use crate::{
    bo::{BoId, BufferObject},
    error::{Error, Result},
    format::{PixelFormat, Rect},
    v4l2::V4l2Device,
};
use core::fmt;
use std::{
    collections::VecDeque,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Buffer queue of a transform session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Source frames read by the device.
    Input,
    /// Destination frames written by the device.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Identity and capabilities reported by the device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub mem2mem: bool,
    pub streaming: bool,
}

/// Control parameters of the transform device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Control {
    HFlip,
    VFlip,
    Rotate,
    FillColor,
    Operation,
    Alpha0,
    Alpha1,
}

impl Control {
    pub const fn name(self) -> &'static str {
        match self {
            Control::HFlip => "HFLIP",
            Control::VFlip => "VFLIP",
            Control::Rotate => "ROTATE",
            Control::FillColor => "BG_COLOR",
            Control::Operation => "RGA_OP",
            Control::Alpha0 => "ALPHA_REG0",
            Control::Alpha1 => "ALPHA_REG1",
        }
    }
}

/// Format negotiated for one queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}x{} stride {} size {}",
            self.format, self.width, self.height, self.bytes_per_line, self.size_image
        )
    }
}

/// A buffer returned by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub index: u32,
    pub bytes_used: u32,
}

/// Operations a memory-to-memory transform device must provide.
pub trait TransformDevice {
    fn capabilities(&self) -> io::Result<Capabilities>;

    fn set_control(&self, control: Control, value: i32) -> io::Result<()>;

    /// Negotiates the format of one queue, returning what the device chose.
    fn set_format(
        &self,
        direction: Direction,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> io::Result<FrameFormat>;

    /// Sets the crop (input) or compose (output) rectangle.
    fn set_crop(&self, direction: Direction, rect: Rect) -> io::Result<()>;

    /// Requests `count` DMABUF slots and returns the granted count.
    fn request_buffers(&self, direction: Direction, count: u32) -> io::Result<u32>;

    fn queue(
        &self,
        direction: Direction,
        index: u32,
        fd: BorrowedFd<'_>,
        length: u32,
        bytes_used: u32,
    ) -> io::Result<()>;

    /// Waits for the oldest submitted buffer of `direction`. `None` blocks
    /// until the device completes it.
    fn dequeue(&self, direction: Direction, timeout: Option<Duration>) -> io::Result<Completion>;

    fn stream_on(&self, direction: Direction) -> io::Result<()>;

    fn stream_off(&self, direction: Direction) -> io::Result<()>;
}

/// Transform applied by the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Operation {
    #[default]
    Copy,
    SolidFill,
    AlphaBlend,
}

impl Operation {
    pub const fn value(self) -> i32 {
        match self {
            Operation::Copy => 0,
            Operation::SolidFill => 1,
            Operation::AlphaBlend => 2,
        }
    }
}

/// How an unsized crop rectangle receives its default size.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CropDefaults {
    /// Width becomes the frame height and height stays zero, matching the
    /// behaviour of earlier releases of the tool.
    #[default]
    Legacy,
    /// Width and height become the full frame size.
    Full,
}

/// Format, size and crop of one side of the transform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameSpec {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub crop: Rect,
}

impl FrameSpec {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        FrameSpec {
            format,
            width,
            height,
            crop: Rect::default(),
        }
    }

    pub fn with_crop(mut self, crop: Rect) -> Self {
        self.crop = crop;
        self
    }
}

/// Crop rectangle to program for a frame, or `None` when no crop was given.
///
/// A crop with an offset but no size receives default dimensions according
/// to `defaults`. Any other zero size passes through unchanged.
pub fn normalize_crop(crop: Rect, width: u32, height: u32, defaults: CropDefaults) -> Option<Rect> {
    if crop.is_zero() {
        return None;
    }
    if crop.width != 0 || crop.height != 0 {
        return Some(crop);
    }
    Some(match defaults {
        CropDefaults::Legacy => Rect::new(crop.x, crop.y, height, 0),
        CropDefaults::Full => Rect::new(crop.x, crop.y, width, height),
    })
}

/// Region of the frame the device works on.
pub fn effective_crop(crop: Rect, width: u32, height: u32, defaults: CropDefaults) -> Rect {
    normalize_crop(crop, width, height, defaults).unwrap_or(Rect::new(0, 0, width, height))
}

/// Immutable transform configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformConfig {
    pub source: FrameSpec,
    pub destination: FrameSpec,
    pub operation: Operation,
    /// RGB fill colour for [`Operation::SolidFill`].
    pub fill_color: Option<u32>,
    /// Rotation in degrees.
    pub rotation: u32,
    pub hflip: bool,
    pub vflip: bool,
    /// Raw alpha blend register values.
    pub alpha: (Option<u32>, Option<u32>),
    pub crop_defaults: CropDefaults,
}

impl TransformConfig {
    pub fn new(source: FrameSpec, destination: FrameSpec) -> Self {
        TransformConfig {
            source,
            destination,
            operation: Operation::Copy,
            fill_color: None,
            rotation: 0,
            hflip: false,
            vflip: false,
            alpha: (None, None),
            crop_defaults: CropDefaults::Legacy,
        }
    }

    /// Controls to program in order. Zero values are left at the device
    /// default, the operation is always set.
    pub fn controls(&self) -> Vec<(Control, i32)> {
        let optional = [
            (Control::HFlip, self.hflip as u32),
            (Control::VFlip, self.vflip as u32),
            (Control::Rotate, self.rotation),
            (Control::FillColor, self.fill_color.unwrap_or(0)),
        ];
        let alpha = [
            (Control::Alpha0, self.alpha.0.unwrap_or(0)),
            (Control::Alpha1, self.alpha.1.unwrap_or(0)),
        ];

        optional
            .into_iter()
            .filter(|(_, value)| *value != 0)
            .map(|(control, value)| (control, value as i32))
            .chain([(Control::Operation, self.operation.value())])
            .chain(
                alpha
                    .into_iter()
                    .filter(|(_, value)| *value != 0)
                    .map(|(control, value)| (control, value as i32)),
            )
            .collect()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Closed,
    Configured,
    Streaming,
    Draining,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Free,
    Queued,
    Done,
}

/// One position of a buffer queue.
#[derive(Debug, Default)]
pub struct Slot {
    bo: Option<BoId>,
    fd: Option<OwnedFd>,
    length: u32,
    state: SlotState,
}

impl Slot {
    pub fn bo(&self) -> Option<BoId> {
        self.bo
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.fd.is_some()
    }
}

#[derive(Debug)]
struct Queue {
    direction: Direction,
    slots: Vec<Slot>,
    in_flight: VecDeque<u32>,
    next: usize,
}

impl Queue {
    fn new(direction: Direction) -> Self {
        Queue {
            direction,
            slots: Vec::new(),
            in_flight: VecDeque::new(),
            next: 0,
        }
    }

    fn has_bound(&self) -> bool {
        self.slots.iter().any(Slot::is_bound)
    }

    /// Next bound slot that is not in flight, round robin.
    fn next_ready(&self) -> Option<usize> {
        let len = self.slots.len();
        (0..len)
            .map(|offset| (self.next + offset) % len)
            .find(|&i| self.slots[i].is_bound() && self.slots[i].state != SlotState::Queued)
    }

    fn submit<D: TransformDevice>(&mut self, device: &D, bytes_used: u32) -> Result<u32> {
        let index = self.next_ready().ok_or_else(|| {
            Error::State(format!("no {} slot ready for submission", self.direction))
        })?;
        let slot = &mut self.slots[index];
        let Some(fd) = slot.fd.as_ref() else {
            return Err(Error::State(format!(
                "{} slot {index} is unbound",
                self.direction
            )));
        };
        device
            .queue(
                self.direction,
                index as u32,
                fd.as_fd(),
                slot.length,
                bytes_used.min(slot.length),
            )
            .map_err(|e| Error::transfer("VIDIOC_QBUF", e))?;

        slot.state = SlotState::Queued;
        self.in_flight.push_back(index as u32);
        self.next = (index + 1) % self.slots.len();
        Ok(index as u32)
    }

    fn complete<D: TransformDevice>(
        &mut self,
        device: &D,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        let completion = device
            .dequeue(self.direction, timeout)
            .map_err(|e| Error::transfer("VIDIOC_DQBUF", e))?;

        let expected = self.in_flight.front().copied();
        if expected != Some(completion.index) {
            return Err(Error::transfer(
                "VIDIOC_DQBUF",
                io::Error::other(format!(
                    "{} slot {} completed out of order, expected {:?}",
                    self.direction, completion.index, expected
                )),
            ));
        }
        self.in_flight.pop_front();
        self.slots[completion.index as usize].state = SlotState::Done;
        Ok(completion)
    }

    fn reset(&mut self) {
        self.in_flight.clear();
        self.next = 0;
        for slot in self.slots.iter_mut() {
            slot.state = SlotState::Free;
            slot.fd = None;
        }
    }
}

/// Input and output completions of one transform cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cycle {
    pub input: Completion,
    pub output: Completion,
}

/// Receives completed destination buffers.
pub trait Presenter {
    fn present(&mut self, bo: &BufferObject) -> Result<()>;
}

/// Open connection to a memory-to-memory transform device.
pub struct Session<D: TransformDevice> {
    device: Option<D>,
    state: SessionState,
    capabilities: Option<Capabilities>,
    source: Option<FrameFormat>,
    destination: Option<FrameFormat>,
    input: Queue,
    output: Queue,
    timeout: Option<Duration>,
    cycles: u64,
}

impl Session<V4l2Device> {
    /// Opens the transform device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Session::new(V4l2Device::open(path)?))
    }
}

impl<D: TransformDevice> Session<D> {
    /// Wraps an open device. The session starts in [`SessionState::Closed`]
    /// and becomes usable after [`Session::configure`].
    pub fn new(device: D) -> Self {
        Session {
            device: Some(device),
            state: SessionState::Closed,
            capabilities: None,
            source: None,
            destination: None,
            input: Queue::new(Direction::Input),
            output: Queue::new(Direction::Output),
            timeout: None,
            cycles: 0,
        }
    }

    /// Bounds every dequeue by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub fn source_format(&self) -> Option<&FrameFormat> {
        self.source.as_ref()
    }

    pub fn destination_format(&self) -> Option<&FrameFormat> {
        self.destination.as_ref()
    }

    pub fn format(&self, direction: Direction) -> Option<&FrameFormat> {
        match direction {
            Direction::Input => self.source.as_ref(),
            Direction::Output => self.destination.as_ref(),
        }
    }

    pub fn slots(&self, direction: Direction) -> &[Slot] {
        &self.queue(direction).slots
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn queue(&self, direction: Direction) -> &Queue {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    fn queue_mut(&mut self, direction: Direction) -> &mut Queue {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    fn expect_state(&self, expected: SessionState, step: &str) -> Result<&D> {
        if self.state != expected {
            return Err(Error::State(format!(
                "{step} requires a {expected:?} session, found {:?}",
                self.state
            )));
        }
        self.device
            .as_ref()
            .ok_or_else(|| Error::State(format!("{step} on a closed device")))
    }

    /// Programs controls, formats and crops.
    ///
    /// Rejected controls and crops are returned as
    /// [`Error::Configuration`] warnings. A device without memory-to-memory
    /// streaming support or one that refuses a format fails the call.
    #[instrument(skip_all)]
    pub fn configure(&mut self, config: &TransformConfig) -> Result<Vec<Error>> {
        let device = self.expect_state(SessionState::Closed, "configure")?;

        let caps = device
            .capabilities()
            .map_err(|e| Error::Capability(format!("VIDIOC_QUERYCAP: {e}")))?;
        info!(
            "transform device {} driver {} bus {}",
            caps.card, caps.driver, caps.bus_info
        );
        if !caps.mem2mem {
            return Err(Error::Capability(format!(
                "{} is not a memory-to-memory device",
                caps.card
            )));
        }
        if !caps.streaming {
            return Err(Error::Capability(format!(
                "{} does not support streaming I/O",
                caps.card
            )));
        }

        let mut warnings = Vec::new();
        for (control, value) in config.controls() {
            match device.set_control(control, value) {
                Ok(()) => debug!("{} = {:#x}", control.name(), value),
                Err(source) => {
                    let err = Error::Configuration {
                        control: control.name(),
                        source,
                    };
                    warn!("{}", err);
                    warnings.push(err);
                }
            }
        }

        let source = negotiate(device, Direction::Input, &config.source)?;
        let destination = negotiate(device, Direction::Output, &config.destination)?;

        for (direction, spec, control) in [
            (Direction::Input, &config.source, "crop"),
            (Direction::Output, &config.destination, "compose"),
        ] {
            let Some(crop) =
                normalize_crop(spec.crop, spec.width, spec.height, config.crop_defaults)
            else {
                continue;
            };
            match device.set_crop(direction, crop) {
                Ok(()) => debug!("{} {} {}", direction, control, crop),
                Err(source) => {
                    let err = Error::Configuration { control, source };
                    warn!("{} {}", direction, err);
                    warnings.push(err);
                }
            }
        }

        self.capabilities = Some(caps);
        self.source = Some(source);
        self.destination = Some(destination);
        self.state = SessionState::Configured;
        Ok(warnings)
    }

    /// Requests `count` slots for `direction`; the slot arena takes the
    /// granted size, which may be smaller.
    pub fn request_buffers(&mut self, direction: Direction, count: u32) -> Result<u32> {
        let device = self.expect_state(SessionState::Configured, "request buffers")?;
        let granted = device
            .request_buffers(direction, count)
            .map_err(|e| Error::Allocation(format!("VIDIOC_REQBUFS {direction}: {e}")))?;
        if granted == 0 {
            return Err(Error::Allocation(format!(
                "device granted no {direction} buffers"
            )));
        }
        if granted < count {
            info!("{} buffers: requested {} granted {}", direction, count, granted);
        } else {
            debug!("{} buffers: {}", direction, granted);
        }

        let queue = self.queue_mut(direction);
        queue.slots = (0..granted).map(|_| Slot::default()).collect();
        queue.in_flight.clear();
        queue.next = 0;
        Ok(granted)
    }

    /// Binds an exported buffer object to slot `index` of `direction`.
    ///
    /// The session keeps its own duplicate of the dma-buf descriptor; the
    /// buffer object itself stays owned by the caller.
    pub fn bind_buffer(
        &mut self,
        direction: Direction,
        index: u32,
        bo: &mut BufferObject,
    ) -> Result<()> {
        self.expect_state(SessionState::Configured, "bind buffer")?;
        let required = self
            .format(direction)
            .map(|f| f.size_image as usize)
            .unwrap_or_default();
        if bo.size() < required {
            return Err(Error::Allocation(format!(
                "{} holds {} bytes, {} frames need {}",
                bo,
                bo.size(),
                direction,
                required
            )));
        }
        let length = u32::try_from(bo.size())
            .map_err(|_| Error::Allocation(format!("{bo} is too large to queue")))?;
        let fd = bo.export()?.try_clone_to_owned().map_err(Error::Export)?;

        let queue = self.queue_mut(direction);
        let slot = queue.slots.get_mut(index as usize).ok_or_else(|| {
            Error::State(format!("{direction} slot {index} was not granted"))
        })?;
        slot.bo = Some(bo.id());
        slot.fd = Some(fd);
        slot.length = length;
        slot.state = SlotState::Free;
        debug!("{} bound to {} slot {}", bo, direction, index);
        Ok(())
    }

    /// Enables streaming on the input then the output queue.
    #[instrument(skip_all)]
    pub fn start(&mut self) -> Result<()> {
        let device = self.expect_state(SessionState::Configured, "start")?;
        for queue in [&self.input, &self.output] {
            if !queue.has_bound() {
                return Err(Error::State(format!(
                    "{} queue has no bound buffers",
                    queue.direction
                )));
            }
        }

        device
            .stream_on(Direction::Input)
            .map_err(|e| Error::Capability(format!("VIDIOC_STREAMON input: {e}")))?;
        if let Err(e) = device.stream_on(Direction::Output) {
            if let Err(e) = device.stream_off(Direction::Input) {
                warn!("input stream off: {}", e);
            }
            return Err(Error::Capability(format!("VIDIOC_STREAMON output: {e}")));
        }

        self.state = SessionState::Streaming;
        info!("streaming");
        Ok(())
    }

    /// Submits one input and one output slot and waits for both to
    /// complete.
    pub fn run_cycle(&mut self) -> Result<Cycle> {
        self.expect_state(SessionState::Streaming, "run cycle")?;
        let Some(device) = self.device.as_ref() else {
            return Err(Error::State("run cycle on a closed device".to_string()));
        };
        let bytes_used = self.source.map(|f| f.size_image).unwrap_or_default();

        self.input.submit(device, bytes_used)?;
        self.output.submit(device, 0)?;
        let input = self.input.complete(device, self.timeout)?;
        let output = self.output.complete(device, self.timeout)?;

        self.cycles += 1;
        Ok(Cycle { input, output })
    }

    /// Hands a completed destination buffer to `presenter`, when one is
    /// given. Returns whether the frame was presented.
    pub fn present_if_requested(
        &self,
        presenter: Option<&mut (dyn Presenter + '_)>,
        bo: &BufferObject,
    ) -> Result<bool> {
        let Some(presenter) = presenter else {
            return Ok(false);
        };
        if !self.output.slots.iter().any(|s| s.bo == Some(bo.id())) {
            return Err(Error::State(format!("{bo} is not a bound output buffer")));
        }
        presenter.present(bo)?;
        Ok(true)
    }

    /// Stops streaming and closes the device.
    ///
    /// Disables the output queue then the input queue. Bound buffer objects
    /// are left to their owner. Calling `stop` on a stopped session does
    /// nothing.
    #[instrument(skip_all)]
    pub fn stop(&mut self) -> Result<()> {
        let mut result = Ok(());
        if matches!(self.state, SessionState::Streaming | SessionState::Draining) {
            self.state = SessionState::Draining;
            if let Some(device) = self.device.as_ref() {
                for direction in [Direction::Output, Direction::Input] {
                    if let Err(e) = device.stream_off(direction) {
                        warn!("{} stream off: {}", direction, e);
                        if result.is_ok() {
                            result = Err(Error::io("VIDIOC_STREAMOFF", e));
                        }
                    }
                }
            }
        }

        self.input.reset();
        self.output.reset();
        if self.device.take().is_some() {
            debug!("transform device closed after {} cycles", self.cycles);
        }
        self.state = SessionState::Closed;
        result
    }
}

impl<D: TransformDevice> Drop for Session<D> {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Streaming | SessionState::Draining) {
            if let Err(e) = self.stop() {
                warn!("session drop: {}", e);
            }
        }
    }
}

fn negotiate<D: TransformDevice>(
    device: &D,
    direction: Direction,
    spec: &FrameSpec,
) -> Result<FrameFormat> {
    let negotiated = device
        .set_format(direction, spec.format, spec.width, spec.height)
        .map_err(|e| {
            Error::Capability(format!(
                "{direction} format {} {}x{}: {e}",
                spec.format, spec.width, spec.height
            ))
        })?;
    if negotiated.format != spec.format {
        return Err(Error::Capability(format!(
            "{direction} format {} replaced by {}",
            spec.format, negotiated.format
        )));
    }
    if negotiated.width != spec.width || negotiated.height != spec.height {
        warn!(
            "{} size {}x{} adjusted to {}x{}",
            direction, spec.width, spec.height, negotiated.width, negotiated.height
        );
    }
    info!("{} {}", direction, negotiated);
    Ok(negotiated)
}
