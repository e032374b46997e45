// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Orchestration of the display, buffer and transform layers.
//!
//! [`execute`] runs one complete invocation: optional display setup, session
//! configuration, buffer allocation and binding, the transform loop and
//! teardown. Whatever step fails, the session is stopped, every buffer object
//! is released and the display context is torn down before the error is
//! returned.

use crate::{
    bo::{BufferAllocator, BufferFlags, BufferObject, BufferRequest, HeapAllocator},
    display::{CommitPreference, CrtcId, DeviceContext, DisplayBackend, PlaneId},
    drm::Card,
    error::{Error, Result},
    format::PixelFormat,
    transform::{Direction, FrameFormat, Presenter, Session, TransformConfig, TransformDevice},
};
use core::fmt;
use serde_json::{json, Value};
use std::{
    error::Error as StdError,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{info, instrument, trace, warn};

/// Allocator used for the transform buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferSource {
    /// DRM dumb buffers exported through PRIME.
    #[default]
    Dumb,
    /// Linux DMA heap, CMA.
    Cma,
    /// Linux DMA heap, system.
    System,
}

/// Everything one invocation needs, built once from the command line.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub device: PathBuf,
    pub card: PathBuf,
    pub transform: TransformConfig,
    pub frames: u32,
    /// Present each completed frame on a display plane.
    pub display: bool,
    pub allocator: BufferSource,
    pub src_buffers: u32,
    pub dst_buffers: u32,
    pub commit: CommitPreference,
    /// Upper bound on each dequeue.
    pub timeout: Option<Duration>,
    /// Fill the source buffers with a test pattern before streaming.
    pub pattern: bool,
    /// Write the last destination frame to this file.
    pub dump: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(transform: TransformConfig) -> Self {
        PipelineConfig {
            device: PathBuf::from("/dev/video0"),
            card: PathBuf::from("/dev/dri/card0"),
            transform,
            frames: 100,
            display: false,
            allocator: BufferSource::Dumb,
            src_buffers: 1,
            dst_buffers: 4,
            commit: CommitPreference::Auto,
            timeout: None,
            pattern: false,
            dump: None,
        }
    }
}

/// Outcome of a successful run.
#[derive(Clone, Debug, Default)]
pub struct Report {
    pub driver: Option<String>,
    pub card: Option<String>,
    pub source: Option<FrameFormat>,
    pub destination: Option<FrameFormat>,
    pub input_slots: u32,
    pub output_slots: u32,
    pub frames: u64,
    pub plane: Option<u32>,
    pub crtc: Option<u32>,
    pub warnings: Vec<String>,
    /// Time spent streaming.
    pub elapsed: Duration,
}

fn format_json(format: &Option<FrameFormat>) -> Value {
    match format {
        Some(f) => json!({
            "format": f.format.to_string(),
            "width": f.width,
            "height": f.height,
            "bytes_per_line": f.bytes_per_line,
            "size_image": f.size_image,
        }),
        None => Value::Null,
    }
}

impl Report {
    pub fn to_json(&self) -> Value {
        json!({
            "driver": self.driver,
            "card": self.card,
            "source": format_json(&self.source),
            "destination": format_json(&self.destination),
            "input_slots": self.input_slots,
            "output_slots": self.output_slots,
            "frames": self.frames,
            "plane": self.plane,
            "crtc": self.crtc,
            "warnings": self.warnings,
            "elapsed_us": self.elapsed.as_micros() as u64,
        })
    }

    /// Average frame rate over the streaming time.
    pub fn fps(&self) -> f64 {
        match self.elapsed.as_secs_f64() {
            secs if secs > 0.0 => self.frames as f64 / secs,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let (Some(src), Some(dst)) = (&self.source, &self.destination) {
            writeln!(f, "source: {src}")?;
            writeln!(f, "destination: {dst}")?;
        }
        writeln!(
            f,
            "buffers: {} input {} output",
            self.input_slots, self.output_slots
        )?;
        if let (Some(plane), Some(crtc)) = (self.plane, self.crtc) {
            writeln!(f, "display: plane {plane} crtc {crtc}")?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {warning}")?;
        }
        write!(
            f,
            "frames: {} use {} usecs ({:.1} fps)",
            self.frames,
            self.elapsed.as_micros(),
            self.fps()
        )
    }
}

#[derive(Default)]
struct Resources {
    source: Vec<BufferObject>,
    destination: Vec<BufferObject>,
    plane: Option<PlaneId>,
}

/// Shows completed frames on an acquired plane.
struct PlanePresenter<'a, B: DisplayBackend> {
    ctx: &'a mut DeviceContext<B>,
    plane: PlaneId,
    crtc: CrtcId,
}

impl<B: DisplayBackend> Presenter for PlanePresenter<'_, B> {
    fn present(&mut self, bo: &BufferObject) -> Result<()> {
        self.ctx.configure_plane(self.plane, self.crtc, bo, 0, 0)?;
        self.ctx.commit()
    }
}

fn allocator<'a, B: DisplayBackend>(
    ctx: &'a DeviceContext<B>,
    heap: Option<&'a dyn BufferAllocator>,
) -> &'a dyn BufferAllocator {
    match heap {
        Some(heap) => heap,
        None => ctx.backend(),
    }
}

/// Initializes the display and claims the first plane on the first active
/// CRTC that supports `format`. Planes acquired on the way are released.
#[instrument(skip(ctx))]
fn select_plane<B: DisplayBackend>(
    ctx: &mut DeviceContext<B>,
    format: PixelFormat,
) -> Result<(PlaneId, CrtcId)> {
    ctx.initialize()?;
    let crtc = ctx.active_crtc().ok_or(Error::NoDisplay)?;

    let mut rejected = Vec::new();
    let found = loop {
        match ctx.acquire_plane(crtc) {
            Some(plane) if ctx.supports_format(plane, format) => break Some(plane),
            Some(plane) => rejected.push(plane),
            None => break None,
        }
    };
    for plane in rejected {
        ctx.release_plane(plane);
    }

    let crtc_id = ctx.crtc(crtc).map(|c| c.id).unwrap_or_default();
    let plane = found.ok_or_else(|| {
        Error::Capability(format!("no plane on crtc {crtc_id} supports {format}"))
    })?;
    info!(
        "presenting on plane {} crtc {}",
        ctx.plane(plane).map(|p| p.id).unwrap_or_default(),
        crtc_id
    );
    Ok((plane, crtc))
}

/// Fills a buffer with eight vertical luma bars through its CPU mapping.
pub fn fill_test_pattern(bo: &mut BufferObject) -> Result<()> {
    const BARS: [u8; 8] = [235, 210, 170, 145, 106, 81, 41, 16];

    let width = bo.width() as usize;
    let height = bo.height() as usize;
    let format = bo.format();
    let bytes = (bo.bpp() as usize / 8).max(1);
    let layout = *bo.layout();
    let data = bo.map()?;

    if format.is_yuv() {
        let pitch = layout.pitches[0] as usize;
        let (luma, chroma) = data.split_at_mut(pitch * height);
        for line in luma.chunks_mut(pitch) {
            for (x, px) in line.iter_mut().enumerate() {
                *px = BARS[(x * BARS.len() / width).min(BARS.len() - 1)];
            }
        }
        chroma.fill(128);
    } else {
        let pitch = layout.pitches[0] as usize;
        for line in data.chunks_mut(pitch) {
            for (x, px) in line.chunks_mut(bytes).enumerate() {
                px.fill(BARS[(x * BARS.len() / width).min(BARS.len() - 1)]);
            }
        }
    }

    bo.unmap();
    Ok(())
}

fn write_frame(
    pixels: &[u8],
    path: Option<&Path>,
) -> std::result::Result<usize, Box<dyn StdError>> {
    let path = path.ok_or("no dump path")?;
    let mut file = File::create(path)?;
    file.write_all(pixels)?;
    Ok(pixels.len())
}

/// Writes the contents of `bo` to `path` through a synchronized dma-buf
/// mapping.
pub fn dump_frame(bo: &BufferObject, path: &Path) -> Result<usize> {
    let dma = bo.dmabuf()?;
    let mem = dma
        .memory_map()
        .map_err(|e| Error::Map(io::Error::other(e.to_string())))?;
    let written = mem
        .read(write_frame, Some(path))
        .map_err(|e| Error::io("dump frame", io::Error::other(e.to_string())))?;
    info!("wrote {} bytes of {} to {:?}", written, bo, path);
    Ok(written)
}

fn steps<B: DisplayBackend, D: TransformDevice>(
    config: &PipelineConfig,
    ctx: &mut DeviceContext<B>,
    session: &mut Session<D>,
    heap: Option<&dyn BufferAllocator>,
    res: &mut Resources,
    report: &mut Report,
) -> Result<()> {
    let target = if config.display {
        let (plane, crtc) = select_plane(ctx, config.transform.destination.format)?;
        res.plane = Some(plane);
        report.plane = ctx.plane(plane).map(|p| p.id);
        report.crtc = ctx.crtc(crtc).map(|c| c.id);
        Some((plane, crtc))
    } else {
        None
    };

    let warnings = session.configure(&config.transform)?;
    report.warnings = warnings.iter().map(ToString::to_string).collect();
    if let Some(caps) = session.capabilities() {
        report.driver = Some(caps.driver.clone());
        report.card = Some(caps.card.clone());
    }
    report.source = session.source_format().copied();
    report.destination = session.destination_format().copied();

    report.input_slots = session.request_buffers(Direction::Input, config.src_buffers)?;
    report.output_slots = session.request_buffers(Direction::Output, config.dst_buffers)?;

    for (direction, count) in [
        (Direction::Input, report.input_slots),
        (Direction::Output, report.output_slots),
    ] {
        let format = *session
            .format(direction)
            .ok_or_else(|| Error::State(format!("{direction} format not negotiated")))?;
        let flags = match direction {
            Direction::Output if config.display => BufferFlags::SCANOUT,
            _ => BufferFlags::NONE,
        };
        let request = BufferRequest::new(format.width, format.height, format.format)
            .with_pitch(format.bytes_per_line)
            .with_min_size(format.size_image as usize)
            .with_flags(flags);

        for index in 0..count {
            let mut bo = allocator(ctx, heap).allocate(&request)?;
            let prepared = match direction {
                Direction::Input if config.pattern => fill_test_pattern(&mut bo),
                _ => Ok(()),
            };
            let bound = prepared.and_then(|_| session.bind_buffer(direction, index, &mut bo));
            match direction {
                Direction::Input => res.source.push(bo),
                Direction::Output => res.destination.push(bo),
            }
            bound?;
        }
    }

    session.start()?;
    let started = Instant::now();
    let mut last = None;
    {
        let mut presenter = target.map(|(plane, crtc)| PlanePresenter {
            ctx: &mut *ctx,
            plane,
            crtc,
        });
        for frame in 0..config.frames {
            let cycle = session.run_cycle()?;
            let index = cycle.output.index as usize;
            let bo = res.destination.get(index).ok_or_else(|| {
                Error::State(format!("device returned unknown output slot {index}"))
            })?;
            session.present_if_requested(
                presenter.as_mut().map(|p| p as &mut dyn Presenter),
                bo,
            )?;
            if let Some(client) = tracy_client::Client::running() {
                client.frame_mark();
            }
            trace!(
                "frame {} input {} output {} bytes {}",
                frame,
                cycle.input.index,
                cycle.output.index,
                cycle.output.bytes_used
            );
            last = Some(index);
        }
    }
    report.elapsed = started.elapsed();
    report.frames = session.cycles();
    session.stop()?;

    if let (Some(path), Some(index)) = (&config.dump, last) {
        if let Some(bo) = res.destination.get(index) {
            dump_frame(bo, path)?;
        }
    }
    Ok(())
}

/// Runs one invocation against an open display context and transform
/// session.
///
/// Buffers come from `heap` when given, otherwise from the display backend.
/// The session, buffers and display context are released on every path.
#[instrument(skip_all)]
pub fn execute<B: DisplayBackend, D: TransformDevice>(
    config: &PipelineConfig,
    mut ctx: DeviceContext<B>,
    mut session: Session<D>,
    heap: Option<&dyn BufferAllocator>,
) -> Result<Report> {
    let mut report = Report::default();
    let mut res = Resources::default();

    let result = steps(config, &mut ctx, &mut session, heap, &mut res, &mut report);

    if let Err(e) = session.stop() {
        warn!("stop session: {}", e);
    }
    for bo in res.source.drain(..).chain(res.destination.drain(..)) {
        ctx.forget_buffer(bo.id());
        if let Err(e) = allocator(&ctx, heap).release(bo) {
            warn!("release buffer: {}", e);
        }
    }
    if let Some(plane) = res.plane.take() {
        ctx.release_plane(plane);
    }
    ctx.teardown();

    result.map(|()| report)
}

/// Opens the configured devices and runs [`execute`].
pub fn run(config: &PipelineConfig) -> Result<Report> {
    let ctx = DeviceContext::new(Card::open(&config.card)?, config.commit);
    let session = match Session::open(&config.device) {
        Ok(session) => session.with_timeout(config.timeout),
        Err(e) => {
            ctx.teardown();
            return Err(e);
        }
    };
    let heap = match config.allocator {
        BufferSource::Dumb => None,
        BufferSource::Cma => Some(HeapAllocator::cma()),
        BufferSource::System => Some(HeapAllocator::system()),
    };
    execute(
        config,
        ctx,
        session,
        heap.as_ref().map(|h| h as &dyn BufferAllocator),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        args::Args,
        mock::{MemfdAllocator, MockDisplay, MockTransform},
        transform::{FrameSpec, Operation},
    };
    use clap::Parser as _;

    fn nv12_config(frames: u32, display: bool) -> PipelineConfig {
        let mut config = PipelineConfig::new(TransformConfig::new(
            FrameSpec::new(PixelFormat::Nv12, 1024, 768),
            FrameSpec::new(PixelFormat::Nv12, 1024, 768),
        ));
        config.transform.operation = Operation::Copy;
        config.frames = frames;
        config.display = display;
        config.src_buffers = 1;
        config.dst_buffers = 1;
        config
    }

    #[test]
    fn test_single_frame_without_display() -> Result<()> {
        let args = Args::try_parse_from(["edgefirst-m2m", "--num-frames", "1"])
            .expect("valid arguments");
        let config = PipelineConfig::from(args);
        assert!(!config.display);
        let display = MockDisplay::single_output();
        let transform = MockTransform::new();

        let report = execute(
            &config,
            DeviceContext::new(display.clone(), CommitPreference::Auto),
            Session::new(transform.clone()),
            None,
        )?;

        assert_eq!(report.frames, 1);
        assert_eq!(report.input_slots, 1);
        assert_eq!(report.output_slots, 4);
        let src = report.source.expect("source format");
        let dst = report.destination.expect("destination format");
        assert_eq!((src.format, src.width, src.height), (PixelFormat::Nv12, 1024, 768));
        assert_eq!((dst.format, dst.width, dst.height), (PixelFormat::Nv12, 1024, 768));
        assert_eq!(report.plane, None);

        assert!(!transform.is_open());
        assert!(display.modesets().is_empty());
        assert_eq!(display.live_buffers(), 0);

        let state = transform.state();
        assert_eq!(state.granted.get(&Direction::Output), Some(&4));
        assert_eq!(
            state.submitted,
            vec![(Direction::Input, 0), (Direction::Output, 0)]
        );
        assert!(state.streaming.is_empty());
        Ok(())
    }

    #[test]
    fn test_heap_buffers_are_released() -> Result<()> {
        let transform = MockTransform::new();
        let heap = MemfdAllocator::default();

        let report = execute(
            &nv12_config(3, false),
            DeviceContext::new(MockDisplay::single_output(), CommitPreference::Auto),
            Session::new(transform.clone()),
            Some(&heap),
        )?;
        assert_eq!(report.frames, 3);
        assert_eq!((report.input_slots, report.output_slots), (1, 1));
        assert_eq!(heap.live(), 0);
        assert!(!transform.is_open());
        Ok(())
    }

    #[test]
    fn test_padded_stride() -> Result<()> {
        let transform = MockTransform::new();
        transform.state().row_alignment = Some(64);
        let heap = MemfdAllocator::default();
        let mut config = PipelineConfig::new(TransformConfig::new(
            FrameSpec::new(PixelFormat::Argb32, 1000, 600),
            FrameSpec::new(PixelFormat::Argb32, 1000, 600),
        ));
        config.frames = 2;
        config.pattern = true;

        let report = execute(
            &config,
            DeviceContext::new(MockDisplay::single_output(), CommitPreference::Auto),
            Session::new(transform.clone()),
            Some(&heap),
        )?;

        assert_eq!(report.frames, 2);
        for format in [report.source, report.destination] {
            let format = format.expect("negotiated format");
            assert_eq!(format.bytes_per_line, 4032);
            assert_eq!(format.size_image, 4032 * 600);
        }
        assert_eq!(heap.live(), 0);
        assert!(transform.state().streaming.is_empty());
        Ok(())
    }

    #[test]
    fn test_presentation() -> Result<()> {
        let display = MockDisplay::single_output();
        let transform = MockTransform::new();
        let mut config = nv12_config(3, true);
        config.dst_buffers = 4;

        let report = execute(
            &config,
            DeviceContext::new(display.clone(), CommitPreference::Auto),
            Session::new(transform),
            None,
        )?;

        assert_eq!(report.frames, 3);
        assert_eq!(report.output_slots, 4);
        // plane 50 only does RGB so 51 is the first NV12 match
        assert_eq!(report.plane, Some(51));
        assert_eq!(report.crtc, Some(40));
        assert_eq!(display.commits().len(), 3);
        assert_eq!(display.live_framebuffers(), 0);
        assert_eq!(display.live_buffers(), 0);
        Ok(())
    }

    #[test]
    fn test_legacy_presentation() -> Result<()> {
        let display = MockDisplay::single_output();
        let mut config = nv12_config(2, true);
        config.commit = CommitPreference::Legacy;

        execute(
            &config,
            DeviceContext::new(display.clone(), config.commit),
            Session::new(MockTransform::new()),
            None,
        )?;
        assert_eq!(display.plane_updates().len(), 2);
        assert!(display.commits().is_empty());
        Ok(())
    }

    #[test]
    fn test_no_display_releases_everything() {
        let display = MockDisplay::disconnected();
        let transform = MockTransform::new();

        let res = execute(
            &nv12_config(1, true),
            DeviceContext::new(display.clone(), CommitPreference::Auto),
            Session::new(transform.clone()),
            None,
        );
        let err = res.unwrap_err();
        assert!(matches!(err, Error::NoDisplay));
        assert_eq!(err.exit_code(), 3);
        assert!(transform.state().controls.is_empty());
        assert!(!transform.is_open());
        assert_eq!(display.live_buffers(), 0);
    }

    #[test]
    fn test_transfer_failure_releases_everything() {
        let display = MockDisplay::single_output();
        let transform = MockTransform::new();
        transform.state().fail_dequeue = true;
        let heap = MemfdAllocator::default();

        let res = execute(
            &nv12_config(5, true),
            DeviceContext::new(display.clone(), CommitPreference::Auto),
            Session::new(transform.clone()),
            Some(&heap),
        );
        assert!(matches!(res, Err(Error::Transfer { .. })));
        assert_eq!(heap.live(), 0);
        assert!(!transform.is_open());
        assert!(transform.state().streaming.is_empty());
        assert_eq!(display.live_framebuffers(), 0);
        assert_eq!(display.live_buffers(), 0);
    }

    #[test]
    fn test_missing_plane_format() {
        let display = MockDisplay::single_output();
        let mut config = nv12_config(1, true);
        config.transform.destination.format = PixelFormat::Rgb565;

        let res = execute(
            &config,
            DeviceContext::new(display.clone(), CommitPreference::Auto),
            Session::new(MockTransform::new()),
            None,
        );
        assert!(matches!(res, Err(Error::Capability(_))));
        assert_eq!(display.live_buffers(), 0);
    }

    #[test]
    fn test_fill_test_pattern() -> Result<()> {
        let alloc = MemfdAllocator::default();

        let mut bo = alloc.allocate(&BufferRequest::new(64, 4, PixelFormat::Nv12))?;
        fill_test_pattern(&mut bo)?;
        assert!(!bo.is_mapped());
        let data = bo.map()?;
        assert_eq!(data[0], 235);
        assert_eq!(data[63], 16);
        assert_eq!(data[64 * 4], 128);
        alloc.release(bo)?;

        let mut bo = alloc.allocate(&BufferRequest::new(16, 2, PixelFormat::Argb32))?;
        fill_test_pattern(&mut bo)?;
        let data = bo.map()?;
        assert_eq!(&data[..4], &[235; 4]);
        assert_eq!(&data[60..64], &[16; 4]);
        alloc.release(bo)
    }

    #[test]
    fn test_report_json() {
        let report = Report {
            frames: 10,
            input_slots: 1,
            output_slots: 4,
            elapsed: Duration::from_millis(500),
            ..Default::default()
        };
        let json = report.to_json();
        assert_eq!(json["frames"], 10);
        assert_eq!(json["output_slots"], 4);
        assert_eq!(json["elapsed_us"], 500_000);
        assert!(json["plane"].is_null());
        assert!((report.fps() - 20.0).abs() < 1e-9);
    }
}
