// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Display resource management.
//!
//! [`DeviceContext`] owns an open display device together with the
//! connectors, encoders, CRTCs and planes enumerated from it. CRTCs and
//! planes live in arrays owned by the context and are referenced through
//! [`CrtcId`] and [`PlaneId`], so nothing can outlive the context.
//!
//! Plane configuration goes through one of two [`CommitStrategy`]
//! implementations chosen when the context is created: the legacy path
//! programs a plane immediately, the atomic path stages the plane properties
//! and applies every staged change in a single commit so that several planes
//! update within the same vertical blank.

use crate::{
    bo::{BoId, BufferAllocator, BufferFlags, BufferObject, BufferRequest},
    error::{Error, Result},
    format::{PixelFormat, Rect},
};
use core::fmt;
use std::{collections::HashMap, io};
use tracing::{debug, info, instrument, warn};

/// Connector descriptor as reported by the display backend.
#[derive(Clone, Debug)]
pub struct ConnectorInfo<M> {
    pub id: u32,
    pub connected: bool,
    /// Available modes, preferred mode first.
    pub modes: Vec<M>,
    /// Encoder currently driving the connector.
    pub encoder: Option<u32>,
    /// All encoders able to drive the connector.
    pub encoders: Vec<u32>,
}

/// Encoder descriptor as reported by the display backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: u32,
    /// CRTC currently attached to the encoder.
    pub crtc: Option<u32>,
    /// Bitmask of CRTC pipes this encoder can be attached to.
    pub possible_crtcs: u32,
}

/// Plane descriptor as reported by the display backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    /// Bitmask of CRTC pipes this plane can be attached to.
    pub possible_crtcs: u32,
    /// Supported DRM fourcc codes.
    pub formats: Vec<u32>,
}

/// One `(object, property, value)` triple of an atomic request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PropertyEntry {
    pub object: u32,
    pub property: u32,
    pub value: u64,
}

/// Pending atomic property changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertySet {
    entries: Vec<PropertyEntry>,
}

impl PropertySet {
    pub fn add(&mut self, object: u32, property: u32, value: u64) {
        self.entries.push(PropertyEntry {
            object,
            property,
            value,
        });
    }

    pub fn entries(&self) -> &[PropertyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Hardware access needed by [`DeviceContext`].
///
/// A display backend also allocates buffer objects since scanout buffers
/// must be importable as framebuffers.
pub trait DisplayBackend: BufferAllocator {
    type Mode: Clone + fmt::Debug;

    /// Whether the device accepted atomic mode setting.
    fn supports_atomic(&self) -> bool;

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo<Self::Mode>>>;

    fn encoders(&self) -> io::Result<Vec<EncoderInfo>>;

    /// CRTC ids in pipe order.
    fn crtcs(&self) -> io::Result<Vec<u32>>;

    fn planes(&self) -> io::Result<Vec<PlaneInfo>>;

    /// Property names and ids of a plane.
    fn plane_properties(&self, plane: u32) -> io::Result<Vec<(String, u32)>>;

    /// Active area of a mode in pixels.
    fn mode_size(&self, mode: &Self::Mode) -> (u32, u32);

    fn add_framebuffer(&self, bo: &BufferObject) -> io::Result<u32>;

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()>;

    fn set_crtc(&self, crtc: u32, fb: u32, connector: u32, mode: &Self::Mode) -> io::Result<()>;

    /// Programs a plane immediately. `src` is in 16.16 fixed point.
    fn set_plane(&self, plane: u32, crtc: u32, fb: u32, dst: Rect, src: Rect) -> io::Result<()>;

    fn atomic_commit(&self, set: &PropertySet) -> io::Result<()>;
}

/// Index of a CRTC within its [`DeviceContext`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CrtcId(usize);

impl CrtcId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of a plane within its [`DeviceContext`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlaneId(usize);

impl PlaneId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Buffer a CRTC scans out after mode setting.
#[derive(Debug)]
pub struct Scanout {
    pub bo: BufferObject,
    pub fb: u32,
    pub connector: u32,
}

#[derive(Debug)]
pub struct Crtc {
    pub id: u32,
    pub pipe: usize,
    pub num_planes: usize,
    scanout: Option<Scanout>,
}

impl Crtc {
    pub fn scanout(&self) -> Option<&Scanout> {
        self.scanout.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.scanout.is_some()
    }
}

/// Resolved ids of the plane properties used for atomic configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneProperties {
    pub crtc_id: Option<u32>,
    pub fb_id: Option<u32>,
    pub zpos: Option<u32>,
    pub crtc_x: Option<u32>,
    pub crtc_y: Option<u32>,
    pub crtc_w: Option<u32>,
    pub crtc_h: Option<u32>,
    pub src_x: Option<u32>,
    pub src_y: Option<u32>,
    pub src_w: Option<u32>,
    pub src_h: Option<u32>,
}

impl PlaneProperties {
    pub fn resolve(props: &[(String, u32)]) -> Self {
        let mut resolved = PlaneProperties::default();
        for (name, id) in props {
            let slot = match name.as_str() {
                "CRTC_ID" => &mut resolved.crtc_id,
                "FB_ID" => &mut resolved.fb_id,
                "zpos" | "ZPOS" => &mut resolved.zpos,
                "CRTC_X" => &mut resolved.crtc_x,
                "CRTC_Y" => &mut resolved.crtc_y,
                "CRTC_W" => &mut resolved.crtc_w,
                "CRTC_H" => &mut resolved.crtc_h,
                "SRC_X" => &mut resolved.src_x,
                "SRC_Y" => &mut resolved.src_y,
                "SRC_W" => &mut resolved.src_w,
                "SRC_H" => &mut resolved.src_h,
                _ => continue,
            };
            *slot = Some(*id);
        }
        resolved
    }
}

#[derive(Debug)]
pub struct Plane {
    pub id: u32,
    possible_crtcs: u32,
    formats: Vec<u32>,
    in_use: bool,
    bo: Option<BoId>,
    crtc: Option<CrtcId>,
    props: PlaneProperties,
}

impl Plane {
    fn new(info: PlaneInfo, props: PlaneProperties) -> Self {
        Plane {
            id: info.id,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            in_use: false,
            bo: None,
            crtc: None,
            props,
        }
    }

    /// True iff `format` is in the plane's supported set.
    pub fn supports_format(&self, format: PixelFormat) -> bool {
        let code = format.drm() as u32;
        self.formats.contains(&code)
    }

    pub fn can_attach(&self, crtc: &Crtc) -> bool {
        crtc.pipe < 32 && self.possible_crtcs & (1 << crtc.pipe) != 0
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Buffer currently attached, a non-owning reference.
    pub fn bo(&self) -> Option<BoId> {
        self.bo
    }

    pub fn crtc(&self) -> Option<CrtcId> {
        self.crtc
    }

    pub fn properties(&self) -> &PlaneProperties {
        &self.props
    }
}

/// Geometry of one plane update, shared by both commit strategies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneUpdate {
    pub plane: u32,
    pub crtc: u32,
    pub fb: u32,
    /// Destination on the CRTC in pixels.
    pub dst: Rect,
    /// Source within the framebuffer in 16.16 fixed point.
    pub src: Rect,
}

impl PlaneUpdate {
    /// Shows all of `bo` at `(x, y)` on the CRTC.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlaneConfig`] for a buffer wider or taller than the
    /// 16.16 source rectangle can express.
    pub fn new(
        plane: u32,
        crtc: u32,
        fb: u32,
        bo: &BufferObject,
        x: i32,
        y: i32,
    ) -> Result<Self> {
        let fixed = |v: u32| {
            v.checked_mul(1 << 16).ok_or_else(|| {
                Error::PlaneConfig(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{bo} is too large for a plane source"),
                ))
            })
        };
        Ok(PlaneUpdate {
            plane,
            crtc,
            fb,
            dst: Rect::new(x, y, bo.width(), bo.height()),
            src: Rect::new(0, 0, fixed(bo.width())?, fixed(bo.height())?),
        })
    }

    /// Property id / value pairs for an atomic request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlaneConfig`] when the plane lacks one of the
    /// required properties.
    pub fn properties(&self, props: &PlaneProperties) -> Result<Vec<(u32, u64)>> {
        let required = |id: Option<u32>, name: &str| {
            id.ok_or_else(|| {
                Error::PlaneConfig(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("plane {} has no {name} property", self.plane),
                ))
            })
        };
        Ok(vec![
            (required(props.crtc_id, "CRTC_ID")?, self.crtc as u64),
            (required(props.fb_id, "FB_ID")?, self.fb as u64),
            (required(props.crtc_x, "CRTC_X")?, self.dst.x as i64 as u64),
            (required(props.crtc_y, "CRTC_Y")?, self.dst.y as i64 as u64),
            (required(props.crtc_w, "CRTC_W")?, self.dst.width as u64),
            (required(props.crtc_h, "CRTC_H")?, self.dst.height as u64),
            (required(props.src_x, "SRC_X")?, self.src.x as i64 as u64),
            (required(props.src_y, "SRC_Y")?, self.src.y as i64 as u64),
            (required(props.src_w, "SRC_W")?, self.src.width as u64),
            (required(props.src_h, "SRC_H")?, self.src.height as u64),
        ])
    }
}

/// Caller preference for the plane commit path.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CommitPreference {
    /// Atomic when the device supports it.
    #[default]
    Auto,
    /// Always program planes immediately.
    Legacy,
}

/// Plane commit path, selected once per device context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Each configuration is applied synchronously with a plane update.
    Immediate,
    /// Configurations are staged and applied together by
    /// [`DeviceContext::commit`].
    Atomic { pending: PropertySet },
}

impl CommitStrategy {
    fn select(atomic: bool, preference: CommitPreference) -> Self {
        match (atomic, preference) {
            (true, CommitPreference::Auto) => CommitStrategy::Atomic {
                pending: PropertySet::default(),
            },
            _ => CommitStrategy::Immediate,
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, CommitStrategy::Atomic { .. })
    }
}

/// An open display device and the resources enumerated from it.
pub struct DeviceContext<B: DisplayBackend> {
    backend: B,
    strategy: CommitStrategy,
    connectors: Vec<ConnectorInfo<B::Mode>>,
    encoders: Vec<EncoderInfo>,
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
    framebuffers: HashMap<BoId, u32>,
    /// Attachments waiting for the next atomic commit.
    staged: Vec<(PlaneId, BoId, CrtcId)>,
}

impl<B: DisplayBackend> DeviceContext<B> {
    /// Wraps an open display device. Resources are enumerated by
    /// [`DeviceContext::initialize`].
    pub fn new(backend: B, preference: CommitPreference) -> Self {
        let strategy = CommitStrategy::select(backend.supports_atomic(), preference);
        debug!(
            "display context created, {} commits",
            if strategy.is_atomic() { "atomic" } else { "legacy" }
        );
        DeviceContext {
            backend,
            strategy,
            connectors: Vec::new(),
            encoders: Vec::new(),
            crtcs: Vec::new(),
            planes: Vec::new(),
            framebuffers: HashMap::new(),
            staged: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn strategy(&self) -> &CommitStrategy {
        &self.strategy
    }

    pub fn connectors(&self) -> &[ConnectorInfo<B::Mode>] {
        &self.connectors
    }

    pub fn encoders(&self) -> &[EncoderInfo] {
        &self.encoders
    }

    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn crtc(&self, id: CrtcId) -> Option<&Crtc> {
        self.crtcs.get(id.0)
    }

    pub fn plane(&self, id: PlaneId) -> Option<&Plane> {
        self.planes.get(id.0)
    }

    /// First CRTC that was lit by [`DeviceContext::initialize`].
    pub fn active_crtc(&self) -> Option<CrtcId> {
        self.crtcs.iter().position(Crtc::is_active).map(CrtcId)
    }

    fn enumerate(&mut self) -> Result<()> {
        self.connectors = self
            .backend
            .connectors()
            .map_err(|e| Error::io("enumerate connectors", e))?;
        self.encoders = self
            .backend
            .encoders()
            .map_err(|e| Error::io("enumerate encoders", e))?;
        self.crtcs = self
            .backend
            .crtcs()
            .map_err(|e| Error::io("enumerate crtcs", e))?
            .into_iter()
            .enumerate()
            .map(|(pipe, id)| Crtc {
                id,
                pipe,
                num_planes: 0,
                scanout: None,
            })
            .collect();

        let infos = self
            .backend
            .planes()
            .map_err(|e| Error::io("enumerate planes", e))?;
        let mut planes = Vec::with_capacity(infos.len());
        for info in infos {
            let props = match self.backend.plane_properties(info.id) {
                Ok(props) => PlaneProperties::resolve(&props),
                Err(e) => {
                    warn!("plane {} properties unavailable: {}", info.id, e);
                    PlaneProperties::default()
                }
            };
            planes.push(Plane::new(info, props));
        }
        self.planes = planes;

        for crtc in self.crtcs.iter_mut() {
            crtc.num_planes = self.planes.iter().filter(|p| p.can_attach(crtc)).count();
        }

        debug!(
            "enumerated {} connectors {} encoders {} crtcs {} planes",
            self.connectors.len(),
            self.encoders.len(),
            self.crtcs.len(),
            self.planes.len()
        );
        Ok(())
    }

    /// Picks a free CRTC for a connector, preferring the one its current
    /// encoder already drives.
    fn pick_crtc(&self, connector: &ConnectorInfo<B::Mode>) -> Option<CrtcId> {
        let candidates = connector
            .encoder
            .into_iter()
            .chain(connector.encoders.iter().copied());

        for encoder_id in candidates {
            let Some(encoder) = self.encoders.iter().find(|e| e.id == encoder_id) else {
                continue;
            };
            if let Some(current) = encoder.crtc {
                if let Some(index) = self
                    .crtcs
                    .iter()
                    .position(|c| c.id == current && !c.is_active())
                {
                    return Some(CrtcId(index));
                }
            }
            if let Some(index) = self.crtcs.iter().position(|c| {
                c.pipe < 32 && encoder.possible_crtcs & (1 << c.pipe) != 0 && !c.is_active()
            }) {
                return Some(CrtcId(index));
            }
        }
        None
    }

    fn discard_scanout(&self, bo: BufferObject) {
        let id = bo.id();
        if let Err(e) = self.backend.release(bo) {
            warn!("release scanout {}: {}", id, e);
        }
    }

    fn light_crtc(&mut self, crtc: CrtcId, connector: u32, mode: &B::Mode) -> Result<()> {
        let (width, height) = self.backend.mode_size(mode);
        let request = BufferRequest::new(width, height, PixelFormat::Xrgb32)
            .with_flags(BufferFlags::SCANOUT | BufferFlags::CONTIGUOUS);
        let bo = self.backend.allocate(&request)?;

        let fb = match self.backend.add_framebuffer(&bo) {
            Ok(fb) => fb,
            Err(e) => {
                self.discard_scanout(bo);
                return Err(Error::Allocation(format!("scanout framebuffer: {e}")));
            }
        };

        let crtc_id = self.crtcs[crtc.0].id;
        if let Err(e) = self.backend.set_crtc(crtc_id, fb, connector, mode) {
            if let Err(e) = self.backend.remove_framebuffer(fb) {
                warn!("remove framebuffer {}: {}", fb, e);
            }
            self.discard_scanout(bo);
            return Err(Error::io("set crtc", e));
        }

        info!(
            "crtc {} pipe {} lit {}x{} on connector {}",
            crtc_id, self.crtcs[crtc.0].pipe, width, height, connector
        );
        self.crtcs[crtc.0].scanout = Some(Scanout { bo, fb, connector });
        Ok(())
    }

    /// Enumerates the display resources and programs an initial mode on
    /// every connected connector. Returns the number of lit CRTCs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDisplay`] when no connector could be lit, which
    /// usually means a display server holds the device.
    #[instrument(skip_all)]
    pub fn initialize(&mut self) -> Result<usize> {
        self.enumerate()?;

        let mut active = 0;
        for index in 0..self.connectors.len() {
            let connector = &self.connectors[index];
            if !connector.connected || connector.modes.is_empty() {
                debug!("connector {} skipped: no active mode", connector.id);
                continue;
            }
            let Some(crtc) = self.pick_crtc(connector) else {
                warn!("connector {} has no free crtc", connector.id);
                continue;
            };
            let connector_id = connector.id;
            let mode = connector.modes[0].clone();
            match self.light_crtc(crtc, connector_id, &mode) {
                Ok(()) => active += 1,
                Err(e) => warn!("connector {}: {}", connector_id, e),
            }
        }

        if active == 0 {
            return Err(Error::NoDisplay);
        }
        Ok(active)
    }

    /// Claims an unused plane that can be attached to `crtc`.
    ///
    /// Returns `None` when every such plane is taken. Format matching is
    /// left to the caller through [`DeviceContext::supports_format`].
    pub fn acquire_plane(&mut self, crtc: CrtcId) -> Option<PlaneId> {
        let crtc = self.crtcs.get(crtc.0)?;
        let index = self
            .planes
            .iter()
            .position(|p| !p.in_use && p.can_attach(crtc))?;
        self.planes[index].in_use = true;
        debug!("plane {} acquired for crtc {}", self.planes[index].id, crtc.id);
        Some(PlaneId(index))
    }

    pub fn supports_format(&self, plane: PlaneId, format: PixelFormat) -> bool {
        self.planes
            .get(plane.0)
            .is_some_and(|p| p.supports_format(format))
    }

    /// Returns a plane to the free pool and drops its buffer reference. The
    /// hardware state is left as is.
    pub fn release_plane(&mut self, plane: PlaneId) {
        self.staged.retain(|(staged, _, _)| *staged != plane);
        if let Some(p) = self.planes.get_mut(plane.0) {
            p.in_use = false;
            p.bo = None;
            p.crtc = None;
            debug!("plane {} released", p.id);
        }
    }

    fn framebuffer(&mut self, bo: &BufferObject) -> Result<u32> {
        if let Some(fb) = self.framebuffers.get(&bo.id()) {
            return Ok(*fb);
        }
        let fb = self
            .backend
            .add_framebuffer(bo)
            .map_err(Error::PlaneConfig)?;
        debug!("framebuffer {} created for {}", fb, bo.id());
        self.framebuffers.insert(bo.id(), fb);
        Ok(fb)
    }

    /// Binds `bo` to `plane` on `crtc` with its top-left corner at `(x, y)`.
    ///
    /// With the atomic strategy the change is only staged; call
    /// [`DeviceContext::commit`] to apply it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] for a plane that was not acquired or is bound
    /// to another CRTC, and [`Error::PlaneConfig`] when the device rejects the
    /// configuration.
    pub fn configure_plane(
        &mut self,
        plane: PlaneId,
        crtc: CrtcId,
        bo: &BufferObject,
        x: i32,
        y: i32,
    ) -> Result<()> {
        let crtc_id = self
            .crtcs
            .get(crtc.0)
            .map(|c| c.id)
            .ok_or_else(|| Error::State(format!("no crtc at index {}", crtc.0)))?;
        let (plane_id, props) = {
            let p = self
                .planes
                .get(plane.0)
                .ok_or_else(|| Error::State(format!("no plane at index {}", plane.0)))?;
            if !p.in_use {
                return Err(Error::State(format!("plane {} was not acquired", p.id)));
            }
            let staged = self
                .staged
                .iter()
                .find(|(staged, _, _)| *staged == plane)
                .map(|(_, _, crtc)| *crtc);
            if p.crtc.or(staged).is_some_and(|bound| bound != crtc) {
                return Err(Error::State(format!(
                    "plane {} is bound to another crtc",
                    p.id
                )));
            }
            if !p.supports_format(bo.format()) {
                return Err(Error::PlaneConfig(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("plane {} does not support {}", p.id, bo.format()),
                )));
            }
            (p.id, p.props)
        };

        let fb = self.framebuffer(bo)?;
        let update = PlaneUpdate::new(plane_id, crtc_id, fb, bo, x, y)?;
        match &mut self.strategy {
            CommitStrategy::Immediate => {
                self.backend
                    .set_plane(update.plane, update.crtc, update.fb, update.dst, update.src)
                    .map_err(Error::PlaneConfig)?;
                let p = &mut self.planes[plane.0];
                p.bo = Some(bo.id());
                p.crtc = Some(crtc);
            }
            CommitStrategy::Atomic { pending } => {
                for (property, value) in update.properties(&props)? {
                    pending.add(update.plane, property, value);
                }
                self.staged.retain(|(staged, _, _)| *staged != plane);
                self.staged.push((plane, bo.id(), crtc));
            }
        }
        Ok(())
    }

    /// Applies every staged atomic change in one request. A no-op for the
    /// immediate strategy.
    ///
    /// Planes only report their new buffer once the commit succeeded; a
    /// rejected commit drops the staged changes and leaves them as they were.
    pub fn commit(&mut self) -> Result<()> {
        if let CommitStrategy::Atomic { pending } = &mut self.strategy {
            if pending.is_empty() {
                return Ok(());
            }
            let res = self.backend.atomic_commit(pending);
            pending.clear();
            let staged = std::mem::take(&mut self.staged);
            res.map_err(Error::PlaneConfig)?;
            for (plane, bo, crtc) in staged {
                if let Some(p) = self.planes.get_mut(plane.0) {
                    p.bo = Some(bo);
                    p.crtc = Some(crtc);
                }
            }
        }
        Ok(())
    }

    /// Removes the framebuffer created for `bo`. Must run before the buffer
    /// object is released.
    pub fn forget_buffer(&mut self, bo: BoId) {
        if let Some(fb) = self.framebuffers.remove(&bo) {
            if let Err(e) = self.backend.remove_framebuffer(fb) {
                warn!("remove framebuffer {}: {}", fb, e);
            }
        }
    }

    /// Releases every enumerated resource and closes the device.
    ///
    /// Safe to call whether or not [`DeviceContext::initialize`] succeeded.
    pub fn teardown(mut self) {
        for (_, fb) in self.framebuffers.drain() {
            if let Err(e) = self.backend.remove_framebuffer(fb) {
                warn!("remove framebuffer {}: {}", fb, e);
            }
        }
        for crtc in self.crtcs.drain(..) {
            if let Some(scanout) = crtc.scanout {
                if let Err(e) = self.backend.remove_framebuffer(scanout.fb) {
                    warn!("remove framebuffer {}: {}", scanout.fb, e);
                }
                if let Err(e) = self.backend.release(scanout.bo) {
                    warn!("release scanout of crtc {}: {}", crtc.id, e);
                }
            }
        }
        self.staged.clear();
        self.planes.clear();
        self.encoders.clear();
        self.connectors.clear();
        debug!("display context torn down");
    }
}
