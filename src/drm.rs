// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! DRM/KMS display backend.
//!
//! [`Card`] wraps a DRM device node. It enumerates display resources for
//! [`crate::display::DeviceContext`] and allocates dumb buffers that are
//! exported through PRIME so the transform device can write into them.

use crate::{
    bo::{BoId, BufferAllocator, BufferObject, BufferRequest},
    display::{ConnectorInfo, DisplayBackend, EncoderInfo, PlaneInfo, PropertySet},
    error::{Error, Result},
    format::{Layout, Rect},
};
use drm::{
    buffer::{self, Buffer, DrmFourcc, DrmModifier, PlanarBuffer},
    control::{
        atomic::AtomicModeReq, connector, crtc, dumbbuffer::DumbBuffer, framebuffer, from_u32,
        plane, property, AtomicCommitFlags, CrtcListFilter, Device as ControlDevice,
        FbCmd2Flags, Mode, ResourceHandle, ResourceHandles,
    },
    ClientCapability, Device as DrmDevice,
};
use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    os::fd::{AsFd, BorrowedFd},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// An open DRM device node.
pub struct Card {
    file: File,
    path: PathBuf,
    atomic: bool,
    dumb: RefCell<HashMap<BoId, DumbBuffer>>,
    imported: RefCell<HashMap<u32, buffer::Handle>>,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl DrmDevice for Card {}
impl ControlDevice for Card {}

fn handle<H: ResourceHandle>(id: u32) -> io::Result<H> {
    from_u32::<H>(id).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid object id {id}"))
    })
}

/// Converts a possible-CRTC filter to a bitmask over the pipe order of
/// `res.crtcs()`.
fn crtc_mask(res: &ResourceHandles, filter: CrtcListFilter) -> u32 {
    let allowed = res.filter_crtcs(filter);
    res.crtcs()
        .iter()
        .enumerate()
        .filter(|(pipe, crtc)| *pipe < 32 && allowed.contains(*crtc))
        .fold(0, |mask, (pipe, _)| mask | 1 << pipe)
}

/// Dumb buffer geometry for a layout. YUV frames and frames with a
/// negotiated pitch or size are allocated as an 8-bit surface one pitch wide
/// and tall enough to hold every plane.
fn dumb_geometry(request: &BufferRequest, layout: &Layout) -> Result<(u32, u32, u32)> {
    if !request.format.is_yuv() && !request.is_padded() {
        return Ok((request.width, request.height, request.bits_per_pixel()));
    }
    let width = layout.pitches[0].max(1);
    let height = u32::try_from(layout.size.div_ceil(width as usize)).map_err(|_| {
        Error::Allocation(format!("{} bytes exceed a dumb buffer", layout.size))
    })?;
    Ok((width, height, 8))
}

/// Framebuffer description of a buffer object.
struct Framebuffer<'a> {
    bo: &'a BufferObject,
    handle: buffer::Handle,
}

impl PlanarBuffer for Framebuffer<'_> {
    fn size(&self) -> (u32, u32) {
        (self.bo.width(), self.bo.height())
    }

    fn format(&self) -> DrmFourcc {
        self.bo.format().drm()
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.bo.layout().pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        let planes = self.bo.layout().planes;
        let mut handles = [None; 4];
        for handle in handles.iter_mut().take(planes) {
            *handle = Some(self.handle);
        }
        handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.bo.layout().offsets
    }
}

impl Card {
    /// Opens the DRM device at `path` and enables universal planes and, when
    /// the driver allows it, atomic mode setting.
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
        let mut card = Card {
            file,
            path,
            atomic: false,
            dumb: RefCell::default(),
            imported: RefCell::default(),
        };

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|e| Error::Capability(format!("universal planes: {e}")))?;
        card.atomic = card
            .set_client_capability(ClientCapability::Atomic, true)
            .is_ok();

        match card.get_driver() {
            Ok(driver) => info!(
                "{:?} driver {} ({}) atomic: {}",
                card.path,
                driver.name().to_string_lossy(),
                driver.description().to_string_lossy(),
                card.atomic
            ),
            Err(e) => warn!("{:?} driver query: {}", card.path, e),
        }
        Ok(card)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn buffer_handle(&self, bo: &BufferObject) -> io::Result<(buffer::Handle, bool)> {
        if let Some(dumb) = self.dumb.borrow().get(&bo.id()) {
            return Ok((dumb.handle(), false));
        }
        let handle = self.prime_fd_to_buffer(bo.fd())?;
        Ok((handle, true))
    }
}

impl BufferAllocator for Card {
    fn allocate(&self, request: &BufferRequest) -> Result<BufferObject> {
        let mut layout = request.layout()?;
        let (width, height, bpp) = dumb_geometry(request, &layout)?;
        let dumb = self
            .create_dumb_buffer((width, height), request.format.drm(), bpp)
            .map_err(|e| Error::Allocation(format!("dumb buffer {width}x{height}@{bpp}: {e}")))?;

        let flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
        let fd = match self.buffer_to_prime_fd(dumb.handle(), flags) {
            Ok(fd) => fd,
            Err(e) => {
                if let Err(e) = self.destroy_dumb_buffer(dumb) {
                    warn!("destroy dumb buffer: {}", e);
                }
                return Err(Error::Export(e));
            }
        };

        if !request.format.is_yuv() && !request.is_padded() {
            layout.pitches[0] = dumb.pitch();
            layout.size = dumb.pitch() as usize * request.height as usize;
        }

        let bo = BufferObject::new(request, layout, fd, Some(u32::from(dumb.handle())));
        self.dumb.borrow_mut().insert(bo.id(), dumb);
        Ok(bo)
    }

    fn release(&self, bo: BufferObject) -> Result<()> {
        let id = bo.id();
        drop(bo.into_parts());
        if let Some(dumb) = self.dumb.borrow_mut().remove(&id) {
            self.destroy_dumb_buffer(dumb)
                .map_err(|e| Error::io("destroy dumb buffer", e))?;
        }
        debug!("{} freed", id);
        Ok(())
    }
}

impl DisplayBackend for Card {
    type Mode = Mode;

    fn supports_atomic(&self) -> bool {
        self.atomic
    }

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo<Mode>>> {
        let res = self.resource_handles()?;
        res.connectors()
            .iter()
            .map(|&handle| {
                let info = self.get_connector(handle, false)?;
                Ok(ConnectorInfo {
                    id: u32::from(handle),
                    connected: info.state() == connector::State::Connected,
                    modes: info.modes().to_vec(),
                    encoder: info.current_encoder().map(u32::from),
                    encoders: info.encoders().iter().map(|&e| u32::from(e)).collect(),
                })
            })
            .collect()
    }

    fn encoders(&self) -> io::Result<Vec<EncoderInfo>> {
        let res = self.resource_handles()?;
        res.encoders()
            .iter()
            .map(|&handle| {
                let info = self.get_encoder(handle)?;
                Ok(EncoderInfo {
                    id: u32::from(handle),
                    crtc: info.crtc().map(u32::from),
                    possible_crtcs: crtc_mask(&res, info.possible_crtcs()),
                })
            })
            .collect()
    }

    fn crtcs(&self) -> io::Result<Vec<u32>> {
        let res = self.resource_handles()?;
        Ok(res.crtcs().iter().map(|&c| u32::from(c)).collect())
    }

    fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
        let res = self.resource_handles()?;
        self.plane_handles()?
            .into_iter()
            .map(|handle| {
                let info = self.get_plane(handle)?;
                Ok(PlaneInfo {
                    id: u32::from(handle),
                    possible_crtcs: crtc_mask(&res, info.possible_crtcs()),
                    formats: info.formats().to_vec(),
                })
            })
            .collect()
    }

    fn plane_properties(&self, id: u32) -> io::Result<Vec<(String, u32)>> {
        let props = self.get_properties(handle::<plane::Handle>(id)?)?;
        let (ids, _) = props.as_props_and_values();
        ids.iter()
            .map(|&prop| {
                let info = self.get_property(prop)?;
                Ok((info.name().to_string_lossy().into_owned(), u32::from(prop)))
            })
            .collect()
    }

    fn mode_size(&self, mode: &Mode) -> (u32, u32) {
        let (width, height) = mode.size();
        (width as u32, height as u32)
    }

    fn add_framebuffer(&self, bo: &BufferObject) -> io::Result<u32> {
        let (handle, imported) = self.buffer_handle(bo)?;
        let fb = self.add_planar_framebuffer(&Framebuffer { bo, handle }, FbCmd2Flags::empty());
        let fb = match fb {
            Ok(fb) => u32::from(fb),
            Err(e) => {
                if imported {
                    if let Err(e) = self.close_buffer(handle) {
                        warn!("close imported buffer: {}", e);
                    }
                }
                return Err(e);
            }
        };
        if imported {
            self.imported.borrow_mut().insert(fb, handle);
        }
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        self.destroy_framebuffer(handle::<framebuffer::Handle>(fb)?)?;
        if let Some(handle) = self.imported.borrow_mut().remove(&fb) {
            self.close_buffer(handle)?;
        }
        Ok(())
    }

    fn set_crtc(&self, crtc: u32, fb: u32, connector: u32, mode: &Mode) -> io::Result<()> {
        ControlDevice::set_crtc(
            self,
            handle::<crtc::Handle>(crtc)?,
            Some(handle::<framebuffer::Handle>(fb)?),
            (0, 0),
            &[handle::<connector::Handle>(connector)?],
            Some(*mode),
        )
    }

    fn set_plane(&self, plane: u32, crtc: u32, fb: u32, dst: Rect, src: Rect) -> io::Result<()> {
        ControlDevice::set_plane(
            self,
            handle::<plane::Handle>(plane)?,
            handle::<crtc::Handle>(crtc)?,
            Some(handle::<framebuffer::Handle>(fb)?),
            0,
            (dst.x, dst.y, dst.width, dst.height),
            (src.x as u32, src.y as u32, src.width, src.height),
        )
    }

    fn atomic_commit(&self, set: &PropertySet) -> io::Result<()> {
        let mut req = AtomicModeReq::new();
        for entry in set.entries() {
            req.add_property(
                handle::<plane::Handle>(entry.object)?,
                handle::<property::Handle>(entry.property)?,
                property::Value::UnsignedRange(entry.value),
            );
        }
        ControlDevice::atomic_commit(self, AtomicCommitFlags::empty(), req)
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        let imported = std::mem::take(self.imported.get_mut());
        for (fb, handle) in imported {
            debug!("closing imported buffer of framebuffer {}", fb);
            if let Err(e) = self.close_buffer(handle) {
                warn!("close imported buffer: {}", e);
            }
        }
        let dumb = std::mem::take(self.dumb.get_mut());
        for (id, buffer) in dumb {
            warn!("{} still allocated at close", id);
            if let Err(e) = self.destroy_dumb_buffer(buffer) {
                warn!("destroy dumb buffer: {}", e);
            }
        }
    }
}
