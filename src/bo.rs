// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer objects shared between the transform device and the display.
//!
//! A [`BufferObject`] is a dma-buf backed memory region sized for a pixel
//! format. It can optionally be mapped for CPU access and exported as a
//! dma-buf file descriptor for another subsystem. Buffer objects are created
//! and destroyed through a [`BufferAllocator`]; [`BufferAllocator::release`]
//! consumes the object so it cannot be released twice.

use crate::{
    error::{Error, Result},
    format::{Layout, PixelFormat},
};
use core::fmt;
use dma_buf::DmaBuf;
use dma_heap::{Heap, HeapKind};
use libc::{mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::{
    ffi::c_void,
    io,
    ops::BitOr,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::null_mut,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::atomic::{AtomicU32, Ordering},
};
use tracing::{debug, warn};

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifier of a buffer object, used as a non-owning reference by planes
/// and transform slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoId(u32);

impl BoId {
    fn next() -> Self {
        BoId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BoId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

/// Allocation hints.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    /// Physically contiguous memory, required by devices without an IOMMU.
    pub const CONTIGUOUS: BufferFlags = BufferFlags(1);
    /// The buffer will be scanned out by a display plane or CRTC.
    pub const SCANOUT: BufferFlags = BufferFlags(2);

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Parameters of an allocation request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferRequest {
    pub width: u32,
    pub height: u32,
    /// Bits per pixel, zero to derive from `format`.
    pub bpp: u32,
    pub format: PixelFormat,
    pub flags: BufferFlags,
    /// Bytes per line of the first plane, zero to derive from the width.
    pub pitch: u32,
    /// Lower bound on the buffer length in bytes.
    pub min_size: usize,
}

impl BufferRequest {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        BufferRequest {
            width,
            height,
            bpp: 0,
            format,
            flags: BufferFlags::NONE,
            pitch: 0,
            min_size: 0,
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_bpp(mut self, bpp: u32) -> Self {
        self.bpp = bpp;
        self
    }

    /// Uses the line pitch a device negotiated instead of the packed one.
    pub fn with_pitch(mut self, pitch: u32) -> Self {
        self.pitch = pitch;
        self
    }

    /// Grows the buffer to at least `min_size` bytes, such as the image size
    /// a device reported.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Whether the request carries device-negotiated geometry.
    pub fn is_padded(&self) -> bool {
        self.pitch != 0 || self.min_size != 0
    }

    /// Effective bits per pixel of the request.
    pub fn bits_per_pixel(&self) -> u32 {
        if self.bpp == 0 {
            self.format.bits_per_pixel()
        } else {
            self.bpp
        }
    }

    /// Memory layout implied by the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] for an empty frame, a pitch shorter
    /// than one line or a frame too large to describe.
    pub fn layout(&self) -> Result<Layout> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Allocation(format!(
                "invalid dimensions {}x{}",
                self.width, self.height
            )));
        }
        if u32::try_from(self.min_size).is_err() {
            return Err(Error::Allocation(format!(
                "minimum size {} does not fit in 32 bits",
                self.min_size
            )));
        }
        let mut layout = self
            .format
            .layout_with_pitch(self.width, self.height, self.bpp, self.pitch)?;
        layout.size = layout.size.max(self.min_size);
        Ok(layout)
    }
}

/// Memory-mapped view of a buffer object.
///
/// The mapping is unmapped when dropped.
struct Mapping {
    mmap: *mut u8,
    len: usize,
}

impl Mapping {
    fn new(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        let mmap = unsafe {
            mmap(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if mmap == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapping {
            mmap: mmap.cast::<u8>(),
            len,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.mmap, self.len) }
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.mmap, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if unsafe { munmap(self.mmap.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// A dma-buf backed image buffer.
///
/// The buffer keeps the dma-buf file descriptor it was allocated with.
/// [`BufferObject::map`] and [`BufferObject::export`] are separate, optional
/// capabilities; both are dropped again when the object is released.
pub struct BufferObject {
    id: BoId,
    width: u32,
    height: u32,
    bpp: u32,
    format: PixelFormat,
    layout: Layout,
    handle: Option<u32>,
    memory: OwnedFd,
    mapping: Option<Mapping>,
    export: Option<OwnedFd>,
}

impl BufferObject {
    /// Wraps freshly allocated memory.
    ///
    /// `handle` is the allocator specific raw handle (a GEM handle for DRM
    /// dumb buffers) if there is one.
    pub fn new(
        request: &BufferRequest,
        layout: Layout,
        memory: OwnedFd,
        handle: Option<u32>,
    ) -> Self {
        let bo = BufferObject {
            id: BoId::next(),
            width: request.width,
            height: request.height,
            bpp: request.bits_per_pixel(),
            format: request.format,
            layout,
            handle,
            memory,
            mapping: None,
            export: None,
        };
        debug!("buffer object alloc'd {}", bo);
        bo
    }

    pub fn id(&self) -> BoId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Byte length of the buffer.
    pub fn size(&self) -> usize {
        self.layout.size
    }

    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.memory.as_fd()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Maps the buffer for CPU access, reusing an existing mapping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Map`] if the kernel refuses the mapping.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        if self.mapping.is_none() {
            let mapping = Mapping::new(self.memory.as_fd(), self.layout.size).map_err(Error::Map)?;
            debug!("{} mapped at {:p}", self.id, mapping.mmap);
            self.mapping = Some(mapping);
        }
        match self.mapping.as_mut() {
            Some(mapping) => Ok(mapping.as_slice_mut()),
            None => Err(Error::Map(io::Error::other("mapping vanished"))),
        }
    }

    /// Read-only view of an existing mapping.
    pub fn mapped(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(Mapping::as_slice)
    }

    pub fn unmap(&mut self) {
        if self.mapping.take().is_some() {
            debug!("{} unmapped", self.id);
        }
    }

    /// Exports the buffer as a dma-buf handle for another subsystem.
    ///
    /// Repeated calls return the same handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] if the descriptor cannot be duplicated.
    pub fn export(&mut self) -> Result<BorrowedFd<'_>> {
        if self.export.is_none() {
            self.export = Some(self.memory.try_clone().map_err(Error::Export)?);
        }
        match self.export.as_ref() {
            Some(fd) => Ok(fd.as_fd()),
            None => Err(Error::Export(io::Error::other("export vanished"))),
        }
    }

    pub fn exported(&self) -> Option<BorrowedFd<'_>> {
        self.export.as_ref().map(|fd| fd.as_fd())
    }

    /// Duplicates the backing descriptor as a [`DmaBuf`] for synchronized CPU
    /// access.
    pub fn dmabuf(&self) -> Result<DmaBuf> {
        let fd = self.memory.try_clone().map_err(Error::Export)?;
        Ok(DmaBuf::from(fd))
    }

    /// Drops the mapping and export handle and hands back the backing
    /// descriptor and raw handle so the allocator can free them.
    pub fn into_parts(mut self) -> (OwnedFd, Option<u32>) {
        self.unmap();
        if self.export.take().is_some() {
            debug!("{} export closed", self.id);
        }
        (self.memory, self.handle)
    }
}

impl fmt::Display for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}x{} {} {} bytes fd:{}",
            self.id,
            self.width,
            self.height,
            self.format,
            self.layout.size,
            self.memory.as_raw_fd()
        )
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("size", &self.layout.size)
            .field("mapped", &self.mapping.is_some())
            .field("exported", &self.export.is_some())
            .finish()
    }
}

/// Source of buffer objects.
pub trait BufferAllocator {
    /// Allocates a buffer for `request`. The result is neither mapped nor
    /// exported.
    fn allocate(&self, request: &BufferRequest) -> Result<BufferObject>;

    /// Unmaps, closes the export handle and frees the buffer.
    fn release(&self, bo: BufferObject) -> Result<()> {
        let id = bo.id();
        drop(bo.into_parts());
        debug!("{} freed", id);
        Ok(())
    }
}

/// Allocates buffer objects from the Linux DMA heaps.
///
/// Requests flagged [`BufferFlags::CONTIGUOUS`] always come from the CMA heap.
#[derive(Copy, Clone, Debug)]
pub struct HeapAllocator {
    contiguous: bool,
}

impl HeapAllocator {
    /// Allocate everything from the CMA heap.
    pub fn cma() -> Self {
        HeapAllocator { contiguous: true }
    }

    /// Allocate from the system heap unless contiguous memory is requested.
    pub fn system() -> Self {
        HeapAllocator { contiguous: false }
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, request: &BufferRequest) -> Result<BufferObject> {
        let layout = request.layout()?;
        let kind = if self.contiguous || request.flags.contains(BufferFlags::CONTIGUOUS) {
            HeapKind::Cma
        } else {
            HeapKind::System
        };
        let heap = Heap::new(kind).map_err(|e| Error::Allocation(format!("dma heap: {e}")))?;
        let fd = heap
            .allocate(layout.size)
            .map_err(|e| Error::Allocation(format!("{} bytes: {e}", layout.size)))?;
        Ok(BufferObject::new(request, layout, fd, None))
    }
}
