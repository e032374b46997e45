// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst M2M Library
//!
//! This library drives a V4L2 memory-to-memory 2D transform device (such as
//! the Rockchip RGA) with zero-copy DMABUF buffers and presents the results
//! on DRM display planes. It is the engine behind the `edgefirst-m2m`
//! exerciser and can be embedded to benchmark or validate transform hardware.
//!
//! ## Features
//!
//! - **Buffer Objects**: Allocate DRM dumb buffers or DMA heap buffers, map
//!   them for CPU access and export them as dma-buf descriptors.
//! - **Display Planes**: Light every connected output, acquire overlay planes
//!   and update them through atomic or legacy commits.
//! - **Transform Sessions**: Negotiate formats and crops, program controls
//!   and stream frames through the device one cycle at a time.
//! - **Pipeline**: One call that wires the layers together and always
//!   releases every resource.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_m2m::{
//!     format::PixelFormat,
//!     pipeline::{run, PipelineConfig},
//!     transform::{FrameSpec, TransformConfig},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transform = TransformConfig::new(
//!     FrameSpec::new(PixelFormat::Nv12, 1024, 768),
//!     FrameSpec::new(PixelFormat::Argb32, 1280, 720),
//! );
//! let mut config = PipelineConfig::new(transform);
//! config.frames = 10;
//!
//! let report = run(&config)?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Kernel 5.10+ with V4L2 memory-to-memory, DRM and DMA heap
//!   support
//! - **Display**: Planes can only be driven when no display server holds the
//!   DRM master
//!
//! ## Safety
//!
//! This library uses `unsafe` code for ioctls, memory mapping and DMA buffer
//! operations. All unsafe operations are isolated to the [`bo`] and [`v4l2`]
//! modules and wrapped with safe APIs.

pub mod args;
pub mod bo;
pub mod display;
pub mod drm;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod transform;
pub mod v4l2;

#[cfg(test)]
mod mock;

pub use error::{Error, ErrorKind, Result};
