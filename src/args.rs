// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    display::CommitPreference,
    format::{PixelFormat, Rect},
    pipeline::{BufferSource, PipelineConfig},
    transform::{CropDefaults, FrameSpec, Operation, TransformConfig},
};
use clap::Parser;
use std::{path::PathBuf, time::Duration};
use tracing::level_filters::LevelFilter;

/// Pixel format of a transform queue.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum FormatArg {
    #[value(alias = "0")]
    Nv12,
    Nv21,
    Nv16,
    Nv61,
    Yuv420,
    Yuv422p,
    #[value(alias = "1")]
    Argb32,
    Xrgb32,
    Abgr32,
    Xbgr32,
    Rgb24,
    #[value(alias = "2")]
    Rgb565,
    Argb555,
    Argb444,
}

impl From<FormatArg> for PixelFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Nv12 => PixelFormat::Nv12,
            FormatArg::Nv21 => PixelFormat::Nv21,
            FormatArg::Nv16 => PixelFormat::Nv16,
            FormatArg::Nv61 => PixelFormat::Nv61,
            FormatArg::Yuv420 => PixelFormat::Yuv420,
            FormatArg::Yuv422p => PixelFormat::Yuv422p,
            FormatArg::Argb32 => PixelFormat::Argb32,
            FormatArg::Xrgb32 => PixelFormat::Xrgb32,
            FormatArg::Abgr32 => PixelFormat::Abgr32,
            FormatArg::Xbgr32 => PixelFormat::Xbgr32,
            FormatArg::Rgb24 => PixelFormat::Rgb24,
            FormatArg::Rgb565 => PixelFormat::Rgb565,
            FormatArg::Argb555 => PixelFormat::Argb555,
            FormatArg::Argb444 => PixelFormat::Argb444,
        }
    }
}

/// Transform operation.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum OpArg {
    /// Copy the source into the destination with the configured geometry
    #[value(alias = "0")]
    Copy,
    /// Fill the destination with --fill-color
    #[value(alias = "1")]
    SolidFill,
    /// Blend source and destination using the alpha registers
    #[value(alias = "2")]
    AlphaBlend,
}

impl From<OpArg> for Operation {
    fn from(arg: OpArg) -> Self {
        match arg {
            OpArg::Copy => Operation::Copy,
            OpArg::SolidFill => Operation::SolidFill,
            OpArg::AlphaBlend => Operation::AlphaBlend,
        }
    }
}

/// Size given to a crop rectangle that has an offset but no size.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum CropDefaultsArg {
    /// Width takes the frame height, height stays zero
    Legacy,
    /// Full frame size
    Full,
}

/// Memory the transform buffers are allocated from.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum AllocatorArg {
    /// DRM dumb buffers on --card
    Dumb,
    /// Contiguous DMA heap
    Cma,
    /// System DMA heap
    System,
}

fn parse_hex(value: &str) -> Result<u32, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value {value:?}: {e}"))
}

/// Command-line arguments for the EdgeFirst memory-to-memory transform test.
///
/// Streams frames through a V4L2 memory-to-memory device (such as the
/// Rockchip RGA) using DMABUF buffers and optionally shows every result on a
/// DRM display plane. Most options can also be given through environment
/// variables.
///
/// # Example
///
/// ```bash
/// edgefirst-m2m --device /dev/video0 --src-fmt nv12 --dst-fmt argb32 \
///     --dst-width 1280 --dst-height 720 --rotate 90 --display
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Memory-to-memory transform device
    #[arg(long, env = "DEVICE", default_value = "/dev/video0")]
    pub device: PathBuf,

    /// DRM card used for buffers and display
    #[arg(long, env = "CARD", default_value = "/dev/dri/card0")]
    pub card: PathBuf,

    /// Source pixel format
    #[arg(long, default_value = "nv12", value_enum)]
    pub src_fmt: FormatArg,

    #[arg(long, default_value = "1024")]
    pub src_width: u32,

    #[arg(long, default_value = "768")]
    pub src_height: u32,

    #[arg(long, default_value = "0")]
    pub src_crop_x: i32,

    #[arg(long, default_value = "0")]
    pub src_crop_y: i32,

    #[arg(long, default_value = "0")]
    pub src_crop_width: u32,

    #[arg(long, default_value = "0")]
    pub src_crop_height: u32,

    /// Destination pixel format
    #[arg(long, default_value = "nv12", value_enum)]
    pub dst_fmt: FormatArg,

    #[arg(long, default_value = "1024")]
    pub dst_width: u32,

    #[arg(long, default_value = "768")]
    pub dst_height: u32,

    #[arg(long, default_value = "0")]
    pub dst_crop_x: i32,

    #[arg(long, default_value = "0")]
    pub dst_crop_y: i32,

    #[arg(long, default_value = "0")]
    pub dst_crop_width: u32,

    #[arg(long, default_value = "0")]
    pub dst_crop_height: u32,

    /// Transform operation
    #[arg(long, default_value = "copy", value_enum)]
    pub op: OpArg,

    /// RGB fill colour in hex for solid-fill
    #[arg(long, value_parser = parse_hex)]
    pub fill_color: Option<u32>,

    /// Rotation in degrees
    #[arg(long, default_value = "0")]
    pub rotate: u32,

    #[arg(long)]
    pub hflip: bool,

    #[arg(long)]
    pub vflip: bool,

    /// Alpha blend register 0 in hex
    #[arg(long, value_parser = parse_hex)]
    pub alpha0: Option<u32>,

    /// Alpha blend register 1 in hex
    #[arg(long, value_parser = parse_hex)]
    pub alpha1: Option<u32>,

    /// Number of frames to transform
    #[arg(short, long, env = "NUM_FRAMES", default_value = "100")]
    pub num_frames: u32,

    /// Show each transformed frame on a display plane
    #[arg(long, env = "DISPLAY_PLANE")]
    pub display: bool,

    /// Default size of a crop given only an offset
    #[arg(long, default_value = "legacy", value_enum)]
    pub crop_defaults: CropDefaultsArg,

    /// Buffer allocator
    #[arg(long, env = "ALLOCATOR", default_value = "dumb", value_enum)]
    pub allocator: AllocatorArg,

    /// Source buffers to request
    #[arg(long, default_value = "1")]
    pub src_buffers: u32,

    /// Destination buffers to request
    #[arg(long, default_value = "4")]
    pub dst_buffers: u32,

    /// Use legacy plane updates even when atomic modesetting is available
    #[arg(long)]
    pub legacy_commit: bool,

    /// Give up on a frame after this many milliseconds
    #[arg(long, env = "TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Fill source buffers with a test pattern before streaming
    #[arg(long)]
    pub pattern: bool,

    /// Write the last destination frame to this file
    #[arg(long)]
    pub dump: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub rust_log: LevelFilter,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl From<Args> for PipelineConfig {
    fn from(args: Args) -> Self {
        let source = FrameSpec::new(args.src_fmt.into(), args.src_width, args.src_height)
            .with_crop(Rect::new(
                args.src_crop_x,
                args.src_crop_y,
                args.src_crop_width,
                args.src_crop_height,
            ));
        let destination = FrameSpec::new(args.dst_fmt.into(), args.dst_width, args.dst_height)
            .with_crop(Rect::new(
                args.dst_crop_x,
                args.dst_crop_y,
                args.dst_crop_width,
                args.dst_crop_height,
            ));

        let mut transform = TransformConfig::new(source, destination);
        transform.operation = args.op.into();
        transform.fill_color = args.fill_color;
        transform.rotation = args.rotate;
        transform.hflip = args.hflip;
        transform.vflip = args.vflip;
        transform.alpha = (args.alpha0, args.alpha1);
        transform.crop_defaults = match args.crop_defaults {
            CropDefaultsArg::Legacy => CropDefaults::Legacy,
            CropDefaultsArg::Full => CropDefaults::Full,
        };

        PipelineConfig {
            device: args.device,
            card: args.card,
            transform,
            frames: args.num_frames,
            display: args.display,
            allocator: match args.allocator {
                AllocatorArg::Dumb => BufferSource::Dumb,
                AllocatorArg::Cma => BufferSource::Cma,
                AllocatorArg::System => BufferSource::System,
            },
            src_buffers: args.src_buffers,
            dst_buffers: args.dst_buffers,
            commit: if args.legacy_commit {
                CommitPreference::Legacy
            } else {
                CommitPreference::Auto
            },
            timeout: args.timeout_ms.map(Duration::from_millis),
            pattern: args.pattern,
            dump: args.dump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("edgefirst-m2m").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from(parse(&[]));
        assert_eq!(config.frames, 100);
        assert_eq!(config.src_buffers, 1);
        assert_eq!(config.dst_buffers, 4);
        assert!(!config.display);
        assert_eq!(config.allocator, BufferSource::Dumb);
        assert_eq!(config.commit, CommitPreference::Auto);
        assert_eq!(config.timeout, None);

        let t = &config.transform;
        assert_eq!(t.source, FrameSpec::new(PixelFormat::Nv12, 1024, 768));
        assert_eq!(t.destination, FrameSpec::new(PixelFormat::Nv12, 1024, 768));
        assert_eq!(t.operation, Operation::Copy);
        assert_eq!(t.crop_defaults, CropDefaults::Legacy);
    }

    #[test]
    fn test_numeric_aliases() {
        let args = parse(&["--src-fmt", "1", "--dst-fmt", "2", "--op", "2"]);
        assert_eq!(args.src_fmt, FormatArg::Argb32);
        assert_eq!(args.dst_fmt, FormatArg::Rgb565);
        assert_eq!(args.op, OpArg::AlphaBlend);
    }

    #[test]
    fn test_transform_options() {
        let config = PipelineConfig::from(parse(&[
            "--dst-fmt",
            "argb32",
            "--dst-width",
            "1280",
            "--dst-height",
            "720",
            "--dst-crop-x",
            "10",
            "--op",
            "solid-fill",
            "--fill-color",
            "0xff00ff",
            "--rotate",
            "90",
            "--hflip",
            "--alpha0",
            "ff",
            "--crop-defaults",
            "full",
            "--legacy-commit",
            "--timeout-ms",
            "250",
            "--allocator",
            "cma",
        ]));
        let t = &config.transform;
        assert_eq!(t.destination.format, PixelFormat::Argb32);
        assert_eq!(t.destination.crop, Rect::new(10, 0, 0, 0));
        assert_eq!(t.operation, Operation::SolidFill);
        assert_eq!(t.fill_color, Some(0xff00ff));
        assert_eq!(t.rotation, 90);
        assert!(t.hflip && !t.vflip);
        assert_eq!(t.alpha, (Some(0xff), None));
        assert_eq!(t.crop_defaults, CropDefaults::Full);
        assert_eq!(config.commit, CommitPreference::Legacy);
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.allocator, BufferSource::Cma);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x00ff00"), Ok(0xff00));
        assert_eq!(parse_hex("FF"), Ok(0xff));
        assert!(parse_hex("0xzz").is_err());
        assert!(Args::try_parse_from(["edgefirst-m2m", "--fill-color", "red"]).is_err());
    }
}
