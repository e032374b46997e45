// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{io, path::PathBuf};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification used by the orchestrator and the exit status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device lacks a required capability or no display is available.
    FatalCapability,
    /// A buffer object or descriptor array could not be allocated.
    AllocationFailure,
    /// A single control parameter was rejected; execution continues.
    ConfigurationWarning,
    /// A buffer submission or completion failed; the cycle is aborted.
    TransferFailure,
}

/// Errors reported by the display, buffer and transform layers.
///
/// Low level ioctl failures are translated into one of these variants at the
/// component boundary so callers only need [`Error::kind`] and
/// [`Error::is_fatal`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("device capability missing: {0}")]
    Capability(String),

    #[error("no connected display with a valid mode (is a display server running?)")]
    NoDisplay,

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("failed to map buffer object: {0}")]
    Map(io::Error),

    #[error("failed to export buffer object: {0}")]
    Export(io::Error),

    #[error("set {control} failed: {source}")]
    Configuration {
        control: &'static str,
        source: io::Error,
    },

    #[error("{step} failed: {source}")]
    Transfer {
        step: &'static str,
        source: io::Error,
    },

    #[error("plane configuration rejected: {0}")]
    PlaneConfig(io::Error),

    #[error("invalid session state: {0}")]
    State(String),

    #[error("{step}: {source}")]
    Io {
        step: &'static str,
        source: io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Open { .. } | Error::Capability(_) | Error::NoDisplay => {
                ErrorKind::FatalCapability
            }
            Error::Allocation(_) | Error::Map(_) | Error::Export(_) => {
                ErrorKind::AllocationFailure
            }
            Error::Configuration { .. } => ErrorKind::ConfigurationWarning,
            Error::Transfer { .. } | Error::PlaneConfig(_) => ErrorKind::TransferFailure,
            Error::State(_) | Error::Io { .. } => ErrorKind::FatalCapability,
        }
    }

    /// Only configuration warnings allow execution to continue.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::ConfigurationWarning
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::State(_) | Error::Io { .. } => 1,
            _ => match self.kind() {
                ErrorKind::FatalCapability => 3,
                ErrorKind::AllocationFailure => 4,
                ErrorKind::TransferFailure => 5,
                ErrorKind::ConfigurationWarning => 0,
            },
        }
    }

    pub(crate) fn transfer(step: &'static str, source: impl Into<io::Error>) -> Self {
        Error::Transfer {
            step,
            source: source.into(),
        }
    }

    pub(crate) fn io(step: &'static str, source: impl Into<io::Error>) -> Self {
        Error::Io {
            step,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::NoDisplay.is_fatal());
        assert_eq!(Error::NoDisplay.exit_code(), 3);
        assert_eq!(Error::Allocation("oom".into()).exit_code(), 4);

        let warning = Error::Configuration {
            control: "HFLIP",
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(!warning.is_fatal());
        assert_eq!(warning.kind(), ErrorKind::ConfigurationWarning);

        let transfer = Error::transfer("VIDIOC_DQBUF", io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(transfer.kind(), ErrorKind::TransferFailure);
        assert_eq!(transfer.exit_code(), 5);
        assert_eq!(Error::State("closed".into()).exit_code(), 1);
    }
}
