#![forbid(unsafe_code)]
//! Error types for pagefs.
//!
//! Defines `PfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all pagefs operations.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("name too long")]
    NameTooLong,

    #[error("page table exhausted")]
    OutOfBlocks,

    #[error("node-id space exhausted")]
    OutOfNodes,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    Exists,

    #[error("corrupt page {block}: {detail}")]
    Corruption { block: u64, detail: String },
}

impl PfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::OutOfBlocks | Self::OutOfNodes => libc::ENOSPC,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Exists => libc::EEXIST,
            Self::Corruption { .. } => libc::EIO,
        }
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(PfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(PfsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(PfsError::OutOfBlocks.to_errno(), libc::ENOSPC);
        assert_eq!(PfsError::OutOfNodes.to_errno(), libc::ENOSPC);
        assert_eq!(PfsError::InvalidArgument("x").to_errno(), libc::EINVAL);
        assert_eq!(PfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(PfsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(PfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(PfsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(
            PfsError::Corruption {
                block: 3,
                detail: "bad magic".into()
            }
            .to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = PfsError::Corruption {
            block: 12,
            detail: "chain ends early".into(),
        };
        assert_eq!(err.to_string(), "corrupt page 12: chain ends early");
    }
}
