//! Errors surfaced to the kernel bridge.

use thiserror::Error;

/// Error kinds of the filesystem capability set, mapped 1:1 to host error
/// codes by the bridge.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("read-only file system")]
    ReadOnly,

    #[error("file exists")]
    Exists,

    #[error("operation not permitted")]
    Perm,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Host errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::ReadOnly => libc::EROFS,
            FsError::Exists => libc::EEXIST,
            FsError::Perm => libc::EPERM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<mar_store::StoreError> for FsError {
    fn from(err: mar_store::StoreError) -> Self {
        match err {
            mar_store::StoreError::Io(e) => FsError::Io(e),
            other => FsError::Io(std::io::Error::other(other)),
        }
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(FsError::Exists.errno(), libc::EEXIST);
        assert_eq!(FsError::Perm.errno(), libc::EPERM);
        assert_eq!(FsError::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(
            FsError::Io(std::io::Error::other("boom")).errno(),
            libc::EIO
        );
    }
}
