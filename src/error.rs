//! The Error-Types returned by the Allocator operations

use std::fmt;

/// The Errors that can occur while allocating or freeing Blocks
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum AllocError {
    /// The Region-Manager could not satisfy the underlying Superblock or
    /// Large-Block allocation, meaning the persistent Region is exhausted
    OutOfRegion,
    /// The caller passed an invalid Argument, like an Alignment that is not
    /// a power of two
    InvalidArgument,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRegion => write!(f, "The persistent Region is exhausted"),
            Self::InvalidArgument => write!(f, "Invalid Argument"),
        }
    }
}

impl std::error::Error for AllocError {}

/// The Errors that can occur while attaching to a persistent Region
#[derive(Debug)]
pub enum AttachError {
    /// Creating, resizing or mapping one of the backing Files failed
    Io(std::io::Error),
    /// The persistent State is damaged in a way that recovery can not fix,
    /// the Allocator refuses to attach in this case
    Corruption(&'static str),
    /// The caller passed an invalid Argument, like a Thread-Count of 0
    InvalidArgument,
    /// There is already an attached Allocator in this Process
    AlreadyAttached,
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Mapping the Region failed: {}", e),
            Self::Corruption(reason) => write!(f, "Persistent State is corrupted: {}", reason),
            Self::InvalidArgument => write!(f, "Invalid Argument"),
            Self::AlreadyAttached => {
                write!(f, "There is already an attached Allocator in this Process")
            }
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AttachError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
