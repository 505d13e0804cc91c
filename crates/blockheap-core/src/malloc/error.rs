//! Error taxonomy for the allocator and its mapping primitive.

use thiserror::Error;

/// Failures reported by a [`PageMapper`](super::mapper::PageMapper).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("mapping primitive could not supply {size} bytes")]
    OutOfMemory { size: usize },
    #[error("unmap of {len} bytes at {base:#x} failed")]
    UnmapFailed { base: usize, len: usize },
    #[error("mapping alignment {align} is not a power of two multiple of the page size")]
    InvalidAlignment { align: usize },
    #[error("changing protection of {len} bytes at {base:#x} failed")]
    ProtectFailed { base: usize, len: usize },
}

/// Failures reported by the allocator front-end and its pools.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MallocError {
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("calloc({count}, {size}) overflows the address space")]
    CallocOverflow { count: usize, size: usize },
    #[error("request of {requested} bytes overflows after rounding")]
    SizeOverflow { requested: usize },
    #[error("pointer {ptr:#x} is not owned by this allocator")]
    InvalidPointer { ptr: usize },
    #[error("pointer {ptr:#x} was already freed")]
    DoubleFree { ptr: usize },
    #[error("header behind {ptr:#x} is corrupted (expected magic {expected:#x}, found {found:#x})")]
    HeaderCorrupted {
        ptr: usize,
        expected: u32,
        found: u32,
    },
    #[error(transparent)]
    Map(#[from] MapError),
}

impl MallocError {
    /// Whether this error signals heap misuse, corruption, or a mapping
    /// primitive that refused to protect or unmap memory it handed out.
    ///
    /// The thread-safe [`Heap`](super::heap::Heap) aborts the process on
    /// fatal errors instead of returning them. `MallocState` keeps its
    /// accounting consistent before returning a mapper error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidPointer { .. }
                | Self::DoubleFree { .. }
                | Self::HeaderCorrupted { .. }
                | Self::Map(_)
        )
    }

    /// Short machine-readable label used in lifecycle records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "oom",
            Self::CallocOverflow { .. } => "calloc_overflow",
            Self::SizeOverflow { .. } => "size_overflow",
            Self::InvalidPointer { .. } => "invalid_pointer",
            Self::DoubleFree { .. } => "double_free",
            Self::HeaderCorrupted { .. } => "header_corrupted",
            Self::Map(_) => "map_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(MallocError::InvalidPointer { ptr: 0xdead }.is_fatal());
        assert!(MallocError::DoubleFree { ptr: 0xdead }.is_fatal());
        assert!(
            MallocError::HeaderCorrupted {
                ptr: 0x10,
                expected: 1,
                found: 2
            }
            .is_fatal()
        );
        assert!(
            MallocError::Map(MapError::ProtectFailed {
                base: 0x1_0000,
                len: 4096
            })
            .is_fatal()
        );
        assert!(!MallocError::OutOfMemory { requested: 8 }.is_fatal());
        assert!(!MallocError::CallocOverflow { count: 2, size: 3 }.is_fatal());
    }

    #[test]
    fn test_map_error_converts() {
        let err: MallocError = MapError::OutOfMemory { size: 4096 }.into();
        assert_eq!(err.label(), "map_error");
        assert!(err.to_string().contains("4096"));
    }
}
