//! Device buffer identities with root/sub aliasing
//!
//! A buffer is a handle over device storage owned by a backend
//! allocator; this crate only tracks identity, placement and the
//! root/sub relationship. Reference counting is carried by `Arc`:
//! every tensor header referencing a buffer holds a clone, and so does
//! the buffer tree itself, which keeps the counts observable through
//! `Arc::strong_count` for the paging invariants.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vmux_resource::DeviceSpec;

/// Unique buffer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    /// Mint a process-unique buffer id
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf-{:08x}", self.0)
    }
}

/// A root or sub buffer on a concrete device
#[derive(Debug)]
pub struct DeviceBuffer {
    id: BufferId,
    spec: DeviceSpec,
    size_bytes: u64,
    /// Root this buffer aliases into, `None` for root buffers
    parent: Option<BufferId>,
    /// Byte offset within the parent, zero for roots
    offset: u64,
}

impl DeviceBuffer {
    /// Allocate a new root buffer identity
    #[must_use]
    pub fn new_root(spec: DeviceSpec, size_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            id: BufferId::generate(),
            spec,
            size_bytes,
            parent: None,
            offset: 0,
        })
    }

    /// Create a sub-buffer aliasing into `root` at `offset`
    #[must_use]
    pub fn new_sub(root: &Arc<DeviceBuffer>, offset: u64, size_bytes: u64) -> Arc<Self> {
        debug_assert!(root.parent.is_none(), "sub buffers alias roots only");
        Arc::new(Self {
            id: BufferId::generate(),
            spec: root.spec,
            size_bytes,
            parent: Some(root.id),
            offset,
        })
    }

    /// Clone a sub-buffer against a different root
    ///
    /// Keeps the offset and size; the new identity lives on the new
    /// root's device.
    #[must_use]
    pub fn clone_with_root(sub: &Arc<DeviceBuffer>, new_root: &Arc<DeviceBuffer>) -> Arc<Self> {
        debug_assert!(sub.parent.is_some(), "only sub buffers re-target roots");
        Arc::new(Self {
            id: BufferId::generate(),
            spec: new_root.spec,
            size_bytes: sub.size_bytes,
            parent: Some(new_root.id),
            offset: sub.offset,
        })
    }

    /// Buffer identity
    #[inline]
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Device this buffer lives on
    #[inline]
    #[must_use]
    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    /// Buffer size in bytes
    #[inline]
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Root this buffer aliases, if it is a sub-buffer
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<BufferId> {
        self.parent
    }

    /// Byte offset within the parent
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True for sub-buffers
    #[inline]
    #[must_use]
    pub fn is_sub(&self) -> bool {
        self.parent.is_some()
    }
}

impl fmt::Display for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.spec)?;
        if let Some(parent) = self.parent {
            write!(f, " (sub of {} +{})", parent, self.offset)?;
        }
        Ok(())
    }
}
