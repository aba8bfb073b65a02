//! Backend adapter: the seam to the numerical library
//!
//! The runtime never touches driver code. Allocation, cross-device DMA
//! and graph stream assignment all go through [`DeviceBackend`], and a
//! platform backend implements it against the real library. The
//! in-process [`HostBackend`] backs tests and CPU devices with plain
//! byte vectors and an immediately-completing copy.

use crate::graph::{GraphHandle, NodeStreamMap};
use crate::Result;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::trace;
use vmux_resource::DeviceSpec;
use vmux_tensor::{BufferId, DeviceBuffer, Tensor, TensorMeta};

/// Allocator selection attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorAttrs {
    /// Allocate in host memory
    pub on_host: bool,
    /// Host memory must be GPU-accessible (pinned)
    pub gpu_compatible: bool,
}

impl AllocatorAttrs {
    /// Device-memory allocation
    #[must_use]
    pub const fn device() -> Self {
        Self {
            on_host: false,
            gpu_compatible: false,
        }
    }

    /// Plain host allocation
    #[must_use]
    pub const fn host() -> Self {
        Self {
            on_host: true,
            gpu_compatible: false,
        }
    }

    /// Pinned host allocation
    #[must_use]
    pub const fn pinned() -> Self {
        Self {
            on_host: true,
            gpu_compatible: true,
        }
    }
}

/// Allocator bound to one device and attribute set
pub trait TensorAllocator: Send + Sync {
    /// Device this allocator serves
    fn spec(&self) -> DeviceSpec;

    /// Allocate a buffer for a tensor, `None` under memory pressure
    fn allocate(&self, meta: &TensorMeta) -> Option<Arc<DeviceBuffer>>;
}

/// Completion callback of an asynchronous DMA copy
pub type DmaDone = Box<dyn FnOnce(std::result::Result<(), String>) + Send>;

/// Platform backend for one physical device
pub trait DeviceBackend: Send + Sync {
    /// Device this backend drives
    fn spec(&self) -> DeviceSpec;

    /// Select an allocator by attributes
    fn allocator(&self, attrs: AllocatorAttrs) -> Arc<dyn TensorAllocator>;

    /// Start a cross-device copy; `done` fires on completion
    fn copy_via_dma(&self, src: &Tensor, dst: &Tensor, done: DmaDone);

    /// Deterministically assign graph nodes to logical streams
    fn assign_streams(&self, graph: &GraphHandle, max_streams: usize) -> Result<NodeStreamMap>;
}

/// Blocks one thread until a DMA completion callback fires
pub struct Notification {
    state: Mutex<Option<std::result::Result<(), String>>>,
    cond: Condvar,
}

impl Notification {
    /// Create an unsignaled notification
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    /// Signal completion
    pub fn notify(&self, result: std::result::Result<(), String>) {
        let mut state = self.state.lock();
        *state = Some(result);
        self.cond.notify_all();
    }

    /// Wait for completion, blocking the calling thread
    pub fn wait(&self) -> std::result::Result<(), String> {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cond.wait(&mut state);
        }
        state.take().expect("notification signaled")
    }
}

#[derive(Debug)]
struct HostState {
    spec: DeviceSpec,
    buffers: DashMap<BufferId, Vec<u8>>,
    /// Remaining allocation budget in bytes, `None` for unlimited
    budget: Mutex<Option<u64>>,
}

/// In-process backend over plain host memory
///
/// Backs CPU devices and every test: buffers are byte vectors in a
/// table, DMA completes inline, and stream assignment colors nodes
/// round-robin.
#[derive(Debug, Clone)]
pub struct HostBackend {
    state: Arc<HostState>,
}

impl HostBackend {
    /// Create a backend for `spec` with unlimited memory
    #[must_use]
    pub fn new(spec: DeviceSpec) -> Self {
        Self {
            state: Arc::new(HostState {
                spec,
                buffers: DashMap::new(),
                budget: Mutex::new(None),
            }),
        }
    }

    /// Cap the total bytes this backend will allocate
    #[must_use]
    pub fn with_alloc_budget(self, bytes: u64) -> Self {
        *self.state.budget.lock() = Some(bytes);
        self
    }

    /// Replace the allocation budget at runtime
    pub fn set_alloc_budget(&self, bytes: Option<u64>) {
        *self.state.budget.lock() = bytes;
    }

    /// Bytes stored for a buffer, if it exists
    #[must_use]
    pub fn buffer_bytes(&self, id: BufferId) -> Option<Vec<u8>> {
        self.state.buffers.get(&id).map(|b| b.clone())
    }

    /// Store bytes for a buffer, for seeding test data
    pub fn put_buffer_bytes(&self, id: BufferId, bytes: Vec<u8>) {
        self.state.buffers.insert(id, bytes);
    }
}

impl TensorAllocator for HostBackend {
    fn spec(&self) -> DeviceSpec {
        self.state.spec
    }

    fn allocate(&self, meta: &TensorMeta) -> Option<Arc<DeviceBuffer>> {
        let size = meta.size_bytes();
        {
            let mut budget = self.state.budget.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining < size {
                    return None;
                }
                *remaining -= size;
            }
        }
        let buffer = DeviceBuffer::new_root(self.state.spec, size);
        self.state.buffers.insert(buffer.id(), vec![0; size as usize]);
        trace!(buffer = %buffer.id(), size, "host buffer allocated");
        Some(buffer)
    }
}

impl DeviceBackend for HostBackend {
    fn spec(&self) -> DeviceSpec {
        self.state.spec
    }

    fn allocator(&self, _attrs: AllocatorAttrs) -> Arc<dyn TensorAllocator> {
        // Host memory is host memory; the attribute split matters only
        // to platform backends.
        Arc::new(self.clone())
    }

    fn copy_via_dma(&self, src: &Tensor, dst: &Tensor, done: DmaDone) {
        let bytes = self
            .state
            .buffers
            .get(&src.buffer().id())
            .map(|b| b.clone())
            .unwrap_or_else(|| vec![0; src.meta().size_bytes() as usize]);
        self.state.buffers.insert(dst.buffer().id(), bytes);
        done(Ok(()));
    }

    fn assign_streams(&self, graph: &GraphHandle, max_streams: usize) -> Result<NodeStreamMap> {
        let mut map = NodeStreamMap::new();
        for (idx, node) in graph.nodes().iter().enumerate() {
            map.insert(node.id, (idx % max_streams.max(1)) as u32);
        }
        Ok(map)
    }
}

static_assertions::assert_impl_all!(HostBackend: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeDef;
    use vmux_tensor::TensorDtype;

    fn meta(elems: usize) -> TensorMeta {
        TensorMeta::new(vec![elems], TensorDtype::UInt8)
    }

    #[test]
    fn test_host_allocate_and_copy() {
        let backend = HostBackend::new(DeviceSpec::cpu(0));
        let src_buf = backend.allocate(&meta(8)).unwrap();
        backend.put_buffer_bytes(src_buf.id(), vec![7; 8]);
        let dst_buf = backend.allocate(&meta(8)).unwrap();

        let src = Tensor::new(meta(8), Arc::clone(&src_buf));
        let dst = Tensor::new(meta(8), Arc::clone(&dst_buf));

        let notif = Notification::new();
        let signal = Arc::clone(&notif);
        backend.copy_via_dma(&src, &dst, Box::new(move |r| signal.notify(r)));
        notif.wait().unwrap();

        assert_eq!(backend.buffer_bytes(dst_buf.id()).unwrap(), vec![7; 8]);
    }

    #[test]
    fn test_alloc_budget_exhaustion() {
        let backend = HostBackend::new(DeviceSpec::gpu(0)).with_alloc_budget(10);
        assert!(backend.allocate(&meta(8)).is_some());
        assert!(backend.allocate(&meta(8)).is_none());
        assert!(backend.allocate(&meta(2)).is_some());
    }

    #[test]
    fn test_assign_streams_round_robin() {
        let backend = HostBackend::new(DeviceSpec::gpu(0));
        let graph = GraphHandle::new(vec![
            NodeDef::new(0, "a"),
            NodeDef::new(1, "b"),
            NodeDef::new(2, "c"),
        ]);

        let map = backend.assign_streams(&graph, 2).unwrap();
        let logical: Vec<u32> = map.values().copied().collect();
        assert_eq!(logical, vec![0, 1, 0]);
    }

    #[test]
    fn test_notification_blocks_until_signal() {
        let notif = Notification::new();
        let signal = Arc::clone(&notif);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            signal.notify(Err("boom".into()));
        });

        assert_eq!(notif.wait(), Err("boom".to_string()));
        handle.join().unwrap();
    }
}
