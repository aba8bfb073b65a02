//! Per-task device: stream binding scoped to one admitted task
//!
//! Construction takes the task's staged GPU stream reservation,
//! converts it into physical stream slots, and maps the graph's
//! logical streams onto them round-robin. A shortage is survivable:
//! the reservation is rolled back and the task runs every node on the
//! default stream.

use crate::graph::{NodeId, NodeStreamMap};
use crate::shared::{DeviceContext, SharedDevice};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;
use vmux_resource::{DeviceSpec, ResourceContext, ResourceTag, ResourceType, Ticket};
use vmux_tensor::{DeviceBuffer, PageTarget, Tensor, TensorMeta};

use crate::adapter::{AllocatorAttrs, Notification};

/// Device wrapper scoped to a single task
pub struct PerTaskDevice {
    device: Arc<SharedDevice>,
    rctx: ResourceContext,
    /// Node to physical stream index
    ns_map: HashMap<NodeId, usize>,
    streams: Vec<usize>,
}

impl PerTaskDevice {
    pub(crate) fn new(
        device: Arc<SharedDevice>,
        rctx: ResourceContext,
        logical: NodeStreamMap,
    ) -> Self {
        // Take and use every gpu stream unit in the staging area.
        let mut streams = Vec::new();
        {
            let scope = rctx.alloc(ResourceType::GpuStream);
            if scope.is_valid() {
                let tag = ResourceTag::new(ResourceType::GpuStream, rctx.spec());
                let granted = scope.resources().get(tag) as usize;
                streams = device.allocate_streams(granted);
                if streams.len() != granted {
                    let err = crate::Error::StreamShortage {
                        requested: granted,
                        got: streams.len(),
                    };
                    error!(%err, "falling back to the default stream");
                    device.free_streams(&streams);
                    streams.clear();
                    scope.rollback();
                } else {
                    scope.commit();
                }
            }
        }

        // Map logical streams onto the obtained physical streams
        // round-robin, in node order.
        let mut ns_map = HashMap::with_capacity(logical.len());
        if !streams.is_empty() {
            let mut logical_to_phys: HashMap<u32, usize> = HashMap::new();
            let mut next = 0usize;
            for (&node, &stream) in logical.iter() {
                let physical = *logical_to_phys.entry(stream).or_insert_with(|| {
                    let chosen = streams[next];
                    next = (next + 1) % streams.len();
                    chosen
                });
                ns_map.insert(node, physical);
            }
        }

        Self {
            device,
            rctx,
            ns_map,
            streams,
        }
    }

    /// Execution context for a graph node
    ///
    /// Unmapped nodes run on the default context.
    #[must_use]
    pub fn device_context_for_node(&self, id: NodeId) -> DeviceContext {
        match self.ns_map.get(&id) {
            Some(&physical) => self.device.context(physical),
            None => self.device.context(0),
        }
    }

    /// Resource context accounting for this task
    #[must_use]
    pub fn resource_context(&self) -> &ResourceContext {
        &self.rctx
    }

    /// Shared device underneath
    #[must_use]
    pub fn shared(&self) -> &Arc<SharedDevice> {
        &self.device
    }

    /// Physical streams bound to this task
    #[must_use]
    pub fn streams(&self) -> &[usize] {
        &self.streams
    }

    /// Return the physical streams to the pool ahead of drop
    ///
    /// Callers that also release the stream units in the monitor must
    /// free the pool slots first, or a concurrent admission can see
    /// monitor capacity without obtainable slots.
    pub fn release_streams(&mut self) -> usize {
        let released = self.streams.len();
        self.device.free_streams(&self.streams);
        self.streams.clear();
        self.ns_map.clear();
        released
    }
}

impl Drop for PerTaskDevice {
    fn drop(&mut self) {
        self.device.free_streams(&self.streams);
    }
}

impl std::fmt::Debug for PerTaskDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerTaskDevice")
            .field("device", &self.device.spec())
            .field("rctx", &self.rctx)
            .field("streams", &self.streams)
            .field("mapped_nodes", &self.ns_map.len())
            .finish()
    }
}

impl PageTarget for PerTaskDevice {
    fn device(&self) -> DeviceSpec {
        self.device.spec()
    }

    fn ticket(&self) -> Ticket {
        self.rctx.ticket()
    }

    fn allocate_tensor(&self, meta: &TensorMeta) -> Option<Arc<DeviceBuffer>> {
        self.device
            .backend()
            .allocator(AllocatorAttrs::device())
            .allocate(meta)
    }

    fn copy_tensor(&self, src: &Tensor, dst: &Tensor) -> vmux_tensor::Result<()> {
        let notif = Notification::new();
        let signal = Arc::clone(&notif);
        self.device
            .backend()
            .copy_via_dma(src, dst, Box::new(move |result| signal.notify(result)));
        notif.wait().map_err(vmux_tensor::Error::Copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::HostBackend;
    use crate::graph::{GraphHandle, NodeDef};
    use vmux_resource::{ResourceMonitor, Resources};
    use vmux_tensor::{page_tree, CellArena, Entry, TensorBufferTree, TensorDtype};

    fn stream_tag() -> ResourceTag {
        ResourceTag::new(ResourceType::GpuStream, DeviceSpec::gpu(0))
    }

    fn setup(max_streams: usize) -> (Arc<ResourceMonitor>, Arc<SharedDevice>) {
        let mut cap = Resources::single(stream_tag(), max_streams as u64);
        cap.add(
            ResourceTag::new(ResourceType::Memory, DeviceSpec::gpu(0)),
            1 << 20,
        );
        let monitor = Arc::new(ResourceMonitor::new(cap));
        let backend = Arc::new(HostBackend::new(DeviceSpec::gpu(0)));
        let device = SharedDevice::new(backend, max_streams);
        (monitor, device)
    }

    fn graph(nodes: u32) -> GraphHandle {
        GraphHandle::new((0..nodes).map(|i| NodeDef::new(i, "op")).collect())
    }

    fn staged_ctx(monitor: &Arc<ResourceMonitor>, streams: u64) -> ResourceContext {
        let ticket = monitor
            .mint_staging(&Resources::single(stream_tag(), streams))
            .unwrap();
        ResourceContext::new(Arc::clone(monitor), 1, DeviceSpec::gpu(0), ticket)
    }

    #[test]
    fn test_streams_bound_and_mapped() {
        let (monitor, device) = setup(4);
        let g = graph(6);
        device.fill_context_map(&g).unwrap();

        let ptd = device.create_per_task(&g, staged_ctx(&monitor, 2));
        assert_eq!(ptd.streams().len(), 2);
        assert_eq!(monitor.in_use(stream_tag()), 2);

        // Six nodes colored over four logical streams, wrapped onto
        // two physical streams: every node resolves to a held stream.
        for node in g.nodes() {
            let ctx = ptd.device_context_for_node(node.id);
            assert!(ptd.streams().contains(&ctx.physical_stream));
        }
    }

    #[test]
    fn test_unmapped_node_uses_default_context() {
        let (monitor, device) = setup(4);
        let g = graph(2);
        device.fill_context_map(&g).unwrap();

        let ptd = device.create_per_task(&g, staged_ctx(&monitor, 1));
        let ctx = ptd.device_context_for_node(NodeId(99));
        assert_eq!(ctx.physical_stream, 0);
    }

    #[test]
    fn test_shortage_falls_back_to_zero_streams() {
        // Monitor believes in more stream units than the pool has
        // slots, so a granted reservation can still hit a shortage.
        let cap = Resources::single(stream_tag(), 8);
        let monitor = Arc::new(ResourceMonitor::new(cap));
        let backend = Arc::new(HostBackend::new(DeviceSpec::gpu(0)));
        let device = SharedDevice::new(backend, 2);

        let g = graph(4);
        device.fill_context_map(&g).unwrap();

        let ptd = device.create_per_task(&g, staged_ctx(&monitor, 4));

        // The two obtainable slots were freed again and the commitment
        // rolled back; the task runs on the default stream.
        assert!(ptd.streams().is_empty());
        assert_eq!(device.streams_in_use(), 0);
        assert_eq!(monitor.in_use(stream_tag()), 0);
        for node in g.nodes() {
            assert_eq!(ptd.device_context_for_node(node.id).physical_stream, 0);
        }
    }

    #[test]
    fn test_no_staging_means_zero_streams() {
        let (monitor, device) = setup(2);
        let g = graph(3);
        device.fill_context_map(&g).unwrap();

        let ticket = monitor
            .mint_staging(&Resources::single(
                ResourceTag::new(ResourceType::Memory, DeviceSpec::gpu(0)),
                64,
            ))
            .unwrap();
        let rctx = ResourceContext::new(Arc::clone(&monitor), 1, DeviceSpec::gpu(0), ticket);

        let ptd = device.create_per_task(&g, rctx);
        assert!(ptd.streams().is_empty());
        assert_eq!(ptd.device_context_for_node(NodeId(0)).physical_stream, 0);
    }

    #[test]
    fn test_drop_releases_streams() {
        let (monitor, device) = setup(2);
        let g = graph(2);
        device.fill_context_map(&g).unwrap();

        let ptd = device.create_per_task(&g, staged_ctx(&monitor, 2));
        assert_eq!(device.streams_in_use(), 2);
        drop(ptd);
        assert_eq!(device.streams_in_use(), 0);
    }

    #[test]
    fn test_page_target_moves_tree_onto_device() {
        let (monitor, device) = setup(2);
        let g = graph(1);
        device.fill_context_map(&g).unwrap();
        let ptd = device.create_per_task(&g, staged_ctx(&monitor, 1));

        let arena = CellArena::new();
        let src_root = DeviceBuffer::new_root(DeviceSpec::gpu(1), 64);
        let meta = TensorMeta::new(vec![16], TensorDtype::Float32);
        let mut tree = TensorBufferTree::with_root(Arc::clone(&src_root), Ticket::from_raw(99));
        tree.add_root_entry(Entry::Val(Tensor::new(meta, src_root)));

        page_tree(&mut tree, &ptd, &arena).unwrap();
        assert_eq!(tree.ticket(), ptd.resource_context().ticket());
        assert_eq!(tree.roots()[0].tensor(&arena).spec(), DeviceSpec::gpu(0));
    }
}
