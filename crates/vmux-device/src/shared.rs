//! Shared device: stream pool plus stream-assignment cache
//!
//! One `SharedDevice` exists per physical device for the lifetime of
//! the engine. It owns the physical stream pool and a cache of
//! node-to-logical-stream maps keyed by graph fingerprint, filled once
//! per graph and consumed every time a task on that graph is admitted.

use crate::adapter::DeviceBackend;
use crate::graph::{GraphHandle, NodeStreamMap};
use crate::per_task::PerTaskDevice;
use crate::streams::StreamPool;
use crate::{GraphFingerprint, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use vmux_resource::{DeviceSpec, ResourceContext};

/// Handle to one execution context of a device
///
/// Kernel launches for a node go through the context carrying that
/// node's physical stream. Context 0 doubles as the default context
/// for unmapped nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    /// Physical stream this context issues work on
    pub physical_stream: usize,
}

/// A physical device shared by every session of the runtime
pub struct SharedDevice {
    spec: DeviceSpec,
    backend: Arc<dyn DeviceBackend>,
    streams: StreamPool,
    assign_cache: DashMap<GraphFingerprint, NodeStreamMap>,
    contexts: Vec<DeviceContext>,
}

impl SharedDevice {
    /// Wrap a backend with `max_streams` physical stream slots
    ///
    /// # Panics
    ///
    /// Panics when `max_streams` is zero; every device has at least the
    /// default stream.
    #[must_use]
    pub fn new(backend: Arc<dyn DeviceBackend>, max_streams: usize) -> Arc<Self> {
        assert!(max_streams > 0, "a device needs at least one stream");
        let spec = backend.spec();
        let contexts = (0..max_streams)
            .map(|physical_stream| DeviceContext { physical_stream })
            .collect();
        Arc::new(Self {
            spec,
            backend,
            streams: StreamPool::new(max_streams),
            assign_cache: DashMap::new(),
            contexts,
        })
    }

    /// Device this wrapper drives
    #[inline]
    #[must_use]
    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    /// Maximum concurrent physical streams
    #[must_use]
    pub fn max_streams(&self) -> usize {
        self.contexts.len()
    }

    /// Backend adapter
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Execution context for a physical stream index
    ///
    /// # Panics
    ///
    /// Panics on an index outside the stream range.
    #[must_use]
    pub fn context(&self, physical_stream: usize) -> DeviceContext {
        self.contexts[physical_stream]
    }

    /// Compute and cache the stream assignment for a graph
    ///
    /// A single-stream device needs no assignment and returns
    /// immediately. A pre-existing cache entry for the same
    /// fingerprint is overwritten with a warning.
    pub fn fill_context_map(&self, graph: &GraphHandle) -> Result<()> {
        if self.max_streams() == 1 {
            return Ok(());
        }

        let fingerprint = graph.fingerprint();
        if self.assign_cache.contains_key(&fingerprint) {
            warn!(%fingerprint, "graph fingerprint reuse detected, overwriting stream map");
        }
        let map = self.backend.assign_streams(graph, self.max_streams())?;
        debug!(%fingerprint, nodes = map.len(), "stream map cached");
        self.assign_cache.insert(fingerprint, map);
        Ok(())
    }

    /// Drop the cached stream assignment for a graph
    pub fn flush_cache(&self, graph: &GraphHandle) {
        self.assign_cache.remove(&graph.fingerprint());
    }

    /// Cached assignment for a graph, if any
    #[must_use]
    pub fn cached_stream_map(&self, graph: &GraphHandle) -> Option<NodeStreamMap> {
        self.assign_cache
            .get(&graph.fingerprint())
            .map(|m| m.clone())
    }

    /// Build a per-task device bound to the graph's cached stream map
    ///
    /// Single-stream devices run every node on the default context, so
    /// a missing cache entry degrades to an empty map.
    #[must_use]
    pub fn create_per_task(
        self: &Arc<Self>,
        graph: &GraphHandle,
        rctx: ResourceContext,
    ) -> PerTaskDevice {
        let ns_map = self.cached_stream_map(graph).unwrap_or_default();
        PerTaskDevice::new(Arc::clone(self), rctx, ns_map)
    }

    pub(crate) fn allocate_streams(&self, count: usize) -> Vec<usize> {
        self.streams.allocate(count)
    }

    pub(crate) fn free_streams(&self, streams: &[usize]) {
        self.streams.free(streams);
    }

    /// Streams currently bound to per-task devices
    #[must_use]
    pub fn streams_in_use(&self) -> usize {
        self.streams.in_use()
    }
}

impl std::fmt::Debug for SharedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDevice")
            .field("spec", &self.spec)
            .field("max_streams", &self.max_streams())
            .field("streams_in_use", &self.streams_in_use())
            .field("cached_graphs", &self.assign_cache.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(SharedDevice: Send, Sync);
