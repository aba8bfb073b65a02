//! Tensor buffer trees: the unit of paging
//!
//! A tree ties together one root buffer, the sub-buffers aliasing into
//! it, and every tensor entry backed by either. The tree holds one
//! reference on the root and one per sub-buffer; each entry's tensor
//! holds its own reference on whichever buffer backs it.

use crate::buffer::{BufferId, DeviceBuffer};
use crate::cells::{CellArena, CellId};
use crate::tensor::Tensor;
use std::fmt;
use std::sync::Arc;
use vmux_resource::Ticket;

/// One tensor entry of a tree
///
/// An entry either owns its tensor by value or aliases a shared cell.
/// Entries sharing a cell must move together when the tree pages.
#[derive(Debug)]
pub enum Entry {
    /// Tensor held by value
    Val(Tensor),
    /// Tensor held through a shared arena cell
    Ref(CellId),
}

impl Entry {
    /// Snapshot of the entry's current tensor
    #[must_use]
    pub fn tensor(&self, arena: &CellArena) -> Tensor {
        match self {
            Entry::Val(tensor) => tensor.clone(),
            Entry::Ref(id) => arena.read(*id),
        }
    }

    /// Replace the entry's tensor, preserving the by-value/by-ref mode
    pub fn set(&mut self, arena: &CellArena, tensor: Tensor) {
        match self {
            Entry::Val(slot) => *slot = tensor,
            Entry::Ref(id) => arena.write(*id, tensor),
        }
    }

    /// Cell this entry aliases, if any
    #[must_use]
    pub fn cell(&self) -> Option<CellId> {
        match self {
            Entry::Val(_) => None,
            Entry::Ref(id) => Some(*id),
        }
    }

    /// True for by-reference entries
    #[must_use]
    pub fn is_ref(&self) -> bool {
        matches!(self, Entry::Ref(_))
    }
}

/// A root buffer, its aliasing sub-buffers, and their entries
pub struct TensorBufferTree {
    pub(crate) root_buf: Option<Arc<DeviceBuffer>>,
    pub(crate) ticket: Ticket,
    pub(crate) roots: Vec<Entry>,
    pub(crate) subs: Vec<(Arc<DeviceBuffer>, Vec<Entry>)>,
}

impl TensorBufferTree {
    /// Empty tree with no root buffer
    #[must_use]
    pub fn new(ticket: Ticket) -> Self {
        Self {
            root_buf: None,
            ticket,
            roots: Vec::new(),
            subs: Vec::new(),
        }
    }

    /// Tree rooted at `root`
    #[must_use]
    pub fn with_root(root: Arc<DeviceBuffer>, ticket: Ticket) -> Self {
        Self {
            root_buf: Some(root),
            ticket,
            roots: Vec::new(),
            subs: Vec::new(),
        }
    }

    /// True when the tree holds no entries at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.subs.iter().all(|(_, entries)| entries.is_empty())
    }

    /// Root buffer, if set
    #[must_use]
    pub fn root_buf(&self) -> Option<&Arc<DeviceBuffer>> {
        self.root_buf.as_ref()
    }

    /// Ticket currently accounting for this tree
    #[must_use]
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Entries backed by the root buffer
    #[must_use]
    pub fn roots(&self) -> &[Entry] {
        &self.roots
    }

    /// Sub-buffers and their entries
    #[must_use]
    pub fn subs(&self) -> &[(Arc<DeviceBuffer>, Vec<Entry>)] {
        &self.subs
    }

    /// Add an entry tracked under the root buffer
    ///
    /// # Panics
    ///
    /// Panics when the tree has no root buffer.
    pub fn add_root_entry(&mut self, entry: Entry) {
        assert!(
            self.root_buf.is_some(),
            "adding a root entry to a rootless tree"
        );
        self.roots.push(entry);
    }

    /// Add an entry tracked under a sub-buffer, registering the sub if new
    ///
    /// Entries sharing a cell may be tracked under different buffers;
    /// paging rewrites each cell at most once regardless of grouping.
    pub fn add_sub_entry(&mut self, sub: Arc<DeviceBuffer>, entry: Entry) {
        if let Some((_, entries)) = self.subs.iter_mut().find(|(s, _)| s.id() == sub.id()) {
            entries.push(entry);
        } else {
            self.subs.push((sub, vec![entry]));
        }
    }

    /// Total number of entries across root and subs
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.roots.len() + self.subs.iter().map(|(_, e)| e.len()).sum::<usize>()
    }
}

impl fmt::Debug for TensorBufferTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBufferTree")
            .field("root_buf", &self.root_buf.as_ref().map(|b| b.id()))
            .field("ticket", &self.ticket)
            .field("roots", &self.roots.len())
            .field("subs", &self.subs.len())
            .finish()
    }
}

/// Identity of the root buffer, for cache keys and logs
#[must_use]
pub fn root_id(tree: &TensorBufferTree) -> Option<BufferId> {
    tree.root_buf.as_ref().map(|b| b.id())
}

static_assertions::assert_impl_all!(TensorBufferTree: Send, Sync);
