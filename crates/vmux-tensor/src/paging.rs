//! Relocation of a tensor buffer tree to another device
//!
//! Pages every entry of a tree onto the destination: the first root
//! entry is moved with an actual data copy, every other entry is
//! re-headered onto the new buffers without touching data, and entries
//! sharing a cell are rewritten at most once. On a mid-flight failure
//! the tree is left partially moved with its ticket already re-pointed;
//! callers must treat the tree as damaged and surface the error.

use crate::buffer::DeviceBuffer;
use crate::cells::{CellArena, CellId};
use crate::tensor::{Tensor, TensorMeta};
use crate::tree::TensorBufferTree;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, trace};
use vmux_resource::{DeviceSpec, Ticket};

/// Destination of a paging operation
///
/// Implemented by the per-task device layer: allocation goes through
/// the backend allocator of the destination device, and the copy blocks
/// on the cross-device DMA primitive's completion notification.
pub trait PageTarget {
    /// Destination device
    fn device(&self) -> DeviceSpec;

    /// Ticket accounting for resources on the destination
    fn ticket(&self) -> Ticket;

    /// Allocate a destination buffer for a tensor, `None` on pressure
    fn allocate_tensor(&self, meta: &TensorMeta) -> Option<Arc<DeviceBuffer>>;

    /// Copy tensor data across devices, returning once complete
    fn copy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<()>;
}

/// Move every tensor tied to the tree's root buffer onto `dst`
///
/// A tree without a root buffer pages trivially. A tree with a root
/// buffer but no entries is corrupt and fails with
/// [`Error::Internal`].
pub fn page_tree(
    tree: &mut TensorBufferTree,
    dst: &dyn PageTarget,
    arena: &CellArena,
) -> Result<()> {
    let Some(old_root) = tree.root_buf.clone() else {
        // No buffer to move: zero bytes paged.
        return Ok(());
    };
    if tree.roots.is_empty() {
        return Err(Error::Internal(
            "root buffer set but the tree has no root entries".into(),
        ));
    }

    let old_ticket = tree.ticket;
    tree.ticket = dst.ticket();
    trace!(
        root = %old_root.id(),
        %old_ticket,
        new_ticket = %tree.ticket,
        dst = %dst.device(),
        "paging tensor buffer tree"
    );

    let mut moved: HashSet<CellId> = HashSet::new();
    let mut new_root: Option<Arc<DeviceBuffer>> = None;

    // Page the root buffer: only the first entry carries a data copy.
    for entry in tree.roots.iter_mut() {
        if new_root.is_none() {
            let src = entry.tensor(arena);
            let Some(dst_buf) = dst.allocate_tensor(src.meta()) else {
                error!(dst = %dst.device(), "destination allocation failed while paging");
                return Err(Error::ResourceExhausted);
            };
            let copy = Tensor::new(src.meta().clone(), Arc::clone(&dst_buf));
            if let Err(err) = dst.copy_tensor(&src, &copy) {
                error!(%err, "error while paging root entry");
                return Err(err);
            }
            if let Some(cell) = entry.cell() {
                moved.insert(cell);
            }
            entry.set(arena, copy);
            new_root = Some(dst_buf);
            continue;
        }

        // Only one entry per shared cell is rewritten.
        if let Some(cell) = entry.cell() {
            if !moved.insert(cell) {
                continue;
            }
        }
        let root = new_root.as_ref().expect("first root entry was moved");
        let headed = entry.tensor(arena).clone_with_buffer(root);
        entry.set(arena, headed);
    }

    let new_root = new_root.expect("first root entry was moved");
    // Replacing the tree's hold drops the last tree reference on the
    // old root once every entry has been re-headered.
    tree.root_buf = Some(Arc::clone(&new_root));

    // Re-target sub-buffers against the new root.
    let old_subs = std::mem::take(&mut tree.subs);
    let mut new_subs = Vec::with_capacity(old_subs.len());
    for (old_sub, mut entries) in old_subs {
        let new_sub = DeviceBuffer::clone_with_root(&old_sub, &new_root);
        trace!(old = %old_sub.id(), new = %new_sub.id(), "re-targeting sub buffer");

        for entry in entries.iter_mut() {
            if let Some(cell) = entry.cell() {
                if !moved.insert(cell) {
                    continue;
                }
            }
            let headed = entry.tensor(arena).clone_with_buffer(&new_sub);
            entry.set(arena, headed);
        }

        debug_assert_eq!(
            Arc::strong_count(&old_sub),
            1,
            "old sub buffer still referenced after paging"
        );
        new_subs.push((new_sub, entries));
    }
    tree.subs = new_subs;

    Ok(())
}
