//! End-to-end paging: aliasing and reference-count properties
//!
//! Builds trees the way the runtime does (root entries by value and by
//! shared cell, sub-buffers aliasing the root) and checks that paging
//! to another device preserves aliasing, rewrites each cell at most
//! once, and leaves the expected reference counts behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use vmux_resource::{DeviceSpec, Ticket};
use vmux_tensor::{
    page_tree, CellArena, DeviceBuffer, Entry, PageTarget, Tensor, TensorBufferTree, TensorDtype,
    TensorMeta,
};

/// Paging destination that fabricates buffers on its device and counts
/// the data copies it performed.
struct Target {
    spec: DeviceSpec,
    ticket: Ticket,
    copies: AtomicUsize,
}

impl Target {
    fn new(spec: DeviceSpec, ticket: Ticket) -> Self {
        Self {
            spec,
            ticket,
            copies: AtomicUsize::new(0),
        }
    }
}

impl PageTarget for Target {
    fn device(&self) -> DeviceSpec {
        self.spec
    }

    fn ticket(&self) -> Ticket {
        self.ticket
    }

    fn allocate_tensor(&self, meta: &TensorMeta) -> Option<Arc<DeviceBuffer>> {
        Some(DeviceBuffer::new_root(self.spec, meta.size_bytes()))
    }

    fn copy_tensor(&self, _src: &Tensor, _dst: &Tensor) -> vmux_tensor::Result<()> {
        self.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn meta() -> TensorMeta {
    TensorMeta::new(vec![32], TensorDtype::Float32)
}

#[test]
fn test_round_trip_scenario() {
    let arena = CellArena::new();
    let old_root = DeviceBuffer::new_root(DeviceSpec::gpu(0), 1024);
    let old_root_weak: Weak<DeviceBuffer> = Arc::downgrade(&old_root);

    let mut tree = TensorBufferTree::with_root(Arc::clone(&old_root), Ticket::from_raw(1));

    // Two root entries: one by value, one through a shared cell.
    tree.add_root_entry(Entry::Val(Tensor::new(meta(), Arc::clone(&old_root))));
    let cell = arena.insert(Tensor::new(meta(), Arc::clone(&old_root)));
    tree.add_root_entry(Entry::Ref(cell));

    // One sub with an entry aliasing the same cell.
    let old_sub = DeviceBuffer::new_sub(&old_root, 64, 128);
    tree.add_sub_entry(Arc::clone(&old_sub), Entry::Ref(cell));

    drop(old_sub);
    drop(old_root);

    let dst = Target::new(DeviceSpec::gpu(1), Ticket::from_raw(7));
    page_tree(&mut tree, &dst, &arena).unwrap();

    // Every entry now lives on the destination device.
    for entry in tree.roots() {
        assert_eq!(entry.tensor(&arena).spec(), DeviceSpec::gpu(1));
    }
    for (_, entries) in tree.subs() {
        for entry in entries {
            assert_eq!(entry.tensor(&arena).spec(), DeviceSpec::gpu(1));
        }
    }

    // The two ref entries still share one cell.
    assert_eq!(tree.roots()[1].cell(), tree.subs()[0].1[0].cell());

    // Exactly one data copy was made for the whole tree.
    assert_eq!(dst.copies.load(Ordering::Relaxed), 1);

    // The tree is accounted to the destination ticket.
    assert_eq!(tree.ticket(), Ticket::from_raw(7));

    // The old root was freed once every header moved off it.
    assert!(old_root_weak.upgrade().is_none());

    // New root holds: value entry + shared cell + the tree itself.
    let new_root = tree.root_buf().unwrap();
    assert_eq!(Arc::strong_count(new_root), 3);

    // The new sub is held by the tree alone: its only entry aliases a
    // cell that was already rewritten onto the root.
    let (new_sub, _) = &tree.subs()[0];
    assert_eq!(Arc::strong_count(new_sub), 1);
    assert_eq!(new_sub.parent(), Some(new_root.id()));
}

#[test]
fn test_distinct_sub_cells_rewrite_onto_new_sub() {
    let arena = CellArena::new();
    let root = DeviceBuffer::new_root(DeviceSpec::gpu(0), 1024);
    let mut tree = TensorBufferTree::with_root(Arc::clone(&root), Ticket::from_raw(1));
    tree.add_root_entry(Entry::Val(Tensor::new(meta(), Arc::clone(&root))));

    let sub = DeviceBuffer::new_sub(&root, 0, 256);
    let sub_cell = arena.insert(Tensor::new(meta(), Arc::clone(&sub)));
    tree.add_sub_entry(Arc::clone(&sub), Entry::Ref(sub_cell));
    tree.add_sub_entry(
        Arc::clone(&sub),
        Entry::Val(Tensor::new(meta(), Arc::clone(&sub))),
    );
    drop(sub);
    drop(root);

    let dst = Target::new(DeviceSpec::gpu(1), Ticket::from_raw(2));
    page_tree(&mut tree, &dst, &arena).unwrap();

    let (new_sub, entries) = &tree.subs()[0];
    for entry in entries {
        let tensor = entry.tensor(&arena);
        assert_eq!(tensor.spec(), DeviceSpec::gpu(1));
        assert_eq!(tensor.buffer().id(), new_sub.id());
    }
    // Tree hold + ref cell + value entry.
    assert_eq!(Arc::strong_count(new_sub), 3);
}

#[test]
fn test_shared_cell_between_root_entries_rewritten_once() {
    let arena = CellArena::new();
    let root = DeviceBuffer::new_root(DeviceSpec::gpu(0), 512);
    let mut tree = TensorBufferTree::with_root(Arc::clone(&root), Ticket::from_raw(1));

    let cell = arena.insert(Tensor::new(meta(), Arc::clone(&root)));
    // The cell is the first entry, so the data copy moves it; the
    // second alias of the same cell must be skipped.
    tree.add_root_entry(Entry::Ref(cell));
    tree.add_root_entry(Entry::Ref(cell));
    tree.add_root_entry(Entry::Val(Tensor::new(meta(), Arc::clone(&root))));
    drop(root);

    let dst = Target::new(DeviceSpec::gpu(1), Ticket::from_raw(3));
    page_tree(&mut tree, &dst, &arena).unwrap();

    assert_eq!(dst.copies.load(Ordering::Relaxed), 1);
    // Cell + value entry + tree hold.
    assert_eq!(Arc::strong_count(tree.root_buf().unwrap()), 3);
    assert_eq!(arena.read(cell).spec(), DeviceSpec::gpu(1));
}

#[test]
fn test_paging_twice_round_trips() {
    let arena = CellArena::new();
    let root = DeviceBuffer::new_root(DeviceSpec::gpu(0), 256);
    let mut tree = TensorBufferTree::with_root(Arc::clone(&root), Ticket::from_raw(1));
    tree.add_root_entry(Entry::Val(Tensor::new(meta(), Arc::clone(&root))));
    drop(root);

    let there = Target::new(DeviceSpec::gpu(1), Ticket::from_raw(2));
    let back = Target::new(DeviceSpec::gpu(0), Ticket::from_raw(3));

    page_tree(&mut tree, &there, &arena).unwrap();
    assert_eq!(tree.roots()[0].tensor(&arena).spec(), DeviceSpec::gpu(1));

    page_tree(&mut tree, &back, &arena).unwrap();
    assert_eq!(tree.roots()[0].tensor(&arena).spec(), DeviceSpec::gpu(0));
    assert_eq!(tree.ticket(), Ticket::from_raw(3));
}
