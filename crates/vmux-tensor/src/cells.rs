//! Arena of shared mutable tensor cells
//!
//! Aliased tensor entries do not point at each other; they all carry
//! the index of a cell in this arena. Rewriting the cell once moves
//! every alias, and "already moved" is a set of indices rather than a
//! pointer-identity question.

use crate::tensor::Tensor;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Index of a shared tensor cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(pub u32);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell-{}", self.0)
    }
}

/// Arena owning every shared tensor cell of a session
#[derive(Debug, Default)]
pub struct CellArena {
    cells: RwLock<Vec<Arc<Mutex<Tensor>>>>,
}

impl CellArena {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a tensor in a fresh cell
    pub fn insert(&self, tensor: Tensor) -> CellId {
        let mut cells = self.cells.write();
        let id = CellId(cells.len() as u32);
        cells.push(Arc::new(Mutex::new(tensor)));
        id
    }

    /// Snapshot of the tensor held by a cell
    ///
    /// # Panics
    ///
    /// Panics on an id that was never issued by this arena.
    #[must_use]
    pub fn read(&self, id: CellId) -> Tensor {
        self.slot(id).lock().clone()
    }

    /// Replace the tensor held by a cell
    pub fn write(&self, id: CellId, tensor: Tensor) {
        *self.slot(id).lock() = tensor;
    }

    /// Number of cells issued
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    /// True when no cells were issued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    fn slot(&self, id: CellId) -> Arc<Mutex<Tensor>> {
        self.cells
            .read()
            .get(id.0 as usize)
            .cloned()
            .unwrap_or_else(|| panic!("unknown {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DeviceBuffer;
    use crate::tensor::{TensorDtype, TensorMeta};
    use vmux_resource::DeviceSpec;

    fn tensor_on(spec: DeviceSpec) -> Tensor {
        let meta = TensorMeta::new(vec![4], TensorDtype::Float32);
        let buf = DeviceBuffer::new_root(spec, meta.size_bytes());
        Tensor::new(meta, buf)
    }

    #[test]
    fn test_insert_read_write() {
        let arena = CellArena::new();
        let id = arena.insert(tensor_on(DeviceSpec::gpu(0)));
        assert_eq!(arena.read(id).spec(), DeviceSpec::gpu(0));

        arena.write(id, tensor_on(DeviceSpec::gpu(1)));
        assert_eq!(arena.read(id).spec(), DeviceSpec::gpu(1));
    }

    #[test]
    fn test_ids_are_sequential() {
        let arena = CellArena::new();
        let a = arena.insert(tensor_on(DeviceSpec::cpu(0)));
        let b = arena.insert(tensor_on(DeviceSpec::cpu(0)));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    #[should_panic(expected = "unknown cell")]
    fn test_unknown_cell_panics() {
        let arena = CellArena::new();
        let _ = arena.read(CellId(3));
    }
}
