use crate::backend::BufferId;

/// Minimum alignment of every tensor placed inside a shared resource buffer.
pub const BUFFER_ALIGNMENT: u64 = 16;

pub fn round_up_to_multiple(value: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// A byte range of a backend buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
}

/// Resources bound to one initializer or dispatch call.
///
/// `inputs` and `outputs` are indexed like the native graph's inputs and outputs; `None` leaves a
/// slot unbound (constants after initialization, for instance).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    pub inputs: Vec<Option<BufferBinding>>,
    pub outputs: Vec<Option<BufferBinding>>,
    pub temporary: Option<BufferBinding>,
    pub persistent: Option<BufferBinding>,
}

impl BindingTable {
    pub fn with_slots(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs: vec![None; inputs],
            outputs: vec![None; outputs],
            temporary: None,
            persistent: None,
        }
    }
}

/// Aligned placement of several tensors inside one buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferLayout {
    offsets: Vec<Option<u64>>,
    sizes: Vec<u64>,
    total: u64,
}

impl BufferLayout {
    /// Packs the present entries of `sizes` starting at `base`, each at a 16-byte boundary.
    pub fn pack(base: u64, sizes: impl IntoIterator<Item = Option<u64>>) -> Self {
        let mut cursor = round_up_to_multiple(base, BUFFER_ALIGNMENT);
        let mut offsets = Vec::new();
        let mut packed_sizes = Vec::new();
        for size in sizes {
            match size {
                Some(size) => {
                    offsets.push(Some(cursor));
                    packed_sizes.push(size);
                    cursor = round_up_to_multiple(cursor + size, BUFFER_ALIGNMENT);
                }
                None => {
                    offsets.push(None);
                    packed_sizes.push(0);
                }
            }
        }
        Self {
            offsets,
            sizes: packed_sizes,
            total: cursor,
        }
    }

    /// End of the last entry, aligned.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn binding(&self, index: usize, buffer: BufferId) -> Option<BufferBinding> {
        let offset = self.offsets.get(index).copied().flatten()?;
        Some(BufferBinding {
            buffer,
            offset,
            size: self.sizes[index],
        })
    }

    pub fn offset(&self, index: usize) -> Option<u64> {
        self.offsets.get(index).copied().flatten()
    }
}
