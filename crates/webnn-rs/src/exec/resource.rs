use std::sync::Arc;

use log::debug;

use crate::backend::{BufferId, BufferUsage, NativeBackend};
use crate::error::WebnnResult;

/// Capacity after growing `current` to hold `requested` bytes.
///
/// Rounds up to the next power of two, never below `floor` and never below `current`.
pub fn grown_capacity(current: u64, requested: u64, floor: u64) -> u64 {
    if requested <= current {
        return current;
    }
    requested
        .max(floor)
        .checked_next_power_of_two()
        .unwrap_or(requested)
        .max(current)
}

/// A backend buffer that is reused across calls and only ever grows.
#[derive(Debug)]
pub struct ResourceBuffer {
    usage: BufferUsage,
    buffer: Option<BufferId>,
    capacity: u64,
}

impl ResourceBuffer {
    pub fn new(usage: BufferUsage) -> Self {
        Self {
            usage,
            buffer: None,
            capacity: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Returns a buffer of at least `bytes`, reallocating only on growth.
    ///
    /// Contents are not preserved across a reallocation.
    pub fn ensure_capacity(
        &mut self,
        backend: &dyn NativeBackend,
        bytes: u64,
        floor: u64,
    ) -> WebnnResult<BufferId> {
        if let Some(buffer) = self.buffer {
            if bytes <= self.capacity {
                return Ok(buffer);
            }
        }
        let capacity = grown_capacity(self.capacity, bytes.max(1), floor);
        let buffer = backend.allocate_buffer(capacity, self.usage)?;
        if let Some(previous) = self.buffer.replace(buffer) {
            backend.release_buffer(previous);
        }
        debug!(
            "resized {:?} buffer from {} to {} bytes",
            self.usage, self.capacity, capacity
        );
        self.capacity = capacity;
        Ok(buffer)
    }

    fn release(&mut self, backend: &dyn NativeBackend) {
        if let Some(buffer) = self.buffer.take() {
            backend.release_buffer(buffer);
        }
        self.capacity = 0;
    }
}

/// Resource buffers of one compiled graph.
pub struct ResourcePool {
    backend: Arc<dyn NativeBackend>,
    floor: u64,
    upload: ResourceBuffer,
    input: ResourceBuffer,
    output: ResourceBuffer,
    readback: ResourceBuffer,
    temporary: ResourceBuffer,
    persistent: ResourceBuffer,
}

impl ResourcePool {
    pub fn new(backend: Arc<dyn NativeBackend>, floor: u64) -> Self {
        Self {
            backend,
            floor,
            upload: ResourceBuffer::new(BufferUsage::Upload),
            input: ResourceBuffer::new(BufferUsage::Device),
            output: ResourceBuffer::new(BufferUsage::Device),
            readback: ResourceBuffer::new(BufferUsage::Readback),
            temporary: ResourceBuffer::new(BufferUsage::Device),
            persistent: ResourceBuffer::new(BufferUsage::Device),
        }
    }

    pub fn backend(&self) -> &dyn NativeBackend {
        self.backend.as_ref()
    }

    pub fn ensure(&mut self, which: PoolBuffer, bytes: u64) -> WebnnResult<BufferId> {
        let floor = self.floor;
        let backend = Arc::clone(&self.backend);
        self.buffer_mut(which)
            .ensure_capacity(backend.as_ref(), bytes, floor)
    }

    pub fn get(&self, which: PoolBuffer) -> &ResourceBuffer {
        match which {
            PoolBuffer::Upload => &self.upload,
            PoolBuffer::Input => &self.input,
            PoolBuffer::Output => &self.output,
            PoolBuffer::Readback => &self.readback,
            PoolBuffer::Temporary => &self.temporary,
            PoolBuffer::Persistent => &self.persistent,
        }
    }

    fn buffer_mut(&mut self, which: PoolBuffer) -> &mut ResourceBuffer {
        match which {
            PoolBuffer::Upload => &mut self.upload,
            PoolBuffer::Input => &mut self.input,
            PoolBuffer::Output => &mut self.output,
            PoolBuffer::Readback => &mut self.readback,
            PoolBuffer::Temporary => &mut self.temporary,
            PoolBuffer::Persistent => &mut self.persistent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBuffer {
    Upload,
    Input,
    Output,
    Readback,
    Temporary,
    Persistent,
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        let backend = Arc::clone(&self.backend);
        for buffer in [
            &mut self.upload,
            &mut self.input,
            &mut self.output,
            &mut self.readback,
            &mut self.temporary,
            &mut self.persistent,
        ] {
            buffer.release(backend.as_ref());
        }
    }
}
