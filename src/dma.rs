//! Scoped DMA buffer ownership.
//!
//! Every buffer handed out by the [`DmaService`] is owned by exactly one
//! [`DmaBuffer`]. The handle is released once, either explicitly through
//! [`DmaBuffer::release`] or when the guard drops; releasing again is a
//! no-op.

use std::sync::Arc;

use tracing::warn;

use crate::ddk::{Bank, DdkError, DmaHandle, DmaProperties, DmaService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Contiguous,
    Particles,
}

/// Owner of one DMA buffer or particle list.
pub(crate) struct DmaBuffer {
    dma: Arc<dyn DmaService>,
    handle: Option<DmaHandle>,
    len: usize,
    layout: Layout,
}

impl DmaBuffer {
    /// Allocate a contiguous buffer of `size` bytes from `bank`.
    pub(crate) fn alloc(
        dma: &Arc<dyn DmaService>,
        bank: Bank,
        size: usize,
    ) -> Result<Self, DdkError> {
        let handle = dma.alloc(DmaProperties::new(bank, size))?;
        Ok(Self {
            dma: Arc::clone(dma),
            handle: Some(handle),
            len: size,
            layout: Layout::Contiguous,
        })
    }

    /// Allocate a particle list with one particle per entry of `lens`.
    pub(crate) fn particles(dma: &Arc<dyn DmaService>, lens: &[usize]) -> Result<Self, DdkError> {
        let handle = dma.alloc_particles(lens)?;
        Ok(Self {
            dma: Arc::clone(dma),
            handle: Some(handle),
            len: lens.iter().sum(),
            layout: Layout::Particles,
        })
    }

    /// The live handle, or `InvalidHandle` once released.
    pub(crate) fn handle(&self) -> Result<DmaHandle, DdkError> {
        self.handle.ok_or(DdkError::InvalidHandle)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<(), DdkError> {
        if data.is_empty() {
            return Ok(());
        }
        self.dma.write(self.handle()?, offset, data)
    }

    /// Write little-endian words starting at offset zero.
    pub(crate) fn write_words(&self, words: &[u32]) -> Result<(), DdkError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(0, &bytes)
    }

    /// Copy the whole buffer out.
    pub(crate) fn read_all(&self) -> Result<Vec<u8>, DdkError> {
        let mut out = vec![0u8; self.len];
        if self.len > 0 {
            self.dma.read(self.handle()?, 0, &mut out)?;
        }
        Ok(out)
    }

    /// Release the buffer now. Later calls, and the eventual drop, do nothing.
    pub(crate) fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let res = match self.layout {
            Layout::Contiguous => self.dma.release(handle),
            Layout::Particles => self.dma.release_particles(handle),
        };
        if let Err(e) = res {
            warn!(handle = handle.0, error = %e, "DMA release failed");
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .field("layout", &self.layout)
            .finish()
    }
}
