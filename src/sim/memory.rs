//! Simulated bank memory
//!
//! Controllers share a fixed pool of dual-port RAM between all of their
//! endpoints (or pipes). Banks are carved from the top of the pool, and are
//! only returned all at once, when the controller disables every endpoint.

use core::ops::Range;

/// Size of the simulated dual-port RAM, in bytes.
pub const BANK_MEMORY_SIZE: usize = 832;

/// Bank memory allocator
pub struct BankMemory {
    ram: [u8; BANK_MEMORY_SIZE],
    top: usize,
}

impl BankMemory {
    pub const fn new() -> Self {
        BankMemory {
            ram: [0; BANK_MEMORY_SIZE],
            top: BANK_MEMORY_SIZE,
        }
    }

    /// Allocates a bank region of `size` bytes.
    ///
    /// Returns `None` when the pool can't hold `size` more bytes.
    pub fn allocate(&mut self, size: usize) -> Option<Range<usize>> {
        let start = self.top.checked_sub(size)?;
        self.top = start;
        Some(start..start + size)
    }

    /// Return every allocation to the pool.
    pub fn release_all(&mut self) {
        self.top = BANK_MEMORY_SIZE;
    }

    /// Returns the number of unallocated bytes.
    pub fn available(&self) -> usize {
        self.top
    }

    pub fn get(&self, offset: usize) -> u8 {
        self.ram.get(offset).copied().unwrap_or(0)
    }

    pub fn set(&mut self, offset: usize, byte: u8) {
        if let Some(slot) = self.ram.get_mut(offset) {
            *slot = byte;
        }
    }

    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        self.ram.get(range).unwrap_or(&[])
    }

    /// Copy `bytes` into memory at `offset`.
    pub fn fill(&mut self, offset: usize, bytes: &[u8]) {
        if let Some(dst) = self.ram.get_mut(offset..offset + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    }
}
