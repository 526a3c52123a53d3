//! Parameter block codec.
//!
//! Most semihosting calls pass a pointer to a block of target words. The block is
//! read and written in 32-bit elements so the debug-port layer can use its fastest
//! access path; individual fields are decoded in the target's word size and byte order.

use scroll::{Endian, Pread, Pwrite};

use crate::target::{Target, TargetError, WordSize};

/// The largest number of fields any semihosting call uses.
pub const MAX_FIELDS: usize = 4;

/// A copy of a semihosting parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterBlock {
    address: u64,
    word_size: WordSize,
    endian: Endian,
    bytes: [u8; MAX_FIELDS * 8],
}

impl ParameterBlock {
    /// Create an all-zero block located at `address`.
    pub fn new(address: u64, word_size: WordSize, endian: Endian) -> Self {
        Self {
            address,
            word_size,
            endian,
            bytes: [0; MAX_FIELDS * 8],
        }
    }

    /// Read the first `count` fields of the block at `address` from the target.
    pub fn read(target: &mut dyn Target, address: u64, count: usize) -> Result<Self, TargetError> {
        let mut block = Self::new(address, target.word_size(), target.endianness());
        block.load(target, count)?;
        Ok(block)
    }

    /// Target address of the block.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Refresh the first `count` fields from target memory.
    pub fn load(&mut self, target: &mut dyn Target, count: usize) -> Result<(), TargetError> {
        let len = self.span(count);
        target.read_memory(self.address, 4, len / 4, &mut self.bytes[..len])
    }

    /// Write the first `count` fields back to target memory.
    pub fn store(&self, target: &mut dyn Target, count: usize) -> Result<(), TargetError> {
        let len = self.span(count);
        target.write_memory(self.address, 4, len / 4, &self.bytes[..len])
    }

    /// Decode field `index`, zero extended to 64 bits.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`MAX_FIELDS`].
    pub fn get(&self, index: usize) -> u64 {
        let offset = self.offset(index);
        let value = match self.word_size {
            WordSize::U32 => self
                .bytes
                .pread_with::<u32>(offset, self.endian)
                .map(u64::from),
            WordSize::U64 => self.bytes.pread_with::<u64>(offset, self.endian),
        };
        value.unwrap_or_default()
    }

    /// Encode `value` into field `index`. On 32-bit targets only the low word is kept.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`MAX_FIELDS`].
    pub fn set(&mut self, index: usize, value: u64) {
        let offset = self.offset(index);
        let endian = self.endian;
        let written = match self.word_size {
            WordSize::U32 => self.bytes.pwrite_with(value as u32, offset, endian),
            WordSize::U64 => self.bytes.pwrite_with(value, offset, endian),
        };
        written.unwrap_or_default();
    }

    fn offset(&self, index: usize) -> usize {
        assert!(index < MAX_FIELDS, "parameter block has {MAX_FIELDS} fields");
        index * self.word_size.bytes()
    }

    fn span(&self, count: usize) -> usize {
        count.min(MAX_FIELDS) * self.word_size.bytes()
    }
}
