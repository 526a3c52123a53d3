//! The interface consumed from the debug-port layer.
//!
//! Everything the host services need from a target is expressed by the [`Target`] trait:
//! memory access parameterized by element size and count, access to the few core registers
//! the semihosting trap ABI uses, and a handful of queries about the target and the debug
//! session around it.

pub use scroll::Endian;

use serde::{Deserialize, Serialize};

/// Native word size of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WordSize {
    /// 32-bit target (AArch32, RV32).
    U32,
    /// 64-bit target (AArch64, RV64).
    U64,
}

impl WordSize {
    /// The number of bytes in one word.
    pub fn bytes(self) -> usize {
        match self {
            WordSize::U32 => 4,
            WordSize::U64 => 8,
        }
    }

    /// Truncate `value` to the width of a target word.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            WordSize::U32 => value & 0xffff_ffff,
            WordSize::U64 => value,
        }
    }
}

/// Core registers used by the semihosting trap ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreRegister {
    /// Holds the operation number on entry (r0, x0 or a0).
    Operation,
    /// Holds the parameter on entry (r1, x1 or a1).
    Parameter,
    /// Receives the result on exit (r0, x0 or a0).
    Return,
}

/// Failures reported by the debug-port layer.
///
/// These are always fatal to the semihosting call or trace operation that triggered them.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TargetError {
    /// Failed to access {len} bytes of target memory at {address:#010x}.
    MemoryAccess {
        /// Start address of the failed access.
        address: u64,
        /// Number of bytes in the failed access.
        len: usize,
    },

    /// Failed to access core register {0:?}.
    Register(CoreRegister),

    /// The target has not been examined yet.
    NotExamined,

    /// {0}
    Other(String),
}

/// A debuggable target, as seen by the host services.
pub trait Target {
    /// Name of the target, used in log messages.
    fn name(&self) -> &str;

    /// Native word size of the target.
    fn word_size(&self) -> WordSize;

    /// Byte order of the target.
    fn endianness(&self) -> Endian;

    /// Whether the target has been examined by the debug-port layer.
    fn was_examined(&self) -> bool {
        true
    }

    /// Read `count` elements of `size` bytes each, starting at `address`.
    ///
    /// `data` is exactly `size * count` bytes long. A partial read is an error.
    fn read_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), TargetError>;

    /// Write `count` elements of `size` bytes each, starting at `address`.
    ///
    /// `data` is exactly `size * count` bytes long. A partial write is an error.
    fn write_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        data: &[u8],
    ) -> Result<(), TargetError>;

    /// Read an arbitrary byte buffer from `address`.
    fn read_buffer(&mut self, address: u64, data: &mut [u8]) -> Result<(), TargetError> {
        let count = data.len();
        self.read_memory(address, 1, count, data)
    }

    /// Write an arbitrary byte buffer to `address`.
    fn write_buffer(&mut self, address: u64, data: &[u8]) -> Result<(), TargetError> {
        self.write_memory(address, 1, data.len(), data)
    }

    /// Read a core register, zero extended to 64 bits.
    fn read_core_reg(&mut self, register: CoreRegister) -> Result<u64, TargetError>;

    /// Write a core register. Only the low word is used on 32-bit targets.
    fn write_core_reg(&mut self, register: CoreRegister, value: u64) -> Result<(), TargetError>;

    /// Whether a remote debugger (GDB) is currently connected to this target.
    fn debugger_attached(&self) -> bool;

    /// Fire the "target halted" event towards the debug session.
    fn notify_halted(&mut self) -> Result<(), TargetError>;
}
