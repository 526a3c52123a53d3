//! Semihosting operation numbers.
//!
//! See <https://github.com/ARM-software/abi-aa/blob/main/semihosting/semihosting.rst#semihosting-operations>.

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::target::WordSize;

/// Reason code for a normal application exit.
pub const ADP_STOPPED_APPLICATION_EXIT: u64 = 0x20026;
/// Reason code for an application run time error.
pub const ADP_STOPPED_RUN_TIME_ERROR: u64 = 0x20023;

/// First operation of the user command range.
pub const USER_CMD_FIRST: u64 = 0x100;
/// Last operation of the user command range.
pub const USER_CMD_LAST: u64 = 0x1ff;
/// Number of user commands that are actually serviced, starting at [`USER_CMD_FIRST`].
pub const USER_CMD_SERVICED: u16 = 8;

/// The fixed semihosting calls defined by ARM.
#[derive(Primitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysCall {
    /// `SYS_OPEN`
    Open = 0x01,
    /// `SYS_CLOSE`
    Close = 0x02,
    /// `SYS_WRITEC`
    WriteC = 0x03,
    /// `SYS_WRITE0`
    Write0 = 0x04,
    /// `SYS_WRITE`
    Write = 0x05,
    /// `SYS_READ`
    Read = 0x06,
    /// `SYS_READC`
    ReadC = 0x07,
    /// `SYS_ISERROR`
    IsError = 0x08,
    /// `SYS_ISTTY`
    IsTty = 0x09,
    /// `SYS_SEEK`
    Seek = 0x0a,
    /// `SYS_FLEN`
    FileLength = 0x0c,
    /// `SYS_TMPNAM`
    TmpName = 0x0d,
    /// `SYS_REMOVE`
    Remove = 0x0e,
    /// `SYS_RENAME`
    Rename = 0x0f,
    /// `SYS_CLOCK`
    Clock = 0x10,
    /// `SYS_TIME`
    Time = 0x11,
    /// `SYS_SYSTEM`
    System = 0x12,
    /// `SYS_ERRNO`
    Errno = 0x13,
    /// `SYS_GET_CMDLINE`
    GetCmdline = 0x15,
    /// `SYS_HEAPINFO`
    HeapInfo = 0x16,
    /// `SYS_EXIT`
    Exit = 0x18,
    /// `SYS_EXIT_EXTENDED`
    ExitExtended = 0x20,
    /// `SYS_ELAPSED`
    Elapsed = 0x30,
    /// `SYS_TICKFREQ`
    TickFreq = 0x31,
}

/// How a call uses its parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLayout {
    /// Number of fields read from the parameter block before the call is executed.
    pub fields: usize,
    /// Whether the call can be forwarded to a GDB client in fileio mode.
    pub fileio: bool,
}

const fn layout(fields: usize, fileio: bool) -> CallLayout {
    CallLayout { fields, fileio }
}

impl SysCall {
    /// Name of the call as it appears in the ARM documentation.
    pub fn name(self) -> &'static str {
        match self {
            SysCall::Open => "SYS_OPEN",
            SysCall::Close => "SYS_CLOSE",
            SysCall::WriteC => "SYS_WRITEC",
            SysCall::Write0 => "SYS_WRITE0",
            SysCall::Write => "SYS_WRITE",
            SysCall::Read => "SYS_READ",
            SysCall::ReadC => "SYS_READC",
            SysCall::IsError => "SYS_ISERROR",
            SysCall::IsTty => "SYS_ISTTY",
            SysCall::Seek => "SYS_SEEK",
            SysCall::FileLength => "SYS_FLEN",
            SysCall::TmpName => "SYS_TMPNAM",
            SysCall::Remove => "SYS_REMOVE",
            SysCall::Rename => "SYS_RENAME",
            SysCall::Clock => "SYS_CLOCK",
            SysCall::Time => "SYS_TIME",
            SysCall::System => "SYS_SYSTEM",
            SysCall::Errno => "SYS_ERRNO",
            SysCall::GetCmdline => "SYS_GET_CMDLINE",
            SysCall::HeapInfo => "SYS_HEAPINFO",
            SysCall::Exit => "SYS_EXIT",
            SysCall::ExitExtended => "SYS_EXIT_EXTENDED",
            SysCall::Elapsed => "SYS_ELAPSED",
            SysCall::TickFreq => "SYS_TICKFREQ",
        }
    }

    /// The parameter block layout of the call on a target with the given word size.
    pub fn layout(self, word_size: WordSize) -> CallLayout {
        match self {
            SysCall::Open => layout(3, true),
            SysCall::Close => layout(1, true),
            // The parameter is the character (or string) address itself.
            SysCall::WriteC | SysCall::Write0 => layout(0, true),
            SysCall::Write | SysCall::Read => layout(3, true),
            SysCall::ReadC => layout(0, false),
            SysCall::IsError => layout(1, false),
            SysCall::IsTty => layout(1, true),
            SysCall::Seek => layout(2, true),
            SysCall::FileLength => layout(1, false),
            SysCall::Remove => layout(2, true),
            SysCall::Rename => layout(4, true),
            SysCall::System => layout(2, true),
            SysCall::GetCmdline => layout(2, false),
            SysCall::HeapInfo => layout(1, false),
            SysCall::Exit => match word_size {
                WordSize::U32 => layout(0, false),
                WordSize::U64 => layout(2, false),
            },
            SysCall::ExitExtended => layout(2, false),
            SysCall::Clock
            | SysCall::Time
            | SysCall::Errno
            | SysCall::TmpName
            | SysCall::Elapsed
            | SysCall::TickFreq => layout(0, false),
        }
    }
}

/// A semihosting operation number, as latched from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// One of the fixed calls.
    Sys(SysCall),
    /// A user command, `0x100..=0x1ff`.
    User(u16),
    /// An operation in the range `0x32..=0xff` reserved by ARM.
    ArmReserved(u64),
    /// Anything else.
    Unknown(u64),
}

impl Operation {
    /// The raw operation number.
    pub fn code(&self) -> u64 {
        match *self {
            Operation::Sys(call) => call as u64,
            Operation::User(code) => u64::from(code),
            Operation::ArmReserved(code) | Operation::Unknown(code) => code,
        }
    }

    /// Human readable name, used in log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Sys(call) => call.name(),
            Operation::User(_) => "USER_CMD",
            Operation::ArmReserved(_) => "ARM_RESERVED",
            Operation::Unknown(_) => "UNKNOWN",
        }
    }

    /// The operation number, if this is one of the serviced user commands.
    pub fn user_command(&self) -> Option<u16> {
        match *self {
            Operation::User(code) if code - (USER_CMD_FIRST as u16) < USER_CMD_SERVICED => {
                Some(code)
            }
            _ => None,
        }
    }
}

impl From<u64> for Operation {
    fn from(code: u64) -> Self {
        if let Some(call) = SysCall::from_u64(code) {
            Operation::Sys(call)
        } else if (USER_CMD_FIRST..=USER_CMD_LAST).contains(&code) {
            Operation::User(code as u16)
        } else if (0x32..=0xff).contains(&code) {
            Operation::ArmReserved(code)
        } else {
            Operation::Unknown(code)
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x} ({})", self.code(), self.name())
    }
}
