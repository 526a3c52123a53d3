use super::fields::ParameterBlock;
use super::operation::SysCall;
use crate::target::{Target, TargetError, WordSize};

/// A decoded semihosting call.
///
/// Addresses and lengths refer to target memory. Handles are the values the target
/// passed, which are only meaningful to the host that handed them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `SYS_OPEN`
    Open {
        /// Address of the file name.
        path: u64,
        /// Length of the file name, without NUL.
        len: usize,
        /// Index into the open mode table.
        mode: u32,
    },
    /// `SYS_CLOSE`
    Close {
        /// Handle to close.
        handle: i32,
    },
    /// `SYS_WRITEC`
    WriteC {
        /// Address of the character.
        address: u64,
    },
    /// `SYS_WRITE0`
    Write0 {
        /// Address of the NUL terminated string.
        address: u64,
    },
    /// `SYS_WRITE`
    Write {
        /// Handle to write to.
        handle: i32,
        /// Address of the data.
        buffer: u64,
        /// Number of bytes to write.
        len: usize,
    },
    /// `SYS_READ`
    Read {
        /// Handle to read from.
        handle: i32,
        /// Address of the destination buffer.
        buffer: u64,
        /// Number of bytes to read.
        len: usize,
    },
    /// `SYS_READC`
    ReadC,
    /// `SYS_ISERROR`
    IsError {
        /// The status word to inspect.
        status: u64,
    },
    /// `SYS_ISTTY`
    IsTty {
        /// Handle to inspect.
        handle: i32,
    },
    /// `SYS_SEEK`
    Seek {
        /// Handle to seek in.
        handle: i32,
        /// Absolute position.
        position: u64,
    },
    /// `SYS_FLEN`
    FileLength {
        /// Handle to inspect.
        handle: i32,
    },
    /// `SYS_REMOVE`
    Remove {
        /// Address of the file name.
        path: u64,
        /// Length of the file name, without NUL.
        len: usize,
    },
    /// `SYS_RENAME`
    Rename {
        /// Address of the current name.
        from: u64,
        /// Length of the current name.
        from_len: usize,
        /// Address of the new name.
        to: u64,
        /// Length of the new name.
        to_len: usize,
    },
    /// `SYS_CLOCK`
    Clock,
    /// `SYS_TIME`
    Time,
    /// `SYS_SYSTEM`
    System {
        /// Address of the command.
        command: u64,
        /// Length of the command, without NUL.
        len: usize,
    },
    /// `SYS_ERRNO`
    Errno,
    /// `SYS_GET_CMDLINE`
    GetCmdline {
        /// Address of the destination buffer.
        buffer: u64,
        /// Size of the destination buffer.
        len: usize,
    },
    /// `SYS_HEAPINFO`
    HeapInfo {
        /// Address of the four word block receiving the heap and stack bounds.
        block: u64,
    },
    /// `SYS_EXIT` and `SYS_EXIT_EXTENDED`
    Exit {
        /// The `ADP_Stopped_*` reason.
        reason: u64,
        /// Exit status or subcode. Not available for `SYS_EXIT` on 32-bit targets.
        subcode: Option<u64>,
        /// Whether this was `SYS_EXIT_EXTENDED`.
        extended: bool,
    },
    /// A call that is known but not serviced.
    Unsupported(SysCall),
}

impl Request {
    /// Decode a call from its parameter and the fields read according to its layout.
    pub fn decode(call: SysCall, param: u64, fields: &ParameterBlock, word_size: WordSize) -> Self {
        let handle = || fields.get(0) as i32;
        let len = |index| fields.get(index) as usize;

        match call {
            SysCall::Open => Request::Open {
                path: fields.get(0),
                mode: fields.get(1) as u32,
                len: len(2),
            },
            SysCall::Close => Request::Close { handle: handle() },
            SysCall::WriteC => Request::WriteC { address: param },
            SysCall::Write0 => Request::Write0 { address: param },
            SysCall::Write => Request::Write {
                handle: handle(),
                buffer: fields.get(1),
                len: len(2),
            },
            SysCall::Read => Request::Read {
                handle: handle(),
                buffer: fields.get(1),
                len: len(2),
            },
            SysCall::ReadC => Request::ReadC,
            SysCall::IsError => Request::IsError {
                status: fields.get(0),
            },
            SysCall::IsTty => Request::IsTty { handle: handle() },
            SysCall::Seek => Request::Seek {
                handle: handle(),
                position: fields.get(1),
            },
            SysCall::FileLength => Request::FileLength { handle: handle() },
            SysCall::Remove => Request::Remove {
                path: fields.get(0),
                len: len(1),
            },
            SysCall::Rename => Request::Rename {
                from: fields.get(0),
                from_len: len(1),
                to: fields.get(2),
                to_len: len(3),
            },
            SysCall::Clock => Request::Clock,
            SysCall::Time => Request::Time,
            SysCall::System => Request::System {
                command: fields.get(0),
                len: len(1),
            },
            SysCall::Errno => Request::Errno,
            SysCall::GetCmdline => Request::GetCmdline {
                buffer: fields.get(0),
                len: len(1),
            },
            SysCall::HeapInfo => Request::HeapInfo {
                block: fields.get(0),
            },
            // On 32-bit targets the reason is passed in the parameter register itself.
            SysCall::Exit if word_size == WordSize::U32 => Request::Exit {
                reason: param,
                subcode: None,
                extended: false,
            },
            SysCall::Exit | SysCall::ExitExtended => Request::Exit {
                reason: fields.get(0),
                subcode: Some(fields.get(1)),
                extended: call == SysCall::ExitExtended,
            },
            SysCall::TmpName | SysCall::Elapsed | SysCall::TickFreq => Request::Unsupported(call),
        }
    }
}

/// Longest file name or command read from the target.
pub const MAX_STRING_LEN: usize = 4096;

/// Read a string of `len` bytes from the target.
///
/// Callers bound `len` by [`MAX_STRING_LEN`].
pub(crate) fn read_string(
    target: &mut dyn Target,
    address: u64,
    len: usize,
) -> Result<String, TargetError> {
    let mut bytes = vec![0; len];
    if len > 0 {
        target.read_buffer(address, &mut bytes)?;
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Read a NUL terminated string from the target, one byte at a time.
pub(crate) fn read_c_string(target: &mut dyn Target, address: u64) -> Result<Vec<u8>, TargetError> {
    let mut bytes = Vec::new();
    let mut byte = [0u8];
    loop {
        target.read_buffer(address + bytes.len() as u64, &mut byte)?;
        if byte[0] == 0 {
            return Ok(bytes);
        }
        bytes.push(byte[0]);
    }
}
