//! Forwarding of semihosting file operations to a GDB client.
//!
//! In fileio mode the dispatcher does not touch host files. It stages a [`FileIoRequest`],
//! which the GDB server turns into a File-I/O `F` packet. GDB's reply is fed back through
//! [`Semihosting::complete_deferred`].

use std::fmt;
use std::str::FromStr;

use super::{Operation, Semihosting, SysCall};
use crate::error::Error;
use crate::target::Target;

/// Open flags as defined by the GDB remote protocol.
pub mod gdb_flags {
    /// Open for reading only.
    pub const O_RDONLY: u32 = 0x0;
    /// Open for writing only.
    pub const O_WRONLY: u32 = 0x1;
    /// Open for reading and writing.
    pub const O_RDWR: u32 = 0x2;
    /// Writes append to the end of the file.
    pub const O_APPEND: u32 = 0x8;
    /// Create the file if it does not exist.
    pub const O_CREAT: u32 = 0x200;
    /// Truncate an existing file.
    pub const O_TRUNC: u32 = 0x400;
}

use gdb_flags::{O_APPEND, O_CREAT, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};

/// GDB open flags for the semihosting open modes `0..=11`.
pub const GDB_OPEN_FLAGS: [u32; 12] = [
    O_RDONLY,
    O_RDONLY,
    O_RDWR,
    O_RDWR,
    O_WRONLY | O_CREAT | O_TRUNC,
    O_WRONLY | O_CREAT | O_TRUNC,
    O_RDWR | O_CREAT | O_TRUNC,
    O_RDWR | O_CREAT | O_TRUNC,
    O_WRONLY | O_CREAT | O_APPEND,
    O_WRONLY | O_CREAT | O_APPEND,
    O_RDWR | O_CREAT | O_APPEND,
    O_RDWR | O_CREAT | O_APPEND,
];

/// Files created by GDB are always `rw-r--r--`.
pub const GDB_OPEN_MODE: u64 = 0o644;

/// `SEEK_SET` in the GDB remote protocol.
pub const GDB_SEEK_SET: u64 = 0;

/// The GDB File-I/O functions semihosting calls map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIoOp {
    /// `open(pathptr/len, flags, mode)`
    Open,
    /// `close(fd)`
    Close,
    /// `read(fd, bufptr, count)`
    Read,
    /// `write(fd, bufptr, count)`
    Write,
    /// `lseek(fd, offset, flag)`
    Lseek,
    /// `unlink(pathptr/len)`
    Unlink,
    /// `rename(oldpathptr/len, newpathptr/len)`
    Rename,
    /// `system(commandptr/len)`
    System,
    /// `isatty(fd)`
    Isatty,
}

impl FileIoOp {
    /// The function name used in the `F` packet.
    pub fn identifier(self) -> &'static str {
        match self {
            FileIoOp::Open => "open",
            FileIoOp::Close => "close",
            FileIoOp::Read => "read",
            FileIoOp::Write => "write",
            FileIoOp::Lseek => "lseek",
            FileIoOp::Unlink => "unlink",
            FileIoOp::Rename => "rename",
            FileIoOp::System => "system",
            FileIoOp::Isatty => "isatty",
        }
    }
}

/// A staged file operation, waiting for GDB to carry it out.
///
/// String arguments are given as target address and length without the terminating NUL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIoRequest {
    /// The function to call.
    pub op: FileIoOp,
    /// Up to four arguments; unused ones are zero.
    pub params: [u64; 4],
}

impl FileIoRequest {
    pub(crate) fn new(op: FileIoOp, params: &[u64]) -> Self {
        let mut all = [0; 4];
        all[..params.len()].copy_from_slice(params);
        Self { op, params: all }
    }

    /// The body of the GDB `F` request packet for this operation.
    ///
    /// Strings are passed as `pointer/length`, where the length counts the trailing NUL.
    pub fn to_gdb_packet(&self) -> String {
        let [p1, p2, p3, p4] = self.params;
        let id = self.op.identifier();
        match self.op {
            FileIoOp::Open => format!("F{id},{p1:x}/{:x},{p3:x},{p4:x}", p2 + 1),
            FileIoOp::Close | FileIoOp::Isatty => format!("F{id},{p1:x}"),
            FileIoOp::Read | FileIoOp::Write | FileIoOp::Lseek => {
                format!("F{id},{p1:x},{p2:x},{p3:x}")
            }
            FileIoOp::Unlink | FileIoOp::System => format!("F{id},{p1:x}/{:x}", p2 + 1),
            FileIoOp::Rename => format!("F{id},{p1:x}/{:x},{p3:x}/{:x}", p2 + 1, p4 + 1),
        }
    }
}

impl fmt::Display for FileIoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_gdb_packet())
    }
}

/// GDB's answer to a File-I/O request: `F<result>[,<errno>[,C]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIoReply {
    /// Return value of the call.
    pub result: i64,
    /// errno reported by GDB, 0 if none was sent.
    pub errno: i64,
    /// The user interrupted the call with Ctrl-C.
    pub interrupted: bool,
}

/// Malformed File-I/O reply: {0}
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct FileIoReplyError(String);

fn parse_hex(field: &str, reply: &str) -> Result<i64, FileIoReplyError> {
    i64::from_str_radix(field, 16).map_err(|_| FileIoReplyError(reply.to_string()))
}

impl FromStr for FileIoReply {
    type Err = FileIoReplyError;

    fn from_str(reply: &str) -> Result<Self, Self::Err> {
        let malformed = || FileIoReplyError(reply.to_string());

        let body = reply.strip_prefix('F').ok_or_else(malformed)?;
        // Drop an attachment, if any.
        let body = body.split_once(';').map_or(body, |(fields, _)| fields);

        let mut fields = body.split(',');
        let result = parse_hex(fields.next().ok_or_else(malformed)?, reply)?;
        let errno = match fields.next() {
            Some(errno) => parse_hex(errno, reply)?,
            None => 0,
        };
        let interrupted = match fields.next() {
            Some("C") => true,
            Some(_) => return Err(malformed()),
            None => false,
        };
        if fields.next().is_some() {
            return Err(malformed());
        }

        Ok(Self {
            result,
            errno,
            interrupted,
        })
    }
}

impl Semihosting {
    /// The staged file operation, if the last dispatched call was forwarded to GDB.
    pub fn pending_fileio(&self) -> Option<&FileIoRequest> {
        self.pending.as_ref()
    }

    pub(crate) fn stage(&mut self, op: FileIoOp, params: &[u64]) {
        let request = FileIoRequest::new(op, params);
        tracing::debug!("Staging fileio request {request}");
        self.pending = Some(request);
    }

    /// Finish a call that was forwarded to GDB and post its result to the target.
    ///
    /// `result` and `host_errno` are the values GDB returned for the staged request.
    pub fn complete_deferred(
        &mut self,
        target: &mut dyn Target,
        result: i64,
        host_errno: i64,
        interrupted: bool,
    ) -> Result<(), Error> {
        let request = self.pending.take().ok_or(Error::NoPendingFileIo)?;

        if interrupted {
            tracing::info!("Fileio request {request} was interrupted by the user");
        }

        let requested = request.params[2] as i64;
        self.result = match self.operation {
            Operation::Sys(SysCall::Read | SysCall::Write) if result < 0 => requested,
            Operation::Sys(SysCall::Read | SysCall::Write) => requested - result,
            Operation::Sys(SysCall::Seek) if result > 0 => 0,
            _ => result,
        };

        let failed = match self.operation {
            Operation::Sys(SysCall::IsTty) => result == 0,
            Operation::Sys(SysCall::Rename) => result != 0,
            _ => result == -1,
        };
        if failed {
            self.errno = host_errno;
        }

        tracing::debug!(
            "Fileio {} completed: result={}, errno={}",
            request.op.identifier(),
            self.result,
            host_errno
        );

        self.post_result(target)
    }

    /// Feed a raw GDB File-I/O reply packet to [`Semihosting::complete_deferred`].
    pub fn complete_deferred_packet(
        &mut self,
        target: &mut dyn Target,
        reply: &str,
    ) -> Result<(), Error> {
        let reply: FileIoReply = reply.parse().map_err(anyhow::Error::from)?;
        self.complete_deferred(target, reply.result, reply.errno, reply.interrupted)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::{FileIoOp, FileIoReply, FileIoRequest, GDB_OPEN_FLAGS};

    #[test_case(FileIoOp::Open, &[0x2000_0000, 7, 0x601, 0o644], "Fopen,20000000/8,601,1a4")]
    #[test_case(FileIoOp::Close, &[5], "Fclose,5")]
    #[test_case(FileIoOp::Read, &[3, 0x2000_0100, 64], "Fread,3,20000100,40")]
    #[test_case(FileIoOp::Write, &[1, 0x2000_0100, 1], "Fwrite,1,20000100,1")]
    #[test_case(FileIoOp::Lseek, &[3, 0x10, 0], "Flseek,3,10,0")]
    #[test_case(FileIoOp::Unlink, &[0x2000_0000, 4], "Funlink,20000000/5")]
    #[test_case(FileIoOp::Rename, &[0x100, 1, 0x200, 2], "Frename,100/2,200/3")]
    #[test_case(FileIoOp::System, &[0x100, 2], "Fsystem,100/3")]
    #[test_case(FileIoOp::Isatty, &[2], "Fisatty,2")]
    fn gdb_packet(op: FileIoOp, params: &[u64], expected: &str) {
        assert_eq!(FileIoRequest::new(op, params).to_gdb_packet(), expected);
    }

    #[test_case("F0", 0, 0, false)]
    #[test_case("F1f", 0x1f, 0, false)]
    #[test_case("F-1,2", -1, 2, false)]
    #[test_case("F-1,4,C", -1, 4, true)]
    #[test_case("F10;attachment", 0x10, 0, false)]
    fn parse_reply(packet: &str, result: i64, errno: i64, interrupted: bool) {
        assert_eq!(
            packet.parse::<FileIoReply>().unwrap(),
            FileIoReply {
                result,
                errno,
                interrupted
            }
        );
    }

    #[test_case("0"; "missing prefix")]
    #[test_case("F"; "missing result")]
    #[test_case("Fzz"; "not hex")]
    #[test_case("F0,0,X"; "bad flag")]
    #[test_case("F0,0,C,1"; "trailing field")]
    fn reject_malformed_reply(packet: &str) {
        assert!(packet.parse::<FileIoReply>().is_err());
    }

    #[test]
    fn open_flags_follow_gdb_protocol() {
        assert_eq!(GDB_OPEN_FLAGS[0], 0);
        assert_eq!(GDB_OPEN_FLAGS[3], 0x2);
        assert_eq!(GDB_OPEN_FLAGS[4], 0x601);
        assert_eq!(GDB_OPEN_FLAGS[7], 0x602);
        assert_eq!(GDB_OPEN_FLAGS[9], 0x209);
        assert_eq!(GDB_OPEN_FLAGS[11], 0x20a);
    }
}
