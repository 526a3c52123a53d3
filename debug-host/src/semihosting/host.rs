//! Host resources used by the semihosting dispatcher.
//!
//! The dispatcher never touches files, process streams or the clock directly. It goes
//! through [`HostIo`], which [`NativeHost`] implements on top of the standard library.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

/// Host flags for a semihosting open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Truncate an existing file.
    pub truncate: bool,
    /// Writes always go to the end of the file.
    pub append: bool,
    /// Binary variant of the mode. Only meaningful on hosts that translate line endings.
    pub binary: bool,
}

impl OpenFlags {
    const fn new(read: bool, write: bool, create: bool, truncate: bool, append: bool) -> Self {
        Self {
            read,
            write,
            create,
            truncate,
            append,
            binary: false,
        }
    }

    const fn binary(self) -> Self {
        Self {
            binary: true,
            ..self
        }
    }

    /// The equivalent [`OpenOptions`].
    pub fn to_open_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write && !self.append)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate);
        options
    }
}

const RDONLY: OpenFlags = OpenFlags::new(true, false, false, false, false);
const RDWR: OpenFlags = OpenFlags::new(true, true, false, false, false);
const WRONLY_TRUNC: OpenFlags = OpenFlags::new(false, true, true, true, false);
const RDWR_TRUNC: OpenFlags = OpenFlags::new(true, true, true, true, false);
const WRONLY_APPEND: OpenFlags = OpenFlags::new(false, true, true, false, true);
const RDWR_APPEND: OpenFlags = OpenFlags::new(true, true, true, false, true);

/// Host flags for the semihosting open modes `0..=11`, i.e. the ISO C `fopen` modes
/// `r rb r+ r+b w wb w+ w+b a ab a+ a+b`.
pub const OPEN_MODE_FLAGS: [OpenFlags; 12] = [
    RDONLY,
    RDONLY.binary(),
    RDWR,
    RDWR.binary(),
    WRONLY_TRUNC,
    WRONLY_TRUNC.binary(),
    RDWR_TRUNC,
    RDWR_TRUNC.binary(),
    WRONLY_APPEND,
    WRONLY_APPEND.binary(),
    RDWR_APPEND,
    RDWR_APPEND.binary(),
];

/// One of the standard streams of the debug server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    /// Standard input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StdStream {
    /// The stream the special file name `:tt` refers to for an open mode.
    pub fn for_open_mode(mode: u32) -> Self {
        match mode {
            0..=3 => StdStream::Stdin,
            4..=7 => StdStream::Stdout,
            _ => StdStream::Stderr,
        }
    }

    /// The conventional descriptor number of the stream.
    pub fn fd(self) -> i32 {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }
}

/// Host side resources the semihosting dispatcher operates on.
///
/// Handles are small integers chosen by the implementation. `0`, `1` and `2` must refer
/// to the standard streams of the process. Errors carry an OS error code where one
/// exists; it is reported to the target as errno.
pub trait HostIo {
    /// Open a file.
    fn open(&mut self, path: &Path, flags: OpenFlags) -> io::Result<i32>;

    /// Create a new handle that refers to one of the standard streams.
    fn dup_stdio(&mut self, stream: StdStream) -> io::Result<i32>;

    /// Close a handle.
    fn close(&mut self, handle: i32) -> io::Result<()>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of file.
    fn read(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `data.len()` bytes, returning how many were written.
    fn write(&mut self, handle: i32, data: &[u8]) -> io::Result<usize>;

    /// Seek to an absolute position, returning the new position.
    fn seek(&mut self, handle: i32, position: u64) -> io::Result<u64>;

    /// Length of the file behind a handle, from its metadata.
    fn file_len(&mut self, handle: i32) -> io::Result<u64>;

    /// Whether a handle refers to an interactive terminal.
    fn is_tty(&mut self, handle: i32) -> io::Result<bool>;

    /// Remove a file.
    fn remove(&mut self, path: &Path) -> io::Result<()>;

    /// Rename a file.
    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()>;

    /// Run a shell command and return its exit status.
    fn system(&mut self, command: &str) -> io::Result<i32>;

    /// Write to the console of the debug server.
    fn console_write(&mut self, data: &[u8]);

    /// Read one byte from the console of the debug server. `None` on end of file.
    fn console_read(&mut self) -> Option<u8>;

    /// Seconds since the Unix epoch.
    fn time(&self) -> u64;

    /// Terminate the debug server process.
    fn exit(&mut self, code: i32);
}

/// The errno value to report for a host error.
pub(crate) fn errno_of(error: &io::Error) -> i64 {
    i64::from(error.raw_os_error().unwrap_or(libc::EIO))
}

pub(crate) fn bad_handle() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

#[derive(Debug)]
enum Handle {
    Stream(StdStream),
    File(File),
}

/// [`HostIo`] on top of the standard library.
#[derive(Debug)]
pub struct NativeHost {
    handles: HashMap<i32, Handle>,
    next_handle: i32,
}

impl Default for NativeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeHost {
    /// Create a host with only the standard streams open.
    pub fn new() -> Self {
        let handles = [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr]
            .into_iter()
            .map(|stream| (stream.fd(), Handle::Stream(stream)))
            .collect();

        Self {
            handles,
            next_handle: 3,
        }
    }

    fn insert(&mut self, handle: Handle) -> i32 {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, handle);
        id
    }

    fn get(&mut self, id: i32) -> io::Result<&mut Handle> {
        self.handles.get_mut(&id).ok_or_else(bad_handle)
    }
}

impl HostIo for NativeHost {
    fn open(&mut self, path: &Path, flags: OpenFlags) -> io::Result<i32> {
        let file = flags.to_open_options().open(path)?;
        Ok(self.insert(Handle::File(file)))
    }

    fn dup_stdio(&mut self, stream: StdStream) -> io::Result<i32> {
        Ok(self.insert(Handle::Stream(stream)))
    }

    fn close(&mut self, handle: i32) -> io::Result<()> {
        self.handles.remove(&handle).map(drop).ok_or_else(bad_handle)
    }

    fn read(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize> {
        match self.get(handle)? {
            Handle::Stream(StdStream::Stdin) => io::stdin().read(buf),
            Handle::Stream(_) => Err(bad_handle()),
            Handle::File(file) => file.read(buf),
        }
    }

    fn write(&mut self, handle: i32, data: &[u8]) -> io::Result<usize> {
        match self.get(handle)? {
            Handle::Stream(StdStream::Stdin) => Err(bad_handle()),
            Handle::Stream(StdStream::Stdout) => {
                let mut stdout = io::stdout();
                let written = stdout.write(data)?;
                stdout.flush()?;
                Ok(written)
            }
            Handle::Stream(StdStream::Stderr) => io::stderr().write(data),
            Handle::File(file) => file.write(data),
        }
    }

    fn seek(&mut self, handle: i32, position: u64) -> io::Result<u64> {
        match self.get(handle)? {
            Handle::Stream(_) => Err(io::Error::from_raw_os_error(libc::ESPIPE)),
            Handle::File(file) => file.seek(SeekFrom::Start(position)),
        }
    }

    fn file_len(&mut self, handle: i32) -> io::Result<u64> {
        match self.get(handle)? {
            Handle::Stream(_) => Ok(0),
            Handle::File(file) => Ok(file.metadata()?.len()),
        }
    }

    fn is_tty(&mut self, handle: i32) -> io::Result<bool> {
        Ok(match self.get(handle)? {
            Handle::Stream(StdStream::Stdin) => io::stdin().is_terminal(),
            Handle::Stream(StdStream::Stdout) => io::stdout().is_terminal(),
            Handle::Stream(StdStream::Stderr) => io::stderr().is_terminal(),
            Handle::File(file) => file.is_terminal(),
        })
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn system(&mut self, command: &str) -> io::Result<i32> {
        #[cfg(windows)]
        let status = std::process::Command::new("cmd")
            .args(["/C", command])
            .status()?;
        #[cfg(not(windows))]
        let status = std::process::Command::new("sh")
            .args(["-c", command])
            .status()?;

        Ok(status.code().unwrap_or(-1))
    }

    fn console_write(&mut self, data: &[u8]) {
        let mut stdout = io::stdout().lock();
        if let Err(error) = stdout.write_all(data).and_then(|_| stdout.flush()) {
            tracing::warn!("Failed to write semihosting console output: {error}");
        }
    }

    fn console_read(&mut self) -> Option<u8> {
        let mut byte = [0u8];
        match io::stdin().read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    fn time(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0)
    }

    fn exit(&mut self, code: i32) {
        std::process::exit(code)
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::{HostIo, NativeHost, StdStream, OPEN_MODE_FLAGS};

    #[test_case(0, true, false, false, false; "r")]
    #[test_case(2, true, true, false, false; "r plus")]
    #[test_case(4, false, true, true, false; "w")]
    #[test_case(6, true, true, true, false; "w plus")]
    #[test_case(8, false, true, false, true; "a")]
    #[test_case(10, true, true, false, true; "a plus")]
    fn open_mode_table(mode: usize, read: bool, write: bool, truncate: bool, append: bool) {
        for flags in [OPEN_MODE_FLAGS[mode], OPEN_MODE_FLAGS[mode + 1]] {
            assert_eq!(
                (flags.read, flags.write, flags.truncate, flags.append),
                (read, write, truncate, append)
            );
            assert_eq!(flags.create, write && mode >= 4);
        }
        assert!(!OPEN_MODE_FLAGS[mode].binary);
        assert!(OPEN_MODE_FLAGS[mode + 1].binary);
    }

    #[test_case(0, StdStream::Stdin)]
    #[test_case(3, StdStream::Stdin)]
    #[test_case(4, StdStream::Stdout)]
    #[test_case(7, StdStream::Stdout)]
    #[test_case(8, StdStream::Stderr)]
    #[test_case(11, StdStream::Stderr)]
    fn tt_stream_for_mode(mode: u32, stream: StdStream) {
        assert_eq!(StdStream::for_open_mode(mode), stream);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut host = NativeHost::new();

        let handle = host.open(&path, OPEN_MODE_FLAGS[4]).unwrap();
        assert!(handle > 2);
        assert_eq!(host.write(handle, b"hello world").unwrap(), 11);
        assert_eq!(host.file_len(handle).unwrap(), 11);
        assert_eq!(host.seek(handle, 6).unwrap(), 6);
        assert!(!host.is_tty(handle).unwrap());
        host.close(handle).unwrap();

        let handle = host.open(&path, OPEN_MODE_FLAGS[0]).unwrap();
        let mut buf = [0u8; 32];
        let read = host.read(handle, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"hello world");
        host.close(handle).unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn append_mode_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.txt");
        std::fs::write(&path, "abc").unwrap();
        let mut host = NativeHost::new();

        let handle = host.open(&path, OPEN_MODE_FLAGS[8]).unwrap();
        host.write(handle, b"def").unwrap();
        host.close(handle).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abcdef");
    }

    #[test]
    fn unknown_handles_are_ebadf() {
        let mut host = NativeHost::new();

        let error = host.close(42).unwrap_err();
        assert_eq!(error.raw_os_error(), Some(libc::EBADF));
        let error = host.write(0, b"x").unwrap_err();
        assert_eq!(error.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn missing_file_reports_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = NativeHost::new();

        let error = host
            .open(&dir.path().join("missing"), OPEN_MODE_FLAGS[0])
            .unwrap_err();

        assert_eq!(error.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn remove_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        std::fs::write(&from, "x").unwrap();
        let mut host = NativeHost::new();

        host.rename(&from, &to).unwrap();
        assert!(!from.exists());
        host.remove(&to).unwrap();
        assert!(!to.exists());
        assert!(host.remove(&to).is_err());
    }
}
