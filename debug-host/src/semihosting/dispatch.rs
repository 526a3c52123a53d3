use std::io;
use std::path::{Component, PathBuf};

use super::fields::ParameterBlock;
use super::fileio::{FileIoOp, GDB_OPEN_FLAGS, GDB_OPEN_MODE, GDB_SEEK_SET};
use super::host::{bad_handle, errno_of, StdStream, OPEN_MODE_FLAGS};
use super::operation::{ADP_STOPPED_APPLICATION_EXIT, ADP_STOPPED_RUN_TIME_ERROR};
use super::redirect::StreamClass;
use super::request::{read_c_string, read_string, Request, MAX_STRING_LEN};
use super::{Operation, Semihosting, UserCommand, MAX_USER_COMMAND_PARAM_LEN};
use crate::error::Error;
use crate::target::Target;

/// What happens after a call was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Post the result, unless the call was staged for GDB.
    Post,
    /// The target stays halted; no result is posted.
    Halt,
}

fn buffer(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

impl Semihosting {
    /// Service the latched semihosting call.
    ///
    /// Host failures are reported to the target through the result and errno. An `Err`
    /// means the call could not be completed at all, e.g. because target memory could
    /// not be accessed.
    ///
    /// The caller must not dispatch a new call while a fileio request is pending.
    pub fn dispatch_pending_call(&mut self, target: &mut dyn Target) -> Result<(), Error> {
        debug_assert!(
            self.pending.is_none(),
            "semihosting call dispatched while a fileio request is pending"
        );

        self.result = -1;
        self.resumable = true;
        self.word_size = target.word_size();

        tracing::debug!("op={}, param={:#x}", self.operation, self.param);

        let flow = match self.operation {
            Operation::Sys(call) => {
                let layout = call.layout(self.word_size);
                let fields = if layout.fields > 0 {
                    ParameterBlock::read(target, self.param, layout.fields)?
                } else {
                    ParameterBlock::new(self.param, self.word_size, target.endianness())
                };
                let request = Request::decode(call, self.param, &fields, self.word_size);
                let stage = self.fileio && layout.fileio;
                self.execute(target, request, fields, stage)?
            }
            operation if operation.user_command().is_some() => self.user_command(target)?,
            operation => {
                tracing::warn!("Unsupported semihosting call {operation}");
                self.fail(libc::ENOTSUP);
                Flow::Post
            }
        };

        match flow {
            Flow::Halt => Ok(target.notify_halted()?),
            Flow::Post if self.pending.is_some() => Ok(()),
            Flow::Post => self.post_result(target),
        }
    }

    fn fail(&mut self, errno: i32) {
        self.result = -1;
        self.errno = i64::from(errno);
    }

    fn fail_with(&mut self, error: &io::Error) {
        self.result = -1;
        self.errno = errno_of(error);
    }

    fn execute(
        &mut self,
        target: &mut dyn Target,
        request: Request,
        mut fields: ParameterBlock,
        stage: bool,
    ) -> Result<Flow, Error> {
        match request {
            Request::Open { path, len, mode } => {
                if mode as usize >= OPEN_MODE_FLAGS.len() {
                    self.fail(libc::EINVAL);
                    return Ok(Flow::Post);
                }
                let Some(name) = self.read_name(target, path, len)? else {
                    return Ok(Flow::Post);
                };
                self.open(&name, path, len, mode, stage);
            }
            Request::Close { handle } => {
                if (0..=2).contains(&handle) {
                    tracing::debug!("Ignoring close of standard stream {handle}");
                    self.result = 0;
                } else if stage {
                    self.stage(FileIoOp::Close, &[handle as u64]);
                } else {
                    match self.host.close(handle) {
                        Ok(()) => self.result = 0,
                        Err(error) => self.fail_with(&error),
                    }
                    tracing::debug!("close({handle})={}", self.result);
                }
            }
            Request::WriteC { address } => {
                if stage {
                    self.stage(FileIoOp::Write, &[1, address, 1]);
                } else {
                    let mut byte = [0u8];
                    target.read_buffer(address, &mut byte)?;
                    self.console_write(&byte);
                    self.result = 0;
                }
            }
            Request::Write0 { address } => {
                let text = read_c_string(target, address)?;
                if stage {
                    self.stage(FileIoOp::Write, &[1, address, text.len() as u64]);
                } else {
                    self.console_write(&text);
                    self.result = 0;
                }
            }
            Request::Write {
                handle,
                buffer: address,
                len,
            } => {
                if stage {
                    self.stage(FileIoOp::Write, &[handle as u64, address, len as u64]);
                } else if let Some(mut data) = buffer(len) {
                    target.read_buffer(address, &mut data)?;
                    self.result = match self.write(handle, &data) {
                        Ok(written) => (len - written.min(len)) as i64,
                        Err(error) => {
                            self.errno = errno_of(&error);
                            len as i64
                        }
                    };
                    tracing::debug!("write({handle}, {address:#x}, {len})={}", self.result);
                } else {
                    self.fail(libc::ENOMEM);
                }
            }
            Request::Read {
                handle,
                buffer: address,
                len,
            } => {
                if stage {
                    self.stage(FileIoOp::Read, &[handle as u64, address, len as u64]);
                } else if let Some(mut data) = buffer(len) {
                    self.result = match self.read(handle, &mut data) {
                        Ok(read) => {
                            let read = read.min(len);
                            if read > 0 {
                                target.write_buffer(address, &data[..read])?;
                            }
                            (len - read) as i64
                        }
                        Err(error) => {
                            self.errno = errno_of(&error);
                            len as i64
                        }
                    };
                    tracing::debug!("read({handle}, {address:#x}, {len})={}", self.result);
                } else {
                    self.fail(libc::ENOMEM);
                }
            }
            Request::ReadC => {
                if self.fileio {
                    tracing::error!("SYS_READC is not supported in fileio mode");
                    return Err(Error::FileIoUnsupported(self.operation));
                }
                self.result = self.console_read();
                tracing::debug!("getchar()={}", self.result);
            }
            Request::IsError { status } => {
                self.result = i64::from(status != 0);
            }
            Request::IsTty { handle } => {
                if stage {
                    self.stage(FileIoOp::Isatty, &[handle as u64]);
                } else {
                    match self.host.is_tty(handle) {
                        Ok(true) => self.result = 1,
                        Ok(false) => {
                            self.result = 0;
                            self.errno = i64::from(libc::ENOTTY);
                        }
                        Err(error) => {
                            self.result = 0;
                            self.errno = errno_of(&error);
                        }
                    }
                    tracing::debug!("isatty({handle})={}", self.result);
                }
            }
            Request::Seek { handle, position } => {
                if stage {
                    self.stage(FileIoOp::Lseek, &[handle as u64, position, GDB_SEEK_SET]);
                } else {
                    match self.host.seek(handle, position) {
                        Ok(offset) if offset == position => self.result = 0,
                        Ok(offset) => self.result = offset as i64,
                        Err(error) => self.fail_with(&error),
                    }
                    tracing::debug!("lseek({handle}, {position})={}", self.result);
                }
            }
            Request::FileLength { handle } => {
                if self.fileio {
                    // GDB offers no fstat through File-I/O semihosting.
                    self.fail(libc::EINVAL);
                } else {
                    match self.host.file_len(handle) {
                        Ok(len) => self.result = len as i64,
                        Err(error) => self.fail_with(&error),
                    }
                    tracing::debug!("flen({handle})={}", self.result);
                }
            }
            Request::Remove { path, len } => {
                if stage {
                    self.stage(FileIoOp::Unlink, &[path, len as u64]);
                } else {
                    let Some(name) = self.read_name(target, path, len)? else {
                        return Ok(Flow::Post);
                    };
                    match self.resolve_path(&name) {
                        Ok(resolved) => match self.host.remove(&resolved) {
                            Ok(()) => self.result = 0,
                            Err(error) => self.fail_with(&error),
                        },
                        Err(errno) => self.fail(errno),
                    }
                    tracing::debug!("remove('{name}')={}", self.result);
                }
            }
            Request::Rename {
                from,
                from_len,
                to,
                to_len,
            } => {
                if stage {
                    self.stage(
                        FileIoOp::Rename,
                        &[from, from_len as u64, to, to_len as u64],
                    );
                } else {
                    let Some(old) = self.read_name(target, from, from_len)? else {
                        return Ok(Flow::Post);
                    };
                    let Some(new) = self.read_name(target, to, to_len)? else {
                        return Ok(Flow::Post);
                    };
                    let resolved = self
                        .resolve_path(&old)
                        .and_then(|old| Ok((old, self.resolve_path(&new)?)));
                    match resolved {
                        Ok((old, new)) => match self.host.rename(&old, &new) {
                            Ok(()) => self.result = 0,
                            Err(error) => self.fail_with(&error),
                        },
                        Err(errno) => self.fail(errno),
                    }
                    tracing::debug!("rename('{old}', '{new}')={}", self.result);
                }
            }
            Request::Clock => {
                let elapsed = self.setup_time.elapsed();
                self.result = (elapsed.as_millis() / 10) as i64;
            }
            Request::Time => {
                self.result = self.host.time() as i64;
            }
            Request::System { command, len } => {
                if stage {
                    self.stage(FileIoOp::System, &[command, len as u64]);
                } else {
                    let Some(command) = self.read_name(target, command, len)? else {
                        return Ok(Flow::Post);
                    };
                    match self.host.system(&command) {
                        Ok(status) => self.result = i64::from(status),
                        Err(error) => self.fail_with(&error),
                    }
                    tracing::debug!("system('{command}')={}", self.result);
                }
            }
            Request::Errno => {
                self.result = self.errno;
            }
            Request::GetCmdline {
                buffer: address,
                len,
            } => {
                let mut cmdline = self.cmdline.clone().into_bytes();
                cmdline.push(0);
                if cmdline.len() > len {
                    tracing::debug!(
                        "Command line '{}' does not fit into {len} bytes",
                        self.cmdline
                    );
                    self.result = -1;
                } else {
                    target.write_buffer(address, &cmdline)?;
                    fields.set(1, cmdline.len() as u64);
                    fields.store(target, 2)?;
                    self.result = 0;
                }
            }
            Request::HeapInfo { block } => {
                // The heap is unknown to us: report zero for all four bounds.
                let zeros = vec![0u8; 4 * self.word_size.bytes()];
                target.write_memory(block, 4, zeros.len() / 4, &zeros)?;
                self.result = 0;
            }
            Request::Exit {
                reason,
                subcode,
                extended: _,
            } => return Ok(self.exit(target, reason, subcode)),
            Request::Unsupported(call) => {
                tracing::warn!("Semihosting call {} is not supported", call.name());
                self.fail(libc::ENOTSUP);
            }
        }

        Ok(Flow::Post)
    }

    fn open(&mut self, name: &str, path: u64, len: usize, mode: u32, stage: bool) {
        let mode_index = mode as usize;
        match name {
            ":semihosting-features" => {
                tracing::warn!("The semihosting feature file is not supported");
                self.fail(libc::EINVAL);
            }
            ":tt" if stage => match mode {
                0 => self.result = 0,
                4 => self.result = 1,
                8 => self.result = 2,
                _ => self.fail(libc::EINVAL),
            },
            ":tt" => {
                let stream = StdStream::for_open_mode(mode);
                match self.host.dup_stdio(stream) {
                    Ok(handle) => {
                        match stream {
                            StdStream::Stdin => self.stdin_fd = handle,
                            StdStream::Stdout => self.stdout_fd = handle,
                            StdStream::Stderr => self.stderr_fd = handle,
                        }
                        self.result = i64::from(handle);
                    }
                    Err(error) => self.fail_with(&error),
                }
                tracing::debug!("dup({stream:?})={}", self.result);
            }
            _ if stage => self.stage(
                FileIoOp::Open,
                &[
                    path,
                    len as u64,
                    u64::from(GDB_OPEN_FLAGS[mode_index]),
                    GDB_OPEN_MODE,
                ],
            ),
            _ => {
                match self.resolve_path(name) {
                    Ok(resolved) => match self.host.open(&resolved, OPEN_MODE_FLAGS[mode_index]) {
                        Ok(handle) => self.result = i64::from(handle),
                        Err(error) => self.fail_with(&error),
                    },
                    Err(errno) => self.fail(errno),
                }
                tracing::debug!("open('{name}', {mode})={}", self.result);
            }
        }
    }

    /// Read a file name or command, failing the call with `ENAMETOOLONG` if it is too long.
    fn read_name(
        &mut self,
        target: &mut dyn Target,
        address: u64,
        len: usize,
    ) -> Result<Option<String>, Error> {
        if len > MAX_STRING_LEN {
            tracing::warn!("{}: name of {len} bytes is too long", self.operation);
            self.fail(libc::ENAMETOOLONG);
            return Ok(None);
        }
        Ok(Some(read_string(target, address, len)?))
    }

    /// Resolve a target supplied file name against the base directory.
    ///
    /// Names are anchored at the base directory; they may not climb above it.
    fn resolve_path(&self, name: &str) -> Result<PathBuf, i32> {
        if name.is_empty() {
            return Err(libc::ENOENT);
        }
        let Some(base) = self.base_dir.as_ref() else {
            return Ok(PathBuf::from(name));
        };

        let mut resolved = base.clone();
        let mut depth = 0usize;
        for component in std::path::Path::new(name).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir if depth == 0 => {
                    tracing::warn!("Refusing to leave the semihosting base directory: {name}");
                    return Err(libc::EACCES);
                }
                Component::ParentDir => {
                    resolved.pop();
                    depth -= 1;
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }

    fn is_redirected(&self, class: StreamClass, handle: i32, read: bool) -> bool {
        if !self.redirect_mode.redirects(class) {
            return false;
        }
        if read {
            handle == self.stdin_fd
        } else {
            handle == self.stdout_fd || handle == self.stderr_fd
        }
    }

    fn read(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_redirected(StreamClass::Stdio, handle, true) {
            return match self.redirect.as_mut() {
                Some(redirect) => redirect.read(buf),
                None => Err(bad_handle()),
            };
        }
        self.host.read(handle, buf)
    }

    fn write(&mut self, handle: i32, data: &[u8]) -> io::Result<usize> {
        if self.is_redirected(StreamClass::Stdio, handle, false) {
            return match self.redirect.as_mut() {
                Some(redirect) => redirect.write(data),
                None => Err(bad_handle()),
            };
        }
        self.host.write(handle, data)
    }

    fn console_write(&mut self, data: &[u8]) {
        if self.is_redirected(StreamClass::Debug, self.stdout_fd, false) {
            let written = match self.redirect.as_mut() {
                Some(redirect) => redirect.write(data),
                None => Err(bad_handle()),
            };
            if let Err(error) = written {
                self.errno = errno_of(&error);
            }
        } else {
            self.host.console_write(data);
        }
    }

    fn console_read(&mut self) -> i64 {
        if self.is_redirected(StreamClass::Debug, self.stdin_fd, true) {
            let mut byte = [0u8];
            let read = match self.redirect.as_mut() {
                Some(redirect) => redirect.read(&mut byte),
                None => Err(bad_handle()),
            };
            return match read {
                Ok(1) => i64::from(byte[0]),
                Ok(_) => -1,
                Err(error) => {
                    self.errno = errno_of(&error);
                    -1
                }
            };
        }
        self.host.console_read().map_or(-1, i64::from)
    }

    fn exit(&mut self, target: &mut dyn Target, reason: u64, subcode: Option<u64>) -> Flow {
        let attached = target.debugger_attached();

        match (reason, subcode) {
            (ADP_STOPPED_APPLICATION_EXIT, Some(code)) => {
                if attached {
                    tracing::info!("semihosting: *** application exited with {} ***", code as i32);
                } else {
                    self.host.exit(code as i32);
                }
            }
            (reason, Some(_)) => {
                tracing::warn!("semihosting: application exception {reason:#x}");
            }
            (ADP_STOPPED_APPLICATION_EXIT, None) => {
                if attached {
                    tracing::info!("semihosting: *** application exited normally ***");
                } else {
                    self.host.exit(0);
                }
            }
            (ADP_STOPPED_RUN_TIME_ERROR, None) => {
                if attached {
                    tracing::warn!("semihosting: *** application exited with error ***");
                } else {
                    self.host.exit(1);
                }
            }
            (reason, None) => {
                if attached {
                    tracing::warn!("semihosting: application exception {reason:#x}");
                } else {
                    self.host.exit(1);
                }
            }
        }

        if self.resumable_exit {
            Flow::Post
        } else {
            self.resumable = false;
            Flow::Halt
        }
    }

    fn user_command(&mut self, target: &mut dyn Target) -> Result<Flow, Error> {
        if let Some(extension) = self.user_extension.as_mut() {
            if let Some(result) = extension(target, self.operation, self.param)? {
                self.result = result;
                return Ok(Flow::Post);
            }
        }

        let fields = ParameterBlock::read(target, self.param, 2)?;
        let address = fields.get(0);
        let len = fields.get(1) as usize;
        if len > MAX_USER_COMMAND_PARAM_LEN {
            tracing::error!(
                "The maximum length for user command parameter is {MAX_USER_COMMAND_PARAM_LEN}, received length is {len}"
            );
            self.fail(libc::EINVAL);
            return Ok(Flow::Post);
        }

        let params = read_string(target, address, len)?;
        let command = UserCommand {
            operation: self.operation,
            params: &params,
        };
        match self.user_hook.as_mut() {
            Some(hook) => {
                if let Err(error) = hook(target, &command) {
                    tracing::warn!("User command {} hook failed: {error:#}", self.operation);
                }
            }
            None => tracing::debug!("No hook for user command {}", self.operation),
        }

        self.result = 0;
        Ok(Flow::Post)
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use crate::semihosting::host::OPEN_MODE_FLAGS;
    use crate::semihosting::operation::{ADP_STOPPED_APPLICATION_EXIT, ADP_STOPPED_RUN_TIME_ERROR};
    use crate::semihosting::{RedirectMode, RegisterAbi, Semihosting, StdStream, SysCall};
    use crate::test_util::{HostCall, MockTarget, RecordingHost};
    use crate::{CoreRegister, Endian, Error, Target, WordSize};

    const PARAM: u64 = 0x2000_1000;
    const DATA: u64 = 0x2000_0000;

    struct Fixture {
        session: Semihosting,
        target: MockTarget,
        host: RecordingHost,
    }

    impl Fixture {
        fn new(word_size: WordSize) -> Self {
            let mut target = MockTarget::new(word_size, Endian::Little);
            let host = RecordingHost::new();
            let mut session = Semihosting::new(&target, RegisterAbi).with_host(host.clone());
            session.enable(&mut target, true).unwrap();
            Self {
                session,
                target,
                host,
            }
        }

        fn call(&mut self, operation: u64, fields: &[u64]) -> Result<i64, Error> {
            let word_size = self.target.word_size();
            let mut block = Vec::new();
            for field in fields {
                block.extend_from_slice(&field.to_le_bytes()[..word_size.bytes()]);
            }
            self.target.load(PARAM, &block);
            self.session.latch(operation, PARAM);
            self.session.dispatch_pending_call(&mut self.target)?;
            Ok(self.session.result())
        }

        fn sys(&mut self, call: SysCall, fields: &[u64]) -> i64 {
            self.call(call as u64, fields).unwrap()
        }

        fn returned(&self) -> Option<u64> {
            self.target.register(CoreRegister::Return)
        }

        fn errno(&self) -> i64 {
            self.session.errno()
        }
    }

    #[test]
    fn open_uses_mode_table() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.load(DATA, b"foo.txt");

        assert_eq!(f.sys(SysCall::Open, &[DATA, 4, 7]), 3);
        assert_eq!(f.returned(), Some(3));
        assert_eq!(
            f.host.calls(),
            vec![HostCall::Open(PathBuf::from("foo.txt"), OPEN_MODE_FLAGS[4])]
        );
    }

    #[test]
    fn open_rejects_unknown_mode_before_reading_the_name() {
        let mut f = Fixture::new(WordSize::U32);

        assert_eq!(f.sys(SysCall::Open, &[DATA, 12, 7]), -1);
        assert_eq!(f.errno(), i64::from(libc::EINVAL));
        assert!(f.host.calls().is_empty());
        assert_eq!(f.target.memory_reads(), &[(PARAM, 4, 3)]);
    }

    #[test_case(SysCall::Open, &[DATA, 0, u64::MAX]; "open")]
    #[test_case(SysCall::Remove, &[DATA, 1 << 40]; "remove")]
    #[test_case(SysCall::Rename, &[DATA, 4097, DATA, 1]; "rename")]
    #[test_case(SysCall::System, &[DATA, 0x10_0000]; "system")]
    fn names_longer_than_the_limit_are_not_read(call: SysCall, fields: &[u64]) {
        let mut f = Fixture::new(WordSize::U64);

        assert_eq!(f.sys(call, fields), -1);
        assert_eq!(f.errno(), i64::from(libc::ENAMETOOLONG));
        assert_eq!(f.returned(), Some(u64::MAX));
        assert!(f.host.calls().is_empty());
        // Only the parameter block was read.
        assert_eq!(f.target.memory_reads().len(), 1);
    }

    #[test_case(0, StdStream::Stdin)]
    #[test_case(5, StdStream::Stdout)]
    #[test_case(8, StdStream::Stderr)]
    fn open_console(mode: u64, stream: StdStream) {
        let mut f = Fixture::new(WordSize::U32);
        f.target.load(DATA, b":tt");

        assert_eq!(f.sys(SysCall::Open, &[DATA, mode, 3]), 3);
        assert_eq!(f.host.calls(), vec![HostCall::DupStdio(stream)]);
        assert_eq!(f.session.stdio_handles()[stream.fd() as usize], 3);
    }

    #[test]
    fn feature_file_is_not_supported() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.load(DATA, b":semihosting-features");

        assert_eq!(f.sys(SysCall::Open, &[DATA, 0, 21]), -1);
        assert_eq!(f.errno(), i64::from(libc::EINVAL));
        assert!(f.host.calls().is_empty());
    }

    #[test_case(0)]
    #[test_case(1)]
    #[test_case(2)]
    fn close_standard_streams_is_a_no_op(handle: u64) {
        let mut f = Fixture::new(WordSize::U32);

        assert_eq!(f.sys(SysCall::Close, &[handle]), 0);
        assert!(f.host.calls().is_empty());
    }

    #[test]
    fn close_reports_host_errors() {
        let mut f = Fixture::new(WordSize::U32);
        f.host.state().fail_with = Some(libc::EBADF);

        assert_eq!(f.sys(SysCall::Close, &[7]), -1);
        assert_eq!(f.errno(), i64::from(libc::EBADF));
        assert_eq!(f.host.calls(), vec![HostCall::Close(7)]);
    }

    #[test]
    fn write_returns_bytes_not_written() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.load(DATA, b"hello");
        f.host.state().write_limit = Some(3);

        assert_eq!(f.sys(SysCall::Write, &[5, DATA, 5]), 2);
        assert_eq!(f.host.calls(), vec![HostCall::Write(5, b"hello".to_vec())]);
    }

    #[test]
    fn failed_write_reports_nothing_written() {
        let mut f = Fixture::new(WordSize::U32);
        f.host.state().fail_with = Some(libc::ENOSPC);

        assert_eq!(f.sys(SysCall::Write, &[5, DATA, 5]), 5);
        assert_eq!(f.errno(), i64::from(libc::ENOSPC));
    }

    #[test]
    fn read_returns_bytes_not_read() {
        let mut f = Fixture::new(WordSize::U64);
        f.host.state().read_data = b"abc".to_vec();

        assert_eq!(f.sys(SysCall::Read, &[4, DATA, 5]), 2);
        assert_eq!(f.target.peek(DATA, 5), b"abc\0\0".to_vec());
        assert_eq!(f.returned(), Some(2));
    }

    #[test]
    fn read_at_end_of_file() {
        let mut f = Fixture::new(WordSize::U32);

        assert_eq!(f.sys(SysCall::Read, &[4, DATA, 8]), 8);
        assert!(f.target.memory_writes().is_empty());
    }

    #[test]
    fn seek() {
        let mut f = Fixture::new(WordSize::U32);
        assert_eq!(f.sys(SysCall::Seek, &[3, 0x40]), 0);

        f.host.state().seek_result = Some(0x20);
        assert_eq!(f.sys(SysCall::Seek, &[3, 0x40]), 0x20);

        f.host.state().fail_with = Some(libc::ESPIPE);
        assert_eq!(f.sys(SysCall::Seek, &[3, 0x40]), -1);
        assert_eq!(f.errno(), i64::from(libc::ESPIPE));
    }

    #[test]
    fn file_length_and_tty() {
        let mut f = Fixture::new(WordSize::U32);
        f.host.state().file_len = 1234;
        assert_eq!(f.sys(SysCall::FileLength, &[3]), 1234);

        assert_eq!(f.sys(SysCall::IsTty, &[3]), 0);
        assert_eq!(f.errno(), i64::from(libc::ENOTTY));

        f.host.state().tty = true;
        assert_eq!(f.sys(SysCall::IsTty, &[3]), 1);
    }

    #[test]
    fn errno_is_sticky() {
        let mut f = Fixture::new(WordSize::U32);
        f.host.state().fail_with = Some(libc::ENOENT);
        f.target.load(DATA, b"gone");
        f.sys(SysCall::Remove, &[DATA, 4]);
        f.host.state().fail_with = None;

        assert_eq!(f.sys(SysCall::IsError, &[0]), 0);
        assert_eq!(f.sys(SysCall::IsError, &[u64::from(u32::MAX)]), 1);
        assert_eq!(f.sys(SysCall::Errno, &[]), i64::from(libc::ENOENT));
    }

    #[test]
    fn console_output() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.load(DATA, b"hi\0");

        f.session.latch(SysCall::WriteC as u64, DATA + 1);
        f.session.dispatch_pending_call(&mut f.target).unwrap();
        f.session.latch(SysCall::Write0 as u64, DATA);
        f.session.dispatch_pending_call(&mut f.target).unwrap();

        assert_eq!(f.session.result(), 0);
        assert_eq!(
            f.host.calls(),
            vec![
                HostCall::ConsoleWrite(b"i".to_vec()),
                HostCall::ConsoleWrite(b"hi".to_vec()),
            ]
        );
    }

    #[test]
    fn console_input() {
        let mut f = Fixture::new(WordSize::U32);
        f.host.state().console_input.push_back(b'x');

        assert_eq!(f.sys(SysCall::ReadC, &[]), i64::from(b'x'));
        assert_eq!(f.sys(SysCall::ReadC, &[]), -1);
    }

    #[test]
    fn system_and_time() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.load(DATA, b"true");
        f.host.state().system_status = 3;
        f.host.state().time = 1_700_000_000;

        assert_eq!(f.sys(SysCall::System, &[DATA, 4]), 3);
        assert_eq!(f.sys(SysCall::Time, &[]), 1_700_000_000);
        assert!(f.sys(SysCall::Clock, &[]) >= 0);
        assert_eq!(
            f.host.calls(),
            vec![HostCall::System("true".to_string())]
        );
    }

    #[test]
    fn cmdline_fits() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_cmdline(["a", "b"]);

        assert_eq!(f.sys(SysCall::GetCmdline, &[DATA, 4]), 0);
        assert_eq!(f.target.peek(DATA, 4), b"a b\0".to_vec());
        assert_eq!(f.target.peek(PARAM + 4, 4), 4u32.to_le_bytes().to_vec());
    }

    #[test]
    fn cmdline_too_long_writes_nothing() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_cmdline(["a", "b"]);

        assert_eq!(f.sys(SysCall::GetCmdline, &[DATA, 3]), -1);
        assert!(f.target.memory_writes().is_empty());
        assert_eq!(f.returned(), Some(0xffff_ffff));
    }

    #[test]
    fn heap_info_is_unknown() {
        let mut f = Fixture::new(WordSize::U64);
        f.target.load(DATA, &[0xff; 32]);

        assert_eq!(f.sys(SysCall::HeapInfo, &[DATA]), 0);
        assert_eq!(f.target.peek(DATA, 32), vec![0; 32]);
    }

    #[test_case(0x32; "arm reserved")]
    #[test_case(0x108; "user command not serviced")]
    #[test_case(0x200; "unknown")]
    #[test_case(SysCall::TmpName as u64; "tmpnam")]
    #[test_case(SysCall::Elapsed as u64; "elapsed")]
    fn unsupported_operations(operation: u64) {
        let mut f = Fixture::new(WordSize::U32);

        assert_eq!(f.call(operation, &[]).unwrap(), -1);
        assert_eq!(f.errno(), i64::from(libc::ENOTSUP));
        assert_eq!(f.returned(), Some(0xffff_ffff));
    }

    #[test]
    fn memory_failure_is_fatal() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.fail_memory_access(true);

        f.session.latch(SysCall::Open as u64, PARAM);
        assert!(matches!(
            f.session.dispatch_pending_call(&mut f.target),
            Err(Error::Target(_))
        ));
        assert_eq!(f.returned(), None);
    }

    #[test]
    fn paths_are_anchored_at_base_dir() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_base_dir(Some(PathBuf::from("/srv"))).unwrap();
        f.target.load(DATA, b"logs/../out.txt");
        f.target.load(DATA + 0x100, b"../etc/passwd");

        assert_eq!(f.sys(SysCall::Open, &[DATA, 4, 15]), 3);
        assert_eq!(f.sys(SysCall::Open, &[DATA + 0x100, 0, 13]), -1);
        assert_eq!(f.errno(), i64::from(libc::EACCES));
        assert_eq!(f.sys(SysCall::Remove, &[DATA, 0]), -1);
        assert_eq!(f.errno(), i64::from(libc::ENOENT));

        assert_eq!(
            f.host.calls(),
            vec![HostCall::Open(
                PathBuf::from("/srv/out.txt"),
                OPEN_MODE_FLAGS[4]
            )]
        );
    }

    #[test]
    fn rename_resolves_both_paths() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_base_dir(Some(PathBuf::from("/srv"))).unwrap();
        f.target.load(DATA, b"a");
        f.target.load(DATA + 0x10, b"b");

        assert_eq!(f.sys(SysCall::Rename, &[DATA, 1, DATA + 0x10, 1]), 0);
        assert_eq!(
            f.host.calls(),
            vec![HostCall::Rename(
                PathBuf::from("/srv/a"),
                PathBuf::from("/srv/b")
            )]
        );
    }

    #[test]
    fn redirect_without_client() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_redirect(RedirectMode::Stdio, 0).unwrap();

        assert_eq!(f.sys(SysCall::Write, &[1, DATA, 4]), 4);
        assert_eq!(f.errno(), i64::from(libc::EBADF));
        assert_eq!(f.sys(SysCall::Write, &[5, DATA, 4]), 0);
        assert_eq!(f.host.calls(), vec![HostCall::Write(5, vec![0; 4])]);
    }

    #[test_case(WordSize::U32, &[], ADP_STOPPED_APPLICATION_EXIT, Some(0))]
    #[test_case(WordSize::U32, &[], ADP_STOPPED_RUN_TIME_ERROR, Some(1))]
    #[test_case(WordSize::U32, &[], 0x20024, Some(1); "other reason")]
    #[test_case(WordSize::U64, &[ADP_STOPPED_APPLICATION_EXIT, 3], 0, Some(3); "with subcode")]
    #[test_case(WordSize::U64, &[0x20023, 3], 0, None; "exception with subcode")]
    fn exit_without_debugger(word_size: WordSize, fields: &[u64], param: u64, code: Option<i32>) {
        let mut f = Fixture::new(word_size);

        let param = if fields.is_empty() {
            param
        } else {
            let mut block = Vec::new();
            for field in fields {
                block.extend_from_slice(&field.to_le_bytes());
            }
            f.target.load(PARAM, &block);
            PARAM
        };
        f.session.latch(SysCall::Exit as u64, param);
        f.session.dispatch_pending_call(&mut f.target).unwrap();

        let exits: Vec<_> = f
            .host
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Exit(code) => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(exits, code.into_iter().collect::<Vec<_>>());
        assert!(!f.session.is_resumable());
        assert_eq!(f.target.halted_count(), 1);
        assert_eq!(f.returned(), None);
    }

    #[test]
    fn exit_with_debugger_attached() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.set_debugger_attached(true);

        f.session.latch(SysCall::Exit as u64, ADP_STOPPED_APPLICATION_EXIT);
        f.session.dispatch_pending_call(&mut f.target).unwrap();

        assert!(f.host.calls().is_empty());
        assert_eq!(f.target.halted_count(), 1);

        f.session.set_resumable_exit(true).unwrap();
        f.session.latch(SysCall::Exit as u64, ADP_STOPPED_APPLICATION_EXIT);
        f.session.dispatch_pending_call(&mut f.target).unwrap();

        assert!(f.session.is_resumable());
        assert_eq!(f.target.halted_count(), 1);
        assert_eq!(f.returned(), Some(0xffff_ffff));
    }

    #[test]
    fn user_command_hook_sees_parameters() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.load(DATA, b"reset halt");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        f.session.set_user_command_hook(move |_, command| {
            log.borrow_mut()
                .push((command.operation().code(), command.params().to_string()));
            Ok(())
        });

        assert_eq!(f.call(0x107, &[DATA, 10]).unwrap(), 0);
        assert_eq!(*seen.borrow(), vec![(0x107, "reset halt".to_string())]);
    }

    #[test]
    fn user_command_hook_failure_is_not_reported() {
        let mut f = Fixture::new(WordSize::U32);
        f.session
            .set_user_command_hook(|_, _| anyhow::bail!("unknown command"));

        assert_eq!(f.call(0x100, &[DATA, 0]).unwrap(), 0);
    }

    #[test]
    fn oversized_user_command_is_rejected_unread() {
        let mut f = Fixture::new(WordSize::U32);
        let called = Rc::new(RefCell::new(false));
        let flag = called.clone();
        f.session.set_user_command_hook(move |_, _| {
            *flag.borrow_mut() = true;
            Ok(())
        });

        assert_eq!(f.call(0x100, &[DATA, 1025]).unwrap(), -1);
        assert_eq!(f.errno(), i64::from(libc::EINVAL));
        assert_eq!(f.target.memory_reads(), &[(PARAM, 4, 2)]);
        assert!(!*called.borrow());
    }

    #[test]
    fn user_command_extension_comes_first() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_user_command_hook(|_, _| anyhow::bail!("not reached"));
        f.session
            .set_user_command_extension(|_, operation, param| match operation.code() {
                0x101 => Ok(Some(param as i64 & 0xff)),
                _ => Ok(None),
            });

        assert_eq!(f.call(0x101, &[]).unwrap(), 0x00);
        assert!(f.target.memory_reads().is_empty());
        assert_eq!(f.call(0x102, &[DATA, 0]).unwrap(), 0);
    }

    #[test]
    fn fileio_write_is_staged_until_gdb_replies() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_fileio(true).unwrap();

        f.sys(SysCall::Write, &[1, DATA, 16]);
        let pending = f.session.pending_fileio().unwrap();
        assert_eq!(pending.to_gdb_packet(), "Fwrite,1,20000000,10");
        assert_eq!(f.returned(), None);
        assert!(f.host.calls().is_empty());

        f.session.complete_deferred(&mut f.target, 16, 0, false).unwrap();
        assert_eq!(f.session.result(), 0);
        assert_eq!(f.returned(), Some(0));
        assert!(f.session.pending_fileio().is_none());
    }

    #[test]
    fn fileio_read_failure_keeps_errno() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_fileio(true).unwrap();

        f.sys(SysCall::Read, &[3, DATA, 8]);
        f.session
            .complete_deferred_packet(&mut f.target, "F-1,9")
            .unwrap();

        assert_eq!(f.session.result(), 8);
        assert_eq!(f.errno(), 9);
    }

    #[test]
    fn fileio_open_and_tty() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_fileio(true).unwrap();
        f.target.load(DATA, b"log.txt");
        f.target.load(DATA + 0x10, b":tt");

        f.sys(SysCall::Open, &[DATA, 9, 7]);
        assert_eq!(
            f.session.pending_fileio().unwrap().to_gdb_packet(),
            "Fopen,20000000/8,209,1a4"
        );
        f.session.complete_deferred(&mut f.target, 7, 0, false).unwrap();
        assert_eq!(f.returned(), Some(7));

        assert_eq!(f.sys(SysCall::Open, &[DATA + 0x10, 4, 3]), 1);
        assert!(f.session.pending_fileio().is_none());
        assert_eq!(f.sys(SysCall::Open, &[DATA + 0x10, 1, 3]), -1);
        assert_eq!(f.errno(), i64::from(libc::EINVAL));

        f.sys(SysCall::IsTty, &[1]);
        f.session.complete_deferred(&mut f.target, 0, 25, false).unwrap();
        assert_eq!(f.session.result(), 0);
        assert_eq!(f.errno(), 25);
    }

    #[test]
    fn fileio_unsupported_calls() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_fileio(true).unwrap();

        assert_eq!(f.sys(SysCall::FileLength, &[3]), -1);
        assert_eq!(f.errno(), i64::from(libc::EINVAL));
        assert!(matches!(
            f.call(SysCall::ReadC as u64, &[]),
            Err(Error::FileIoUnsupported(_))
        ));
        assert!(matches!(
            f.session.complete_deferred(&mut f.target, 0, 0, false),
            Err(Error::NoPendingFileIo)
        ));
    }

    #[test]
    fn fileio_stages_only_forwardable_calls() {
        let mut f = Fixture::new(WordSize::U32);
        f.session.set_fileio(true).unwrap();

        for (call, fields) in [
            (SysCall::Close, &[5u64][..]),
            (SysCall::Seek, &[5, 0x10][..]),
            (SysCall::Remove, &[DATA, 4][..]),
        ] {
            assert!(call.layout(WordSize::U32).fileio);
            f.sys(call, fields);
            assert!(f.session.pending_fileio().is_some(), "{call:?} was not staged");
            f.session.complete_deferred(&mut f.target, 0, 0, false).unwrap();
        }

        for (call, fields) in [(SysCall::Time, &[][..]), (SysCall::HeapInfo, &[DATA][..])] {
            assert!(!call.layout(WordSize::U32).fileio);
            assert_eq!(f.sys(call, fields), f.session.result());
            assert!(f.session.pending_fileio().is_none(), "{call:?} was staged");
        }
    }

    #[test]
    fn session_setup() {
        let mut target = MockTarget::new(WordSize::U32, Endian::Little);
        let mut session = Semihosting::new(&target, RegisterAbi).with_host(RecordingHost::new());

        session.set_cmdline(["app"]);
        assert!(matches!(session.set_fileio(true), Err(Error::NotEnabled(_))));

        target.set_examined(false);
        assert!(matches!(
            session.enable(&mut target, true),
            Err(Error::NotExamined(_))
        ));
        assert!(!session.is_active());

        target.set_examined(true);
        session.enable(&mut target, true).unwrap();
        session.set_fileio(true).unwrap();
        assert!(session.is_fileio());
        assert_eq!(session.cmdline(), "app");
    }

    #[test]
    fn latch_from_registers() {
        let mut f = Fixture::new(WordSize::U32);
        f.target.set_register(CoreRegister::Operation, SysCall::Time as u64);
        f.target.set_register(CoreRegister::Parameter, 0x1_2000_0000);

        f.session.latch_from_registers(&mut f.target).unwrap();

        assert_eq!(f.session.operation().code(), SysCall::Time as u64);
        assert_eq!(f.session.param(), 0x2000_0000);
    }
}
