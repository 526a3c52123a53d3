//! ARM semihosting support.
//!
//! Specification: <https://github.com/ARM-software/abi-aa/blob/2024Q3/semihosting/semihosting.rst>
//!
//! A [`Semihosting`] session belongs to one target. When the target traps on a
//! semihosting instruction the caller latches the operation and parameter registers
//! ([`Semihosting::latch_from_registers`]) and runs [`Semihosting::dispatch_pending_call`].
//! The dispatcher either services the call on the host right away, or, in fileio mode,
//! stages it for a GDB client and waits for [`Semihosting::complete_deferred`].
//! The result is committed to the target through [`SemihostingArch::post_result`].

mod dispatch;
pub mod fields;
pub mod fileio;
pub mod host;
pub mod operation;
pub mod redirect;
pub mod request;

use std::path::{Path, PathBuf};
use std::time::Instant;

pub use fileio::{FileIoOp, FileIoReply, FileIoRequest};
pub use host::{HostIo, NativeHost, OpenFlags, StdStream};
pub use operation::{Operation, SysCall};
pub use redirect::{RedirectMode, RedirectService};
pub use request::Request;

use crate::error::Error;
use crate::target::{CoreRegister, Target, WordSize};

/// Maximum length of the parameter string of a user command.
pub const MAX_USER_COMMAND_PARAM_LEN: usize = 1024;

/// The outcome of a semihosting call, handed to [`SemihostingArch::post_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallResult {
    /// The call that completed.
    pub operation: Operation,
    /// Value for the return register.
    pub result: i64,
    /// Whether the target may continue after the call.
    pub resumable: bool,
}

/// Architecture specific glue between a semihosting session and the core.
pub trait SemihostingArch {
    /// Called whenever semihosting is enabled or disabled, e.g. to arm vector catches.
    fn setup(&mut self, target: &mut dyn Target, enable: bool) -> Result<(), Error>;

    /// Commit the result of a call to the target.
    fn post_result(&mut self, target: &mut dyn Target, call: &CallResult) -> Result<(), Error>;
}

/// [`SemihostingArch`] for cores that return the result in the first argument register.
///
/// Nothing needs to be set up; the result is written unless the call stopped the target.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterAbi;

impl SemihostingArch for RegisterAbi {
    fn setup(&mut self, _target: &mut dyn Target, _enable: bool) -> Result<(), Error> {
        Ok(())
    }

    fn post_result(&mut self, target: &mut dyn Target, call: &CallResult) -> Result<(), Error> {
        if !call.resumable {
            return Ok(());
        }
        let value = target.word_size().truncate(call.result as u64);
        target.write_core_reg(CoreRegister::Return, value)?;
        Ok(())
    }
}

/// A user command (`0x100..=0x107`) as seen by the hook that handles it.
#[derive(Debug, Clone, Copy)]
pub struct UserCommand<'a> {
    operation: Operation,
    params: &'a str,
}

impl<'a> UserCommand<'a> {
    /// The user command that was called.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The parameter string the target passed. Only valid for the duration of the hook.
    pub fn params(&self) -> &'a str {
        self.params
    }
}

/// Runs when the target issues a user command.
pub type UserCommandHook = dyn FnMut(&mut dyn Target, &UserCommand<'_>) -> anyhow::Result<()>;

/// Consulted before [`UserCommandHook`]. Returns `Ok(None)` if it does not handle the
/// command, or the result to post otherwise.
pub type UserCommandExtension =
    dyn FnMut(&mut dyn Target, Operation, u64) -> Result<Option<i64>, Error>;

/// The semihosting state of one target.
pub struct Semihosting {
    target_name: String,
    active: bool,
    word_size: WordSize,

    redirect_mode: RedirectMode,
    redirect: Option<RedirectService>,
    stdin_fd: i32,
    stdout_fd: i32,
    stderr_fd: i32,

    fileio: bool,
    pending: Option<FileIoRequest>,

    operation: Operation,
    param: u64,
    result: i64,
    errno: i64,
    resumable: bool,
    resumable_exit: bool,

    cmdline: String,
    base_dir: Option<PathBuf>,
    setup_time: Instant,

    arch: Box<dyn SemihostingArch>,
    host: Box<dyn HostIo>,
    user_hook: Option<Box<UserCommandHook>>,
    user_extension: Option<Box<UserCommandExtension>>,
}

impl std::fmt::Debug for Semihosting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semihosting")
            .field("target", &self.target_name)
            .field("active", &self.active)
            .field("fileio", &self.fileio)
            .field("redirect_mode", &self.redirect_mode)
            .field("operation", &self.operation)
            .field("param", &self.param)
            .field("result", &self.result)
            .field("errno", &self.errno)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Semihosting {
    /// Create a disabled session for `target`, servicing calls on this machine.
    pub fn new(target: &dyn Target, arch: impl SemihostingArch + 'static) -> Self {
        Self {
            target_name: target.name().to_string(),
            active: false,
            word_size: target.word_size(),
            redirect_mode: RedirectMode::None,
            redirect: None,
            stdin_fd: StdStream::Stdin.fd(),
            stdout_fd: StdStream::Stdout.fd(),
            stderr_fd: StdStream::Stderr.fd(),
            fileio: false,
            pending: None,
            operation: Operation::Unknown(0),
            param: 0,
            result: 0,
            errno: 0,
            resumable: true,
            resumable_exit: false,
            cmdline: String::new(),
            base_dir: None,
            setup_time: Instant::now(),
            arch: Box::new(arch),
            host: Box::new(NativeHost::new()),
            user_hook: None,
            user_extension: None,
        }
    }

    /// Service calls through `host` instead of this machine's files and streams.
    pub fn with_host(mut self, host: impl HostIo + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    /// Enable or disable semihosting. The target must have been examined.
    pub fn enable(&mut self, target: &mut dyn Target, enable: bool) -> Result<(), Error> {
        if !target.was_examined() {
            return Err(Error::NotExamined(target.name().to_string()));
        }

        self.arch.setup(target, enable)?;
        self.active = enable;
        if enable {
            self.word_size = target.word_size();
            self.setup_time = Instant::now();
        }

        tracing::info!(
            "Semihosting {} for {}",
            if enable { "enabled" } else { "disabled" },
            self.target_name
        );
        Ok(())
    }

    /// Whether semihosting calls are serviced.
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn require_active(&self) -> Result<(), Error> {
        if self.active {
            Ok(())
        } else {
            Err(Error::NotEnabled(self.target_name.clone()))
        }
    }

    /// Serve console and stdio traffic selected by `mode` through a TCP client on `port`.
    ///
    /// Any previous redirect service is shut down first. [`RedirectMode::None`] only
    /// shuts it down.
    pub fn set_redirect(&mut self, mode: RedirectMode, port: u16) -> Result<(), Error> {
        self.require_active()?;

        self.redirect = None;
        self.redirect_mode = RedirectMode::None;
        if mode == RedirectMode::None {
            return Ok(());
        }

        let service =
            RedirectService::bind(port).map_err(|source| Error::Redirect { port, source })?;
        self.redirect = Some(service);
        self.redirect_mode = mode;
        Ok(())
    }

    /// The active redirect mode.
    pub fn redirect_mode(&self) -> RedirectMode {
        self.redirect_mode
    }

    /// The redirect service, if one is running.
    pub fn redirect_service(&self) -> Option<&RedirectService> {
        self.redirect.as_ref()
    }

    /// Forward file operations to a GDB client instead of servicing them locally.
    pub fn set_fileio(&mut self, fileio: bool) -> Result<(), Error> {
        self.require_active()?;
        self.fileio = fileio;
        Ok(())
    }

    /// Whether file operations are forwarded to a GDB client.
    pub fn is_fileio(&self) -> bool {
        self.fileio
    }

    /// If set, an exit call with a debugger attached leaves the target resumable
    /// instead of halting it.
    pub fn set_resumable_exit(&mut self, resumable_exit: bool) -> Result<(), Error> {
        self.require_active()?;
        self.resumable_exit = resumable_exit;
        Ok(())
    }

    /// Resolve file names relative to `base_dir`.
    pub fn set_base_dir(&mut self, base_dir: Option<PathBuf>) -> Result<(), Error> {
        self.require_active()?;
        self.base_dir = base_dir;
        Ok(())
    }

    /// The directory file names are resolved against.
    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    /// Set the command line returned by `SYS_GET_CMDLINE`. The arguments are joined by spaces.
    pub fn set_cmdline<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cmdline = args
            .into_iter()
            .map(|arg| arg.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
    }

    /// The command line returned by `SYS_GET_CMDLINE`.
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    /// Run `hook` for every serviced user command.
    pub fn set_user_command_hook(
        &mut self,
        hook: impl FnMut(&mut dyn Target, &UserCommand<'_>) -> anyhow::Result<()> + 'static,
    ) {
        self.user_hook = Some(Box::new(hook));
    }

    /// Give `extension` the first chance at every serviced user command.
    pub fn set_user_command_extension(
        &mut self,
        extension: impl FnMut(&mut dyn Target, Operation, u64) -> Result<Option<i64>, Error>
            + 'static,
    ) {
        self.user_extension = Some(Box::new(extension));
    }

    /// Latch a trapped call.
    pub fn latch(&mut self, operation: u64, param: u64) {
        self.operation = Operation::from(operation);
        self.param = param;
    }

    /// Latch a trapped call from the operation and parameter registers.
    pub fn latch_from_registers(&mut self, target: &mut dyn Target) -> Result<(), Error> {
        let word_size = target.word_size();
        let operation = word_size.truncate(target.read_core_reg(CoreRegister::Operation)?);
        let param = word_size.truncate(target.read_core_reg(CoreRegister::Parameter)?);
        self.latch(operation, param);
        Ok(())
    }

    /// The latched operation.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The latched parameter.
    pub fn param(&self) -> u64 {
        self.param
    }

    /// Result of the last call.
    pub fn result(&self) -> i64 {
        self.result
    }

    /// errno of the last failed call.
    pub fn errno(&self) -> i64 {
        self.errno
    }

    /// Whether the target may resume after the last call.
    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    /// Host handles currently serving as the target's stdin, stdout and stderr.
    pub fn stdio_handles(&self) -> [i32; 3] {
        [self.stdin_fd, self.stdout_fd, self.stderr_fd]
    }

    /// Accept redirect clients and drop input nobody waits for.
    ///
    /// Call this periodically while the target runs.
    pub fn poll(&mut self) {
        if let Some(redirect) = self.redirect.as_mut() {
            redirect.poll();
        }
    }

    fn post_result(&mut self, target: &mut dyn Target) -> Result<(), Error> {
        let call = CallResult {
            operation: self.operation,
            result: self.result,
            resumable: self.resumable,
        };
        tracing::debug!(
            "{}: result={:#x}, errno={}",
            call.operation,
            call.result,
            self.errno
        );
        self.arch.post_result(target, &call)
    }
}
