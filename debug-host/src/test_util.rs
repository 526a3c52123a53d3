//! Fakes of the collaborators around the host services.
//!
//! Only built for tests and with the `test` feature.

use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::semihosting::{HostIo, OpenFlags, StdStream};
use crate::target::{CoreRegister, Endian, Target, TargetError, WordSize};
use crate::trace::tpiu::{self, TPIU_DEVID_OFFSET, TPIU_SSPSR_OFFSET};
use crate::trace::{CaptureRequest, CaptureSettings, TraceBackend, TraceError};

/// A target with sparse, zero initialized memory and a register file.
#[derive(Debug)]
pub struct MockTarget {
    word_size: WordSize,
    endian: Endian,
    memory: HashMap<u64, u8>,
    registers: HashMap<CoreRegister, u64>,
    reads: Vec<(u64, usize, usize)>,
    writes: Vec<(u64, usize, usize)>,
    fail_memory: bool,
    examined: bool,
    attached: bool,
    halted: usize,
}

impl MockTarget {
    /// An examined target without a debugger attached.
    pub fn new(word_size: WordSize, endian: Endian) -> Self {
        Self {
            word_size,
            endian,
            memory: HashMap::new(),
            registers: HashMap::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            fail_memory: false,
            examined: true,
            attached: false,
            halted: 0,
        }
    }

    /// Put `data` into memory at `address`.
    pub fn load(&mut self, address: u64, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address + offset as u64, *byte);
        }
    }

    /// Memory contents at `address`, without recording an access.
    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|offset| self.memory.get(&(address + offset)).copied().unwrap_or(0))
            .collect()
    }

    /// Every memory read as `(address, element size, count)`.
    pub fn memory_reads(&self) -> &[(u64, usize, usize)] {
        &self.reads
    }

    /// Every memory write as `(address, element size, count)`.
    pub fn memory_writes(&self) -> &[(u64, usize, usize)] {
        &self.writes
    }

    /// Make all memory accesses fail.
    pub fn fail_memory_access(&mut self, fail: bool) {
        self.fail_memory = fail;
    }

    /// Set a core register.
    pub fn set_register(&mut self, register: CoreRegister, value: u64) {
        self.registers.insert(register, value);
    }

    /// A core register, `None` if it was never written.
    pub fn register(&self, register: CoreRegister) -> Option<u64> {
        self.registers.get(&register).copied()
    }

    /// Pretend a GDB client is connected.
    pub fn set_debugger_attached(&mut self, attached: bool) {
        self.attached = attached;
    }

    /// Set whether the target was examined.
    pub fn set_examined(&mut self, examined: bool) {
        self.examined = examined;
    }

    /// How often the halted event fired.
    pub fn halted_count(&self) -> usize {
        self.halted
    }
}

impl Target for MockTarget {
    fn name(&self) -> &str {
        "mock"
    }

    fn word_size(&self) -> WordSize {
        self.word_size
    }

    fn endianness(&self) -> Endian {
        self.endian
    }

    fn was_examined(&self) -> bool {
        self.examined
    }

    fn read_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), TargetError> {
        self.reads.push((address, size, count));
        if self.fail_memory {
            return Err(TargetError::MemoryAccess {
                address,
                len: data.len(),
            });
        }
        data.copy_from_slice(&self.peek(address, data.len()));
        Ok(())
    }

    fn write_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        data: &[u8],
    ) -> Result<(), TargetError> {
        self.writes.push((address, size, count));
        if self.fail_memory {
            return Err(TargetError::MemoryAccess {
                address,
                len: data.len(),
            });
        }
        self.load(address, data);
        Ok(())
    }

    fn read_core_reg(&mut self, register: CoreRegister) -> Result<u64, TargetError> {
        self.registers
            .get(&register)
            .copied()
            .ok_or(TargetError::Register(register))
    }

    fn write_core_reg(&mut self, register: CoreRegister, value: u64) -> Result<(), TargetError> {
        self.registers.insert(register, value);
        Ok(())
    }

    fn debugger_attached(&self) -> bool {
        self.attached
    }

    fn notify_halted(&mut self) -> Result<(), TargetError> {
        self.halted += 1;
        Ok(())
    }
}

/// A host primitive called by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    /// `open(path, flags)`
    Open(PathBuf, OpenFlags),
    /// `dup(stream)`
    DupStdio(StdStream),
    /// `close(handle)`
    Close(i32),
    /// `read(handle, len)`
    Read(i32, usize),
    /// `write(handle, data)`
    Write(i32, Vec<u8>),
    /// `lseek(handle, position)`
    Seek(i32, u64),
    /// `fstat(handle)`
    FileLen(i32),
    /// `isatty(handle)`
    IsTty(i32),
    /// `remove(path)`
    Remove(PathBuf),
    /// `rename(from, to)`
    Rename(PathBuf, PathBuf),
    /// `system(command)`
    System(String),
    /// Console output.
    ConsoleWrite(Vec<u8>),
    /// Console input.
    ConsoleRead,
    /// Process exit.
    Exit(i32),
}

/// Scripted responses and the log of a [`RecordingHost`].
#[derive(Debug)]
pub struct HostState {
    /// Calls in the order they happened.
    pub calls: Vec<HostCall>,
    /// Every fallible primitive fails with this OS error.
    pub fail_with: Option<i32>,
    /// Handle returned by the next `open` or `dup`.
    pub next_handle: i32,
    /// Data returned by reads, consumed front to back.
    pub read_data: Vec<u8>,
    /// Maximum number of bytes a write accepts.
    pub write_limit: Option<usize>,
    /// Position reported by seeks instead of the requested one.
    pub seek_result: Option<u64>,
    /// Length reported for any handle.
    pub file_len: u64,
    /// Whether handles are terminals.
    pub tty: bool,
    /// Exit status of `system`.
    pub system_status: i32,
    /// Bytes returned by console reads.
    pub console_input: VecDeque<u8>,
    /// Wall clock in seconds.
    pub time: u64,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            fail_with: None,
            next_handle: 3,
            read_data: Vec::new(),
            write_limit: None,
            seek_result: None,
            file_len: 0,
            tty: false,
            system_status: 0,
            console_input: VecDeque::new(),
            time: 0,
        }
    }
}

/// [`HostIo`] recording every call. Clones share their state, so a test can keep one
/// clone and hand the other to the session.
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    state: Rc<RefCell<HostState>>,
}

impl RecordingHost {
    /// A host with default responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripted responses and recorded calls.
    pub fn state(&self) -> RefMut<'_, HostState> {
        self.state.borrow_mut()
    }

    /// The recorded calls.
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.borrow().calls.clone()
    }

    fn record(&self, call: HostCall) -> io::Result<RefMut<'_, HostState>> {
        let mut state = self.state.borrow_mut();
        state.calls.push(call);
        let fail_with = state.fail_with;
        match fail_with {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(state),
        }
    }

    fn new_handle(&self, call: HostCall) -> io::Result<i32> {
        let mut state = self.record(call)?;
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(handle)
    }
}

impl HostIo for RecordingHost {
    fn open(&mut self, path: &Path, flags: OpenFlags) -> io::Result<i32> {
        self.new_handle(HostCall::Open(path.to_path_buf(), flags))
    }

    fn dup_stdio(&mut self, stream: StdStream) -> io::Result<i32> {
        self.new_handle(HostCall::DupStdio(stream))
    }

    fn close(&mut self, handle: i32) -> io::Result<()> {
        self.record(HostCall::Close(handle)).map(drop)
    }

    fn read(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.record(HostCall::Read(handle, buf.len()))?;
        let len = buf.len().min(state.read_data.len());
        buf[..len].copy_from_slice(&state.read_data[..len]);
        let rest = state.read_data.split_off(len);
        state.read_data = rest;
        Ok(len)
    }

    fn write(&mut self, handle: i32, data: &[u8]) -> io::Result<usize> {
        let state = self.record(HostCall::Write(handle, data.to_vec()))?;
        Ok(state.write_limit.map_or(data.len(), |limit| limit.min(data.len())))
    }

    fn seek(&mut self, handle: i32, position: u64) -> io::Result<u64> {
        let state = self.record(HostCall::Seek(handle, position))?;
        Ok(state.seek_result.unwrap_or(position))
    }

    fn file_len(&mut self, handle: i32) -> io::Result<u64> {
        Ok(self.record(HostCall::FileLen(handle))?.file_len)
    }

    fn is_tty(&mut self, handle: i32) -> io::Result<bool> {
        Ok(self.record(HostCall::IsTty(handle))?.tty)
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        self.record(HostCall::Remove(path.to_path_buf())).map(drop)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        self.record(HostCall::Rename(from.to_path_buf(), to.to_path_buf()))
            .map(drop)
    }

    fn system(&mut self, command: &str) -> io::Result<i32> {
        Ok(self.record(HostCall::System(command.to_string()))?.system_status)
    }

    fn console_write(&mut self, data: &[u8]) {
        self.state
            .borrow_mut()
            .calls
            .push(HostCall::ConsoleWrite(data.to_vec()));
    }

    fn console_read(&mut self) -> Option<u8> {
        let mut state = self.state.borrow_mut();
        state.calls.push(HostCall::ConsoleRead);
        state.console_input.pop_front()
    }

    fn time(&self) -> u64 {
        self.state.borrow().time
    }

    fn exit(&mut self, code: i32) {
        self.state.borrow_mut().calls.push(HostCall::Exit(code));
    }
}

/// A TPIU and trace capable adapter.
#[derive(Debug)]
pub struct FakeTraceBackend {
    /// Value of `TPIU_DEVID`. Supports every protocol by default.
    pub devid: u32,
    /// Value of `TPIU_SSPSR`. Supports every width by default.
    pub sspsr: u32,
    /// The other TPIU registers.
    pub registers: HashMap<u64, u32>,
    /// Pin frequency the adapter settles on instead of the requested one.
    pub negotiated_pin_freq: Option<u32>,
    /// Prescaler the adapter reports. 0 derives it from the frequencies.
    pub prescaler: u32,
    /// Chunks returned by successive polls.
    pub pending: VecDeque<Vec<u8>>,
    /// Every capture request.
    pub requests: Vec<CaptureRequest>,
    /// Number of started captures.
    pub starts: usize,
    /// Number of stopped captures.
    pub stops: usize,
    /// Make starting a capture fail.
    pub fail_start: bool,
    /// Make stopping a capture fail.
    pub fail_stop: bool,
}

impl Default for FakeTraceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTraceBackend {
    /// An adapter that accepts every request as is.
    pub fn new() -> Self {
        Self {
            devid: 0xc00,
            sspsr: 0xffff_ffff,
            registers: HashMap::new(),
            negotiated_pin_freq: None,
            prescaler: 0,
            pending: VecDeque::new(),
            requests: Vec::new(),
            starts: 0,
            stops: 0,
            fail_start: false,
            fail_stop: false,
        }
    }

    /// A TPIU register other than DEVID and SSPSR; 0 if never written.
    pub fn register(&self, address: u64) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    /// Preset a TPIU register.
    pub fn set_register(&mut self, address: u64, value: u32) {
        self.registers.insert(address, value);
    }
}

impl TraceBackend for FakeTraceBackend {
    fn read_tpiu(&mut self, address: u64) -> Result<u32, TargetError> {
        Ok(match address & 0xfff {
            TPIU_DEVID_OFFSET => self.devid,
            TPIU_SSPSR_OFFSET => self.sspsr,
            _ => self.register(address),
        })
    }

    fn write_tpiu(&mut self, address: u64, value: u32) -> Result<(), TargetError> {
        self.set_register(address, value);
        Ok(())
    }

    fn start_capture(&mut self, request: &CaptureRequest) -> Result<CaptureSettings, TraceError> {
        self.requests.push(*request);
        if self.fail_start {
            return Err(TraceError::Adapter("capture not available".to_string()));
        }
        self.starts += 1;

        let pin_freq = self.negotiated_pin_freq.unwrap_or(request.pin_freq);
        let prescaler = match self.prescaler {
            0 => tpiu::prescaler(request.traceclkin, pin_freq),
            prescaler => prescaler,
        };
        Ok(CaptureSettings {
            pin_freq,
            prescaler,
        })
    }

    fn stop_capture(&mut self) -> Result<(), TraceError> {
        self.stops += 1;
        if self.fail_stop {
            return Err(TraceError::Adapter("capture did not stop".to_string()));
        }
        Ok(())
    }

    fn poll_capture(&mut self, buf: &mut [u8]) -> Result<usize, TraceError> {
        let Some(mut chunk) = self.pending.pop_front() else {
            return Ok(0);
        };
        let len = chunk.len().min(buf.len());
        buf[..len].copy_from_slice(&chunk[..len]);
        if len < chunk.len() {
            self.pending.push_front(chunk.split_off(len));
        }
        Ok(len)
    }
}
