//! TPIU/SWO trace capture.
//!
//! A [`TraceUnit`] drives one TPIU (or SWO) instance: it programs the trace port through
//! the target's memory AP, asks the debug adapter to capture the trace pin and forwards
//! the captured bytes to a file, TCP clients and registered [`TraceCallbacks`].
//! [`TraceUnits`] keeps all units declared for a session.

mod registry;
mod sink;
pub mod tpiu;
mod unit;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use registry::{CallbackId, TraceCallbacks, TraceUnits};
pub use unit::{TraceConfig, TraceState, TraceUnit};

use crate::target::TargetError;

/// Trace port pin protocol, encoded as in the TPIU `SPPR` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinProtocol {
    /// Parallel synchronous trace port.
    #[default]
    Sync = 0,
    /// Asynchronous SWO, Manchester encoded.
    Manchester = 1,
    /// Asynchronous SWO, NRZ (UART) encoded.
    Uart = 2,
}

impl PinProtocol {
    /// Whether this is one of the single pin SWO protocols.
    pub fn is_async(self) -> bool {
        self != PinProtocol::Sync
    }
}

impl fmt::Display for PinProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PinProtocol::Sync => "sync",
            PinProtocol::Manchester => "manchester",
            PinProtocol::Uart => "uart",
        })
    }
}

impl FromStr for PinProtocol {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(PinProtocol::Sync),
            "manchester" => Ok(PinProtocol::Manchester),
            "uart" => Ok(PinProtocol::Uart),
            other => Err(TraceError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Where captured trace data goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TraceOutput {
    /// The trace port is routed to an external capture device; nothing is captured here.
    #[default]
    External,
    /// Capture, but only forward the data to [`TraceCallbacks`].
    Discard,
    /// Append to a file.
    File(PathBuf),
    /// Serve every client connecting to this TCP port. Port 0 picks a free port.
    Tcp(u16),
}

impl fmt::Display for TraceOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceOutput::External => f.write_str("external"),
            TraceOutput::Discard => f.write_str("-"),
            TraceOutput::File(path) => write!(f, "{}", path.display()),
            TraceOutput::Tcp(port) => write!(f, ":{port}"),
        }
    }
}

impl FromStr for TraceOutput {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" => Ok(TraceOutput::External),
            "-" => Ok(TraceOutput::Discard),
            "" => Err(TraceError::InvalidOutput(s.to_string())),
            _ => match s.strip_prefix(':') {
                Some(port) => match port.parse::<u16>() {
                    Ok(port) if port > 0 => Ok(TraceOutput::Tcp(port)),
                    _ => Err(TraceError::InvalidOutput(s.to_string())),
                },
                None => Ok(TraceOutput::File(PathBuf::from(s))),
            },
        }
    }
}

/// Points in the lifecycle of a trace unit where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEvent {
    /// Before the trace port is configured.
    PreEnable,
    /// After capture started and the trace port is configured.
    PostEnable,
    /// Before capture stops.
    PreDisable,
    /// After capture stopped.
    PostDisable,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceEvent::PreEnable => "pre-enable",
            TraceEvent::PostEnable => "post-enable",
            TraceEvent::PreDisable => "pre-disable",
            TraceEvent::PostDisable => "post-disable",
        })
    }
}

/// What a lifecycle hook gets to see.
///
/// The debug target selected by the caller is passed in explicitly; a hook can read it
/// but has no way to change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookContext<'a> {
    /// Name of the trace unit.
    pub unit: &'a str,
    /// The event being handled.
    pub event: TraceEvent,
    /// The debug target selected by the caller, if any.
    pub current_target: Option<&'a str>,
}

/// A lifecycle hook.
pub type TraceHook = dyn FnMut(&HookContext<'_>) -> anyhow::Result<()>;

/// Capture parameters handed to the debug adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Pin protocol.
    pub protocol: PinProtocol,
    /// Width of the synchronous port, 1 for SWO.
    pub port_width: u32,
    /// Requested SWO pin frequency in Hz. 0 asks the adapter to pick one.
    pub pin_freq: u32,
    /// Frequency of the TPIU input clock in Hz.
    pub traceclkin: u32,
}

/// What the debug adapter settled on when capture started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// The pin frequency the adapter actually uses. 0 if unknown.
    pub pin_freq: u32,
    /// The TPIU prescaler that produces this frequency.
    pub prescaler: u32,
}

/// Access to the TPIU registers and the trace capture of the debug adapter.
pub trait TraceBackend {
    /// Read a 32-bit TPIU register.
    fn read_tpiu(&mut self, address: u64) -> Result<u32, TargetError>;

    /// Write a 32-bit TPIU register.
    fn write_tpiu(&mut self, address: u64, value: u32) -> Result<(), TargetError>;

    /// Start capturing trace data.
    fn start_capture(&mut self, request: &CaptureRequest) -> Result<CaptureSettings, TraceError>;

    /// Stop capturing trace data.
    fn stop_capture(&mut self) -> Result<(), TraceError>;

    /// Drain captured data into `buf`, returning the number of bytes. 0 is not an error.
    fn poll_capture(&mut self, buf: &mut [u8]) -> Result<usize, TraceError>;
}

/// Errors of trace units.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TraceError {
    /// Trace unit {0} is enabled; disable it before changing its configuration.
    AlreadyEnabled(String),

    /// Invalid trace port width {0}, it must be between 1 and 32.
    InvalidPortWidth(u32),

    /// Invalid trace output '{0}'.
    InvalidOutput(String),

    /// Unknown pin protocol '{0}'.
    UnknownProtocol(String),

    /// Trace clock-in frequency of {0} is not set.
    ClockNotSet(String),

    /// Pin frequency of {0} must be set for an asynchronous protocol with external capture.
    PinFrequencyRequired(String),

    /// The adapter could not determine the pin frequency for {0}.
    PinFrequencyUnknown(String),

    /// {unit} does not support the {protocol} protocol.
    ProtocolUnsupported {
        /// Name of the trace unit.
        unit: String,
        /// The requested protocol.
        protocol: PinProtocol,
    },

    /// {unit} does not support a port width of {width}.
    PortWidthUnsupported {
        /// Name of the trace unit.
        unit: String,
        /// The requested width.
        width: u32,
    },

    /// The debug adapter reported an error: {0}
    Adapter(String),

    /// Error accessing the trace port.
    Target(#[from] TargetError),

    /// Could not open trace output {output}.
    Sink {
        /// The output that failed.
        output: TraceOutput,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to write trace data.
    Io(#[from] std::io::Error),

    /// The {event} hook of {unit} failed.
    Hook {
        /// Name of the trace unit.
        unit: String,
        /// The event the hook ran for.
        event: TraceEvent,
        /// What went wrong.
        source: anyhow::Error,
    },

    /// A trace unit named {0} already exists.
    DuplicateName(String),

    /// There is no trace unit named {0}.
    UnknownUnit(String),
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::{PinProtocol, TraceOutput};

    #[test_case("external", TraceOutput::External)]
    #[test_case("-", TraceOutput::Discard)]
    #[test_case(":3443", TraceOutput::Tcp(3443))]
    #[test_case(":65535", TraceOutput::Tcp(65535))]
    #[test_case("swo.bin", TraceOutput::File(PathBuf::from("swo.bin")))]
    fn parse_output(output: &str, expected: TraceOutput) {
        let parsed: TraceOutput = output.parse().unwrap();
        assert_eq!(parsed.to_string(), output);
        assert_eq!(parsed, expected);
    }

    #[test_case(":0"; "port zero")]
    #[test_case(":65536"; "port too large")]
    #[test_case(":http"; "not a number")]
    #[test_case(""; "empty")]
    fn reject_output(output: &str) {
        assert!(output.parse::<TraceOutput>().is_err());
    }

    #[test]
    fn protocols() {
        assert_eq!("uart".parse::<PinProtocol>().unwrap(), PinProtocol::Uart);
        assert_eq!(PinProtocol::Manchester as u32, 1);
        assert!(PinProtocol::Uart.is_async());
        assert!(!PinProtocol::Sync.is_async());
        assert!("swd".parse::<PinProtocol>().is_err());
    }
}
