//! Serializable configuration of semihosting sessions and trace units.
//!
//! Where the configuration comes from is up to the caller; any serde format works.
//!
//! ```yaml
//! semihosting:
//!   enabled: true
//!   cmdline: [app, --verbose]
//!   redirect:
//!     port: 2345
//! trace:
//!   - name: stm32.tpiu
//!     protocol: uart
//!     traceclk: 72000000
//!     pin_freq: 2000000
//!     output: ":3443"
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::semihosting::{RedirectMode, Semihosting};
use crate::target::Target;
use crate::trace::tpiu::DEFAULT_TPIU_BASE;
use crate::trace::{PinProtocol, TraceConfig, TraceError, TraceOutput, TraceUnits};

/// Configuration of a debug session's host services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Semihosting settings.
    pub semihosting: SemihostingConfig,
    /// Trace units to declare.
    pub trace: Vec<TraceUnitConfig>,
}

impl Config {
    /// Declare all configured trace units in `units`.
    ///
    /// Units marked `enable` are enabled by the next [`TraceUnits::init`].
    pub fn create_trace_units(&self, units: &mut TraceUnits) -> Result<(), TraceError> {
        for unit_config in &self.trace {
            let config = TraceConfig::try_from(unit_config)?;
            let unit = units.create(unit_config.name.clone(), config)?;
            if unit_config.enable {
                unit.defer_enable();
            }
        }
        Ok(())
    }
}

/// Semihosting settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemihostingConfig {
    /// Service semihosting calls.
    pub enabled: bool,
    /// Forward file operations to the GDB client.
    pub fileio: bool,
    /// Keep the target resumable after an exit call while a debugger is attached.
    pub resumable_exit: bool,
    /// Arguments returned by `SYS_GET_CMDLINE`.
    pub cmdline: Vec<String>,
    /// Directory file names are resolved against.
    pub base_dir: Option<PathBuf>,
    /// Serve console traffic over TCP.
    pub redirect: Option<RedirectConfig>,
}

/// TCP redirection of console and stdio traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// Port to listen on.
    pub port: u16,
    /// Which traffic to redirect.
    #[serde(default = "default_redirect_mode")]
    pub mode: RedirectMode,
}

fn default_redirect_mode() -> RedirectMode {
    RedirectMode::All
}

impl SemihostingConfig {
    /// Configure `session` for `target`.
    ///
    /// A disabled configuration only disables the session; the other settings
    /// need an active session and are skipped.
    pub fn apply(&self, session: &mut Semihosting, target: &mut dyn Target) -> Result<(), Error> {
        session.set_cmdline(&self.cmdline);
        session.enable(target, self.enabled)?;
        if !self.enabled {
            return Ok(());
        }

        session.set_fileio(self.fileio)?;
        session.set_resumable_exit(self.resumable_exit)?;
        session.set_base_dir(self.base_dir.clone())?;
        match &self.redirect {
            Some(redirect) => session.set_redirect(redirect.mode, redirect.port)?,
            None => session.set_redirect(RedirectMode::None, 0)?,
        }
        Ok(())
    }
}

/// A trace unit declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceUnitConfig {
    /// Unique name of the unit.
    pub name: String,
    /// Number of trace data pins.
    #[serde(default = "default_port_width")]
    pub port_width: u32,
    /// Pin protocol.
    #[serde(default)]
    pub protocol: PinProtocol,
    /// Enable the TPIU formatter.
    #[serde(default)]
    pub formatter: bool,
    /// TPIU input clock in Hz.
    #[serde(default)]
    pub traceclk: u32,
    /// SWO pin frequency in Hz.
    #[serde(default)]
    pub pin_freq: u32,
    /// `external`, `-`, a file name or `:port`.
    #[serde(default = "default_output")]
    pub output: String,
    /// Base address of the TPIU.
    #[serde(default = "default_base_address")]
    pub base_address: u64,
    /// Enable the unit when the session is initialized.
    #[serde(default)]
    pub enable: bool,
}

fn default_port_width() -> u32 {
    1
}

fn default_output() -> String {
    "external".to_string()
}

fn default_base_address() -> u64 {
    DEFAULT_TPIU_BASE
}

impl TryFrom<&TraceUnitConfig> for TraceConfig {
    type Error = TraceError;

    fn try_from(value: &TraceUnitConfig) -> Result<Self, Self::Error> {
        let config = TraceConfig {
            port_width: value.port_width,
            protocol: value.protocol,
            formatter: value.formatter,
            traceclkin: value.traceclk,
            pin_freq: value.pin_freq,
            output: value.output.parse::<TraceOutput>()?,
            base: value.base_address,
        };
        config.validate()?;
        Ok(config)
    }
}
