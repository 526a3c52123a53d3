use std::net::SocketAddr;

use super::registry::TraceCallbacks;
use super::sink::TraceSink;
use super::tpiu::{
    self, Devid, Ffcr, DEFAULT_TPIU_BASE, TPIU_ACPR_OFFSET, TPIU_CSPSR_OFFSET, TPIU_DEVID_OFFSET,
    TPIU_FFCR_OFFSET, TPIU_SPPR_OFFSET, TPIU_SSPSR_OFFSET,
};
use super::{
    CaptureRequest, HookContext, PinProtocol, TraceBackend, TraceError, TraceEvent, TraceHook,
    TraceOutput,
};

/// Size of the buffer captured data is drained into on every poll.
pub const TRACE_BUFFER_SIZE: usize = 4096;

/// Configuration of a trace unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Number of trace data pins, 1 to 32. SWO uses 1.
    pub port_width: u32,
    /// Pin protocol.
    pub protocol: PinProtocol,
    /// Enable the TPIU formatter.
    pub formatter: bool,
    /// TPIU input clock in Hz.
    pub traceclkin: u32,
    /// SWO pin frequency in Hz. 0 lets the adapter choose.
    pub pin_freq: u32,
    /// Where captured data goes.
    pub output: TraceOutput,
    /// Base address of the TPIU.
    pub base: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            port_width: 1,
            protocol: PinProtocol::Sync,
            formatter: false,
            traceclkin: 0,
            pin_freq: 0,
            output: TraceOutput::External,
            base: DEFAULT_TPIU_BASE,
        }
    }
}

impl TraceConfig {
    /// Check the values that can be checked without talking to the target.
    pub fn validate(&self) -> Result<(), TraceError> {
        if !(1..=32).contains(&self.port_width) {
            return Err(TraceError::InvalidPortWidth(self.port_width));
        }
        Ok(())
    }
}

/// Lifecycle state of a trace unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    /// Declared, never configured.
    Created,
    /// Configured and ready to be enabled.
    Configured,
    /// The trace port is running.
    Enabled,
    /// Was enabled before; may be reconfigured or enabled again.
    Disabled,
}

/// One TPIU/SWO instance.
pub struct TraceUnit {
    name: String,
    config: TraceConfig,
    hooks: Vec<(TraceEvent, Box<TraceHook>)>,
    state: TraceState,
    capturing: bool,
    deferred_enable: bool,
    sink: TraceSink,
}

impl std::fmt::Debug for TraceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceUnit")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("capturing", &self.capturing)
            .field("deferred_enable", &self.deferred_enable)
            .finish_non_exhaustive()
    }
}

impl TraceUnit {
    /// Declare a unit with the default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: TraceConfig::default(),
            hooks: Vec::new(),
            state: TraceState::Created,
            capturing: false,
            deferred_enable: false,
            sink: TraceSink::default(),
        }
    }

    /// The name of the unit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current configuration. The pin frequency reflects what the adapter settled on.
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// The lifecycle state.
    pub fn state(&self) -> TraceState {
        self.state
    }

    /// Whether the trace port is enabled.
    pub fn is_enabled(&self) -> bool {
        self.state == TraceState::Enabled
    }

    /// Whether captured data is being polled from the adapter.
    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Address of the TCP trace server, if the output is a TCP port and capture runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sink.local_addr()
    }

    fn ensure_disabled(&self) -> Result<(), TraceError> {
        if self.is_enabled() {
            return Err(TraceError::AlreadyEnabled(self.name.clone()));
        }
        Ok(())
    }

    /// Replace the configuration. Rejected while the unit is enabled.
    pub fn configure(&mut self, config: TraceConfig) -> Result<(), TraceError> {
        self.ensure_disabled()?;
        config.validate()?;
        self.config = config;
        self.state = TraceState::Configured;
        Ok(())
    }

    /// Run `hook` at `event`, replacing a previous hook for the same event.
    /// Rejected while the unit is enabled.
    pub fn set_hook(
        &mut self,
        event: TraceEvent,
        hook: impl FnMut(&HookContext<'_>) -> anyhow::Result<()> + 'static,
    ) -> Result<(), TraceError> {
        self.ensure_disabled()?;
        let hook: Box<TraceHook> = Box::new(hook);
        match self.hooks.iter_mut().find(|(existing, _)| *existing == event) {
            Some((_, slot)) => *slot = hook,
            None => self.hooks.push((event, hook)),
        }
        Ok(())
    }

    /// Enable the unit once the session is initialized, see [`TraceUnits::init`](super::TraceUnits::init).
    pub fn defer_enable(&mut self) {
        self.deferred_enable = true;
    }

    pub(crate) fn take_deferred_enable(&mut self) -> bool {
        std::mem::take(&mut self.deferred_enable)
    }

    fn run_hook(&mut self, event: TraceEvent, current_target: Option<&str>) -> Result<(), TraceError> {
        let Some((_, hook)) = self.hooks.iter_mut().find(|(existing, _)| *existing == event) else {
            return Ok(());
        };

        let context = HookContext {
            unit: &self.name,
            event,
            current_target,
        };
        tracing::debug!("Running {event} hook of {}", self.name);
        hook(&context).map_err(|source| TraceError::Hook {
            unit: self.name.clone(),
            event,
            source,
        })
    }

    /// Configure the trace port and start capturing.
    ///
    /// Enabling an enabled unit does nothing. `current_target` is the debug target
    /// selected by the caller; it is handed to the hooks.
    pub fn enable(
        &mut self,
        backend: &mut dyn TraceBackend,
        current_target: Option<&str>,
    ) -> Result<(), TraceError> {
        if self.is_enabled() {
            return Ok(());
        }

        let protocol = self.config.protocol;
        let external = self.config.output == TraceOutput::External;

        if self.config.traceclkin == 0 {
            return Err(TraceError::ClockNotSet(self.name.clone()));
        }
        if protocol.is_async() && self.config.pin_freq == 0 {
            if external {
                return Err(TraceError::PinFrequencyRequired(self.name.clone()));
            }
            tracing::info!("{}: SWO pin frequency not set, the adapter will pick one", self.name);
        }

        self.run_hook(TraceEvent::PreEnable, current_target)?;

        let devid = Devid(backend.read_tpiu(self.config.base + TPIU_DEVID_OFFSET)?);
        if !devid.supports(protocol) {
            return Err(TraceError::ProtocolUnsupported {
                unit: self.name.clone(),
                protocol,
            });
        }
        if protocol == PinProtocol::Sync {
            let supported = backend.read_tpiu(self.config.base + TPIU_SSPSR_OFFSET)?;
            if supported & tpiu::port_size_bit(self.config.port_width) == 0 {
                return Err(TraceError::PortWidthUnsupported {
                    unit: self.name.clone(),
                    width: self.config.port_width,
                });
            }
        }

        let mut prescaler = 1;
        if !external {
            prescaler = self.start_capture(backend)?;
        } else if protocol.is_async() {
            prescaler = tpiu::prescaler(self.config.traceclkin, self.config.pin_freq);
            self.config.pin_freq = self.config.traceclkin / prescaler;
        }

        if let Err(error) = self.program_port(backend, prescaler, current_target) {
            if self.capturing {
                self.stop_capture(backend);
            }
            return Err(error);
        }

        self.state = TraceState::Enabled;
        tracing::info!("Trace unit {} enabled", self.name);
        Ok(())
    }

    /// Open the output and start capturing on the adapter. Returns the prescaler.
    fn start_capture(&mut self, backend: &mut dyn TraceBackend) -> Result<u32, TraceError> {
        self.sink = TraceSink::open(&self.config.output)?;

        let request = CaptureRequest {
            protocol: self.config.protocol,
            port_width: self.config.port_width,
            pin_freq: self.config.pin_freq,
            traceclkin: self.config.traceclkin,
        };
        let settings = match backend.start_capture(&request) {
            Ok(settings) => settings,
            Err(error) => {
                self.sink.close();
                return Err(error);
            }
        };
        self.capturing = true;

        if self.config.protocol.is_async() && settings.pin_freq == 0 {
            self.stop_capture(backend);
            return Err(TraceError::PinFrequencyUnknown(self.name.clone()));
        }

        if settings.pin_freq != self.config.pin_freq {
            tracing::info!(
                "{}: SWO pin frequency adjusted from {} Hz to {} Hz",
                self.name,
                self.config.pin_freq,
                settings.pin_freq
            );
            self.config.pin_freq = settings.pin_freq;
        }

        Ok(settings.prescaler.max(1))
    }

    fn program_port(
        &mut self,
        backend: &mut dyn TraceBackend,
        prescaler: u32,
        current_target: Option<&str>,
    ) -> Result<(), TraceError> {
        let base = self.config.base;

        backend.write_tpiu(
            base + TPIU_CSPSR_OFFSET,
            tpiu::port_size_bit(self.config.port_width),
        )?;
        backend.write_tpiu(base + TPIU_ACPR_OFFSET, prescaler - 1)?;
        backend.write_tpiu(base + TPIU_SPPR_OFFSET, self.config.protocol as u32)?;

        let mut ffcr = Ffcr(backend.read_tpiu(base + TPIU_FFCR_OFFSET)?);
        ffcr.set_enfcont(self.config.formatter);
        backend.write_tpiu(base + TPIU_FFCR_OFFSET, ffcr.0)?;

        self.run_hook(TraceEvent::PostEnable, current_target)
    }

    /// Close the output and stop the adapter. Failures are logged.
    fn stop_capture(&mut self, backend: &mut dyn TraceBackend) {
        self.capturing = false;
        self.sink.close();
        if let Err(error) = backend.stop_capture() {
            tracing::warn!("{}: failed to stop trace capture: {error}", self.name);
        }
    }

    /// Stop capturing. Disabling a disabled unit does nothing.
    ///
    /// Every step is attempted; failures, including failing hooks, are logged.
    pub fn disable(&mut self, backend: &mut dyn TraceBackend, current_target: Option<&str>) {
        if !self.is_enabled() {
            return;
        }
        self.state = TraceState::Disabled;

        if let Err(error) = self.run_hook(TraceEvent::PreDisable, current_target) {
            tracing::warn!("{error:#}");
        }
        if self.capturing {
            self.stop_capture(backend);
        }
        if let Err(error) = self.run_hook(TraceEvent::PostDisable, current_target) {
            tracing::warn!("{error:#}");
        }

        tracing::info!("Trace unit {} disabled", self.name);
    }

    /// Drain captured data and forward it to the callbacks and the output.
    pub(crate) fn poll(
        &mut self,
        backend: &mut dyn TraceBackend,
        callbacks: &mut TraceCallbacks,
    ) -> Result<(), TraceError> {
        if !self.capturing {
            return Ok(());
        }
        self.sink.accept();

        let mut buf = [0u8; TRACE_BUFFER_SIZE];
        let len = backend.poll_capture(&mut buf)?;
        if len == 0 {
            return Ok(());
        }
        let data = &buf[..len.min(TRACE_BUFFER_SIZE)];

        callbacks.dispatch(data);
        self.sink.write(data)
    }
}
