use super::unit::{TraceConfig, TraceUnit};
use super::{TraceBackend, TraceError};

/// Handle of a registered trace callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(usize);

type Callback = Box<dyn FnMut(&[u8])>;

/// Receivers of captured trace data.
#[derive(Default)]
pub struct TraceCallbacks {
    next_id: usize,
    callbacks: Vec<(CallbackId, Callback)>,
}

impl std::fmt::Debug for TraceCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCallbacks")
            .field("registered", &self.callbacks.len())
            .finish()
    }
}

impl TraceCallbacks {
    /// Call `callback` with every chunk of captured data.
    pub fn register(&mut self, callback: impl FnMut(&[u8]) + 'static) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unregister(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        self.callbacks.len() != before
    }

    pub(crate) fn dispatch(&mut self, data: &[u8]) {
        for (_, callback) in &mut self.callbacks {
            callback(data);
        }
    }
}

/// All trace units of a session.
#[derive(Debug, Default)]
pub struct TraceUnits {
    units: Vec<TraceUnit>,
    callbacks: TraceCallbacks,
}

impl TraceUnits {
    /// No units, no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new unit.
    pub fn create(
        &mut self,
        name: impl Into<String>,
        config: TraceConfig,
    ) -> Result<&mut TraceUnit, TraceError> {
        let name = name.into();
        if self.units.iter().any(|unit| unit.name() == name) {
            return Err(TraceError::DuplicateName(name));
        }

        let mut unit = TraceUnit::new(name);
        unit.configure(config)?;
        tracing::debug!("Created trace unit {}", unit.name());
        self.units.push(unit);

        let index = self.units.len() - 1;
        Ok(&mut self.units[index])
    }

    /// Names of all units in creation order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(TraceUnit::name)
    }

    /// Look up a unit by name.
    pub fn get(&self, name: &str) -> Result<&TraceUnit, TraceError> {
        self.units
            .iter()
            .find(|unit| unit.name() == name)
            .ok_or_else(|| TraceError::UnknownUnit(name.to_string()))
    }

    /// Look up a unit by name.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut TraceUnit, TraceError> {
        self.units
            .iter_mut()
            .find(|unit| unit.name() == name)
            .ok_or_else(|| TraceError::UnknownUnit(name.to_string()))
    }

    /// The receivers of captured data, shared by all units.
    pub fn callbacks_mut(&mut self) -> &mut TraceCallbacks {
        &mut self.callbacks
    }

    /// Enable the units that asked for it with [`TraceUnit::defer_enable`].
    ///
    /// All units are attempted; the last failure is returned.
    pub fn init(
        &mut self,
        backend: &mut dyn TraceBackend,
        current_target: Option<&str>,
    ) -> Result<(), TraceError> {
        let mut result = Ok(());
        for unit in &mut self.units {
            if !unit.take_deferred_enable() {
                continue;
            }
            if let Err(error) = unit.enable(backend, current_target) {
                tracing::error!("Failed to enable trace unit {}: {error}", unit.name());
                result = Err(error);
            }
        }
        result
    }

    /// Forward captured data of all capturing units.
    ///
    /// All units are polled; the last failure is returned.
    pub fn poll(&mut self, backend: &mut dyn TraceBackend) -> Result<(), TraceError> {
        let mut result = Ok(());
        for unit in &mut self.units {
            if let Err(error) = unit.poll(backend, &mut self.callbacks) {
                tracing::warn!("Failed to poll trace unit {}: {error}", unit.name());
                result = Err(error);
            }
        }
        result
    }

    /// Disable and forget all units.
    pub fn cleanup_all(&mut self, backend: &mut dyn TraceBackend, current_target: Option<&str>) {
        for unit in &mut self.units {
            unit.disable(backend, current_target);
        }
        self.units.clear();
    }
}
