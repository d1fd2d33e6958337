use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Weak,
};

use parking_lot::{const_rwlock, RwLock};
use tracing::{error, trace};

use crate::{
    emitter::{Emitter, Handle},
    metric::{CanonicalRecord, Metric},
};

static GLOBAL_REGISTRY: EmitterRegistry = EmitterRegistry::new();

/// A single slot holding the "current" emitter.
///
/// The registry does not own the emitter it tracks: once every [`Emitter`] handle is dropped, the slot behaves as
/// if it were empty. Setting a new emitter replaces the previous one.
///
/// A process-wide registry backs [`set_global_emitter`] and [`broadcast`], but registries can also be created on their
/// own, which is mostly useful for tests.
pub struct EmitterRegistry {
    slot: RwLock<Option<Weak<Handle>>>,
}

impl EmitterRegistry {
    /// Creates an empty `EmitterRegistry`.
    pub const fn new() -> Self {
        EmitterRegistry { slot: const_rwlock(None) }
    }

    /// Replaces the tracked emitter.
    pub fn set(&self, emitter: &Emitter) {
        *self.slot.write() = Some(emitter.downgrade());
    }

    /// Clears the tracked emitter.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// Returns the tracked emitter, if one is set and still alive.
    pub fn current(&self) -> Option<Emitter> {
        let handle = self.slot.read().as_ref()?.upgrade()?;
        Some(Emitter::from_handle(handle))
    }

    /// Forwards a metric to the tracked emitter.
    ///
    /// The metric is only submitted if an emitter is set, and it is neither closed nor destroyed. Otherwise, it is
    /// dropped silently. This never panics: a panic raised while submitting is caught and logged.
    ///
    /// Returns the record that was queued, if any.
    pub fn broadcast(&self, metric: Metric) -> Option<CanonicalRecord> {
        let Some(emitter) = self.current() else {
            trace!("No emitter registered, dropping broadcast metric.");
            return None;
        };

        if emitter.is_destroyed() || emitter.is_closed() {
            trace!(state = %emitter.state(), "Registered emitter is inactive, dropping broadcast metric.");
            return None;
        }

        match catch_unwind(AssertUnwindSafe(|| emitter.submit(metric))) {
            Ok(record) => record,
            Err(_) => {
                error!("Emitter panicked while handling a broadcast metric.");
                None
            }
        }
    }
}

impl Default for EmitterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the process-wide registry.
pub fn global_registry() -> &'static EmitterRegistry {
    &GLOBAL_REGISTRY
}

/// Sets the process-wide emitter, replacing any previously set one.
pub fn set_global_emitter(emitter: &Emitter) {
    GLOBAL_REGISTRY.set(emitter);
}

/// Clears the process-wide emitter.
pub fn clear_global_emitter() {
    GLOBAL_REGISTRY.clear();
}

/// Returns the process-wide emitter, if one is set and still alive.
pub fn global_emitter() -> Option<Emitter> {
    GLOBAL_REGISTRY.current()
}

/// Forwards a metric to the process-wide emitter.
///
/// See [`EmitterRegistry::broadcast`].
pub fn broadcast(metric: Metric) -> Option<CanonicalRecord> {
    GLOBAL_REGISTRY.broadcast(metric)
}
