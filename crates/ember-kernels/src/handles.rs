//! Lazily created per-device library handles.
//!
//! One slot per `(device, kind)`. A slot is filled by the first request for
//! it and never reset while the cache lives. Failed creations leave the slot
//! empty, so a later request retries.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{BackendError, Result};
use crate::runtime::{DeviceIndex, HandleId, HandleKind, Runtime};

/// A library handle bound to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub id: HandleId,
    pub device: DeviceIndex,
    pub kind: HandleKind,
}

/// Registry of created handles, shared by every fork of a context.
#[derive(Debug, Default)]
pub struct HandleCache {
    slots: Mutex<HashMap<(DeviceIndex, HandleKind), Handle>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the `kind` handle of `device`.
    ///
    /// `seed` only matters the first time a random generator is created.
    pub fn get_or_create(
        &self,
        runtime: &dyn Runtime,
        device: DeviceIndex,
        kind: HandleKind,
        seed: impl FnOnce() -> u64,
    ) -> Result<Handle> {
        let capacity = runtime.device_count()?;
        if device >= capacity {
            return Err(BackendError::DeviceOutOfRange { index: device, capacity });
        }

        // Held across creation so two threads never build the same slot.
        let mut slots = self.slots.lock();
        if let Some(handle) = slots.get(&(device, kind)) {
            return Ok(*handle);
        }
        let id = runtime.create_handle(device, kind, seed())?;
        let handle = Handle { id, device, kind };
        slots.insert((device, kind), handle);
        tracing::debug!(device, %kind, id = id.0, "created handle");
        Ok(handle)
    }

    /// Handle in a slot, if it was created.
    pub fn get(&self, device: DeviceIndex, kind: HandleKind) -> Option<Handle> {
        self.slots.lock().get(&(device, kind)).copied()
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
