//! Per-id serialization of pipeline runs

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::metrics;

/// Ids currently owned by a pipeline run in this process
#[derive(Clone, Default)]
pub struct InFlightSet {
    label: &'static str,
    ids: Arc<Mutex<HashSet<[u8; 32]>>>,
}

impl InFlightSet {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ids: Arc::default(),
        }
    }

    /// Claim `id` for the lifetime of the returned guard; `None` if taken
    pub fn try_acquire(&self, id: [u8; 32]) -> Option<InFlightGuard> {
        let mut ids = match self.ids.lock() {
            Ok(ids) => ids,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !ids.insert(id) {
            return None;
        }
        metrics::IN_FLIGHT.with_label_values(&[self.label]).inc();
        Some(InFlightGuard {
            set: self.clone(),
            id,
        })
    }

    pub fn contains(&self, id: &[u8; 32]) -> bool {
        match self.ids.lock() {
            Ok(ids) => ids.contains(id),
            Err(poisoned) => poisoned.into_inner().contains(id),
        }
    }

    fn release(&self, id: &[u8; 32]) {
        let mut ids = match self.ids.lock() {
            Ok(ids) => ids,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ids.remove(id) {
            metrics::IN_FLIGHT.with_label_values(&[self.label]).dec();
        }
    }
}

pub struct InFlightGuard {
    set: InFlightSet,
    id: [u8; 32],
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.release(&self.id);
    }
}
