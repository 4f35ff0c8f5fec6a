//! Process-wide bookkeeping of live transports.
//!
//! Embedders that juggle many sessions (connection pools, test
//! harnesses) can hand every transport the same registry and later shut
//! them all down at once. Entries are weak; a dropped transport
//! disappears from the registry by itself.

use std::sync::{Arc, Mutex, Weak};

use crate::transport::TransportInner;

/// A registry of live transports.
#[derive(Default, Clone)]
pub struct TransportRegistry {
    inner: Arc<Mutex<Vec<Weak<TransportInner>>>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, transport: Weak<TransportInner>) {
        let mut list = self.inner.lock().expect("registry lock poisoned");
        list.retain(|w| w.strong_count() > 0);
        list.push(transport);
    }

    /// Number of transports still alive.
    pub fn live_count(&self) -> usize {
        let mut list = self.inner.lock().expect("registry lock poisoned");
        list.retain(|w| w.strong_count() > 0);
        list.len()
    }

    /// Closes every registered transport that is still alive.
    pub fn close_all(&self) {
        let live: Vec<Arc<TransportInner>> = {
            let mut list = self.inner.lock().expect("registry lock poisoned");
            list.retain(|w| w.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for inner in live {
            inner.shutdown_by_application();
        }
    }
}
