//! Process-wide registry of live tool processes.
//!
//! Every [`ProcessHandle`] registers itself on spawn and deregisters on
//! close. The host calls [`ProcessRegistry::close_all`] once on exit so no
//! tool process outlives it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use futures_util::future::join_all;
use uuid::Uuid;

use crate::process::ProcessHandle;

static GLOBAL: OnceLock<Arc<ProcessRegistry>> = OnceLock::new();

/// Tracks open handles by creation identity.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: Mutex<HashMap<Uuid, Weak<ProcessHandle>>>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by supervisors that are not given their own.
    #[must_use]
    pub fn global() -> Arc<ProcessRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ProcessRegistry::new())))
    }

    pub fn register(&self, handle: &Arc<ProcessHandle>) {
        self.lock().insert(handle.id(), Arc::downgrade(handle));
    }

    /// Returns true if the handle was registered.
    pub fn deregister(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every handle still open. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let live: Vec<Arc<ProcessHandle>> = self
            .lock()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();

        if !live.is_empty() {
            tracing::info!(count = live.len(), "Closing remaining tool processes");
        }
        join_all(live.iter().map(|handle| handle.close())).await;
        live.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Weak<ProcessHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
