//! In-memory application registry.
//!
//! Each entry owns the application's sync state, its sync mutex and its
//! cancellation flag, so all three are created and destroyed together with
//! the application itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::info;

use crate::application::Application;
use crate::error::RegistryError;
use crate::state::SyncState;

/// Shared handles onto one registered application.
#[derive(Clone)]
pub struct AppHandle {
    pub state: Arc<RwLock<SyncState>>,
    /// Held for the whole duration of a sync cycle.
    pub lock: Arc<Mutex<()>>,
    pub cancel: Arc<AtomicBool>,
}

impl AppHandle {
    fn new() -> Self {
        AppHandle {
            state: Arc::new(RwLock::new(SyncState::default())),
            lock: Arc::new(Mutex::new(())),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn snapshot(&self) -> SyncState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}

struct Entry {
    application: Application,
    handle: AppHandle,
}

#[derive(Default)]
pub struct ApplicationRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        ApplicationRegistry::default()
    }

    pub fn register(&self, application: Application) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&application.name) {
            return Err(RegistryError::DuplicateName(application.name));
        }

        info!(
            "registered application {} ({} -> {}/{})",
            application.name,
            application.source,
            application.destination.cluster,
            application.destination.namespace
        );
        entries.insert(
            application.name.clone(),
            Entry {
                application,
                handle: AppHandle::new(),
            },
        );
        Ok(())
    }

    /// Removes an application together with its sync state. Removing an
    /// unknown name is a no-op.
    pub fn deregister(&self, name: &str) -> Option<Application> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)?;

        // Stop any cycle still running against the removed state.
        removed.handle.cancel.store(true, Ordering::SeqCst);
        info!("deregistered application {name}");
        Some(removed.application)
    }

    /// Replaces the policy, source or destination of an application while
    /// keeping its sync state.
    pub fn update(&self, application: Application) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(&application.name)
            .ok_or_else(|| RegistryError::UnknownApplication(application.name.clone()))?;

        entry.application = application;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Application> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|entry| entry.application.clone())
    }

    pub fn handle(&self, name: &str) -> Option<AppHandle> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|entry| entry.handle.clone())
    }

    /// All applications, ordered by name.
    pub fn list(&self) -> Vec<Application> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.application.clone())
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<SyncState> {
        self.handle(name).map(|handle| handle.snapshot())
    }

    /// Names of the applications deploying to `cluster`.
    pub fn targeting(&self, cluster: &str) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.application.destination.cluster == cluster)
            .map(|entry| entry.application.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
