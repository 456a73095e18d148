use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::path::child_path;
use crate::{Registry, RegistryError, RegistryWatcher, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchPhase {
    Watching,
    Satisfied,
    TimedOut,
}

struct WatchState {
    resolved: BTreeMap<String, Vec<u8>>,
    phase: WatchPhase,
}

/// The watcher half of a coordinator. Every notification is reconciled against the
/// registry under `state`, so concurrent deliveries can't interleave their updates.
struct ChildWatch {
    registry: Arc<dyn Registry>,
    path: String,
    only: Option<String>,
    state: Mutex<WatchState>,
    changed: Condvar,
}

impl ChildWatch {
    fn wanted(&self, child: &str) -> bool {
        self.only.as_deref().map_or(true, |only| only == child)
    }

    fn reconcile(&self, children: &[String]) {
        let mut state = self.state.lock();
        if state.phase != WatchPhase::Watching {
            return;
        }
        state
            .resolved
            .retain(|name, _| children.iter().any(|child| child == name));

        for child in children {
            if !self.wanted(child) || state.resolved.contains_key(child) {
                continue;
            }
            let full = child_path(&self.path, child);
            match self.registry.get_data(&full) {
                Ok(Some(data)) => {
                    state.resolved.insert(child.clone(), data);
                }
                // Removed between the listing and the read.
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "ferry.registry",
                        path = %full,
                        error = %err,
                        "failed to resolve watched child"
                    );
                }
            }
        }
        self.changed.notify_all();
    }
}

impl RegistryWatcher for ChildWatch {
    fn on_children_changed(&self, _path: &str, children: &[String]) {
        self.reconcile(children);
    }
}

/// Blocks until a registry path has enough resolved children.
///
/// The watcher is registered before the initial listing, so a child added at any point
/// after construction is observed. One coordinator serves one wait; it deregisters its
/// watcher when the wait finishes or when it is dropped.
pub struct RegistryWatchCoordinator {
    watch: Arc<ChildWatch>,
    handle: Arc<dyn RegistryWatcher>,
    registered: bool,
}

impl RegistryWatchCoordinator {
    /// Watch every child of `path`.
    pub fn new(registry: Arc<dyn Registry>, path: &str) -> Result<Self> {
        Self::start(registry, path, None)
    }

    /// Watch only the child named `child` under `path`.
    pub fn for_child(registry: Arc<dyn Registry>, path: &str, child: &str) -> Result<Self> {
        Self::start(registry, path, Some(child.to_string()))
    }

    fn start(registry: Arc<dyn Registry>, path: &str, only: Option<String>) -> Result<Self> {
        crate::validate_path(path)?;
        let watch = Arc::new(ChildWatch {
            registry: registry.clone(),
            path: path.to_string(),
            only,
            state: Mutex::new(WatchState {
                resolved: BTreeMap::new(),
                phase: WatchPhase::Watching,
            }),
            changed: Condvar::new(),
        });
        let handle: Arc<dyn RegistryWatcher> = watch.clone();
        registry.add_watcher(path, handle.clone())?;
        let coordinator = Self {
            watch,
            handle,
            registered: true,
        };

        let initial = match registry.children(path) {
            Ok(children) => children,
            Err(RegistryError::NoNode { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        coordinator.watch.reconcile(&initial);
        Ok(coordinator)
    }

    pub fn phase(&self) -> WatchPhase {
        self.watch.state.lock().phase
    }

    pub fn path(&self) -> &str {
        &self.watch.path
    }

    /// Wait until at least `min` children are resolved, returning child name to data.
    ///
    /// The deadline is measured from this call. On timeout the error reports how many
    /// children had been resolved.
    pub fn wait_for_n(
        &mut self,
        min: usize,
        timeout: Duration,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let outcome = self.wait_until(min, deadline);
        self.deregister();
        outcome
    }

    /// Wait for the single watched child, returning its data.
    pub fn wait_for_one(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut resolved = self.wait_for_n(1, timeout)?;
        let name = match &self.watch.only {
            Some(only) => only.clone(),
            None => match resolved.keys().next() {
                Some(first) => first.clone(),
                None => {
                    return Err(RegistryError::Timeout {
                        path: self.watch.path.clone(),
                        required: 1,
                        found: 0,
                    })
                }
            },
        };
        resolved.remove(&name).ok_or_else(|| RegistryError::Timeout {
            path: self.watch.path.clone(),
            required: 1,
            found: 0,
        })
    }

    fn wait_until(&self, min: usize, deadline: Instant) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut state = self.watch.state.lock();
        if state.phase != WatchPhase::Watching {
            return Err(RegistryError::WatchFinished {
                path: self.watch.path.clone(),
            });
        }
        loop {
            if state.resolved.len() >= min {
                state.phase = WatchPhase::Satisfied;
                return Ok(state.resolved.clone());
            }
            if Instant::now() >= deadline {
                state.phase = WatchPhase::TimedOut;
                tracing::debug!(
                    target: "ferry.registry",
                    path = %self.watch.path,
                    required = min,
                    found = state.resolved.len(),
                    "registry wait timed out"
                );
                return Err(RegistryError::Timeout {
                    path: self.watch.path.clone(),
                    required: min,
                    found: state.resolved.len(),
                });
            }
            let _ = self.watch.changed.wait_until(&mut state, deadline);
        }
    }

    fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let Err(err) = self
            .watch
            .registry
            .remove_watcher(&self.watch.path, &self.handle)
        {
            tracing::warn!(
                target: "ferry.registry",
                path = %self.watch.path,
                error = %err,
                "failed to remove registry watcher"
            );
        }
    }
}

impl Drop for RegistryWatchCoordinator {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// Wait for at least `min` children under `path`.
pub fn wait_for_children(
    registry: Arc<dyn Registry>,
    path: &str,
    min: usize,
    timeout: Duration,
) -> Result<BTreeMap<String, Vec<u8>>> {
    RegistryWatchCoordinator::new(registry, path)?.wait_for_n(min, timeout)
}

/// Wait for the child `child` of `path` to exist and return its data.
pub fn wait_for_child(
    registry: Arc<dyn Registry>,
    path: &str,
    child: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    RegistryWatchCoordinator::for_child(registry, path, child)?.wait_for_one(timeout)
}
