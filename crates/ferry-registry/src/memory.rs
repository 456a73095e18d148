use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ferry_config::RegistryConfig;
use parking_lot::{Mutex, ReentrantMutex};

use crate::path::{name_of, parent_of, validate_path};
use crate::{same_watcher, Registry, RegistryError, RegistryWatcher, Result};

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    next_sequence: u64,
}

/// In-process [`Registry`].
///
/// Watchers are invoked on the mutating thread after the tree lock is released. Deliveries
/// are serialized, and each one carries the child set as of delivery, so a watcher never
/// observes an older set after a newer one.
pub struct MemoryRegistry {
    nodes: Mutex<BTreeMap<String, Node>>,
    watchers: Mutex<HashMap<String, Vec<Arc<dyn RegistryWatcher>>>>,
    delivery: ReentrantMutex<()>,
    sequence_width: usize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(&RegistryConfig::default())
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("nodes", &self.nodes.lock().len())
            .field("sequence_width", &self.sequence_width)
            .finish()
    }
}

impl MemoryRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self {
            nodes: Mutex::new(nodes),
            watchers: Mutex::new(HashMap::new()),
            delivery: ReentrantMutex::new(()),
            sequence_width: config.sequence_width,
        }
    }

    pub fn watcher_count(&self, path: &str) -> usize {
        self.watchers.lock().get(path).map_or(0, Vec::len)
    }

    fn notify(&self, changed: Vec<String>) {
        if changed.is_empty() {
            return;
        }
        let _delivery = self.delivery.lock();
        for path in changed {
            let watchers = match self.watchers.lock().get(&path) {
                Some(watchers) if !watchers.is_empty() => watchers.clone(),
                _ => continue,
            };
            let children = {
                let nodes = self.nodes.lock();
                if nodes.contains_key(&path) {
                    direct_children(&nodes, &path)
                } else {
                    Vec::new()
                }
            };
            tracing::trace!(
                target: "ferry.registry",
                path = %path,
                children = children.len(),
                watchers = watchers.len(),
                "delivering child change"
            );
            for watcher in watchers {
                watcher.on_children_changed(&path, &children);
            }
        }
    }
}

fn direct_children(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter(|(key, _)| key.len() > prefix.len() && !key[prefix.len()..].contains('/'))
        .map(|(key, _)| key[prefix.len()..].to_string())
        .collect()
}

fn descendants(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = format!("{path}/");
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .map(|(key, _)| key.clone())
        .collect()
}

impl Registry for MemoryRegistry {
    fn add_data(&self, path: &str, sequential: bool, data: &[u8]) -> Result<String> {
        validate_path(path)?;
        let Some(parent) = parent_of(path) else {
            return Err(RegistryError::InvalidPath {
                path: path.to_string(),
            });
        };

        let mut changed = Vec::new();
        let written = {
            let mut nodes = self.nodes.lock();

            // Create missing ancestors, outermost first.
            let mut missing = Vec::new();
            let mut cursor = parent;
            while !nodes.contains_key(cursor) {
                missing.push(cursor.to_string());
                match parent_of(cursor) {
                    Some(up) => cursor = up,
                    None => break,
                }
            }
            for ancestor in missing.into_iter().rev() {
                if let Some(up) = parent_of(&ancestor) {
                    changed.push(up.to_string());
                }
                nodes.insert(ancestor, Node::default());
            }

            let written = if sequential {
                let parent_node = nodes.entry(parent.to_string()).or_default();
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{path}{seq:0width$}", width = self.sequence_width)
            } else {
                path.to_string()
            };

            match nodes.get_mut(&written) {
                Some(node) => node.data = data.to_vec(),
                None => {
                    nodes.insert(
                        written.clone(),
                        Node {
                            data: data.to_vec(),
                            next_sequence: 0,
                        },
                    );
                    changed.push(parent.to_string());
                }
            }
            written
        };

        tracing::debug!(target: "ferry.registry", path = %written, bytes = data.len(), "added node");
        changed.dedup();
        self.notify(changed);
        Ok(written)
    }

    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        validate_path(path)?;
        Ok(self.nodes.lock().get(path).map(|node| node.data.clone()))
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let nodes = self.nodes.lock();
        if !nodes.contains_key(path) {
            return Err(RegistryError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(direct_children(&nodes, path))
    }

    fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        validate_path(path)?;
        let Some(parent) = parent_of(path) else {
            return Err(RegistryError::InvalidPath {
                path: path.to_string(),
            });
        };

        let mut changed = Vec::new();
        {
            let mut nodes = self.nodes.lock();
            if !nodes.contains_key(path) {
                return Err(RegistryError::NoNode {
                    path: path.to_string(),
                });
            }
            let below = descendants(&nodes, path);
            if !below.is_empty() && !recursive {
                return Err(RegistryError::NotEmpty {
                    path: path.to_string(),
                });
            }
            // Watchers on removed subtrees see their children disappear.
            for descendant in below.iter().rev() {
                if let Some(up) = parent_of(descendant) {
                    changed.push(up.to_string());
                }
                nodes.remove(descendant);
            }
            nodes.remove(path);
            changed.push(parent.to_string());
        }

        tracing::debug!(
            target: "ferry.registry",
            path = %path,
            name = name_of(path),
            recursive,
            "removed node"
        );
        changed.dedup();
        self.notify(changed);
        Ok(())
    }

    fn add_watcher(&self, path: &str, watcher: Arc<dyn RegistryWatcher>) -> Result<()> {
        validate_path(path)?;
        let mut watchers = self.watchers.lock();
        let list = watchers.entry(path.to_string()).or_default();
        if !list.iter().any(|existing| same_watcher(existing, &watcher)) {
            list.push(watcher);
        }
        Ok(())
    }

    fn remove_watcher(&self, path: &str, watcher: &Arc<dyn RegistryWatcher>) -> Result<()> {
        validate_path(path)?;
        let mut watchers = self.watchers.lock();
        if let Some(list) = watchers.get_mut(path) {
            list.retain(|existing| !same_watcher(existing, watcher));
            if list.is_empty() {
                watchers.remove(path);
            }
        }
        Ok(())
    }
}
