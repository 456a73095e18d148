use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::element::ClasspathFactory;
use crate::export::ClasspathEntry;
use crate::loader::ResourceLoader;
use crate::{ClasspathError, Result};

/// A loader scope registered with an exporter.
#[derive(Clone)]
pub enum ClasspathScope {
    /// An ordered list of entries, optionally chained to a parent scope.
    Flat {
        entries: Vec<ClasspathEntry>,
        parent: Option<ScopeId>,
    },
    /// A loader with no file representation; it can only answer resource lookups.
    Opaque {
        loader: Arc<dyn ResourceLoader>,
        parent: Option<ScopeId>,
    },
}

impl ClasspathScope {
    pub fn flat(entries: Vec<ClasspathEntry>) -> Self {
        ClasspathScope::Flat {
            entries,
            parent: None,
        }
    }

    pub fn parent(&self) -> Option<ScopeId> {
        match self {
            ClasspathScope::Flat { parent, .. } | ClasspathScope::Opaque { parent, .. } => *parent,
        }
    }

    /// The entries of a flat scope.
    pub(crate) fn entries(&self) -> Result<&[ClasspathEntry]> {
        match self {
            ClasspathScope::Flat { entries, .. } => Ok(entries),
            ClasspathScope::Opaque { .. } => Err(ClasspathError::UnsupportedLoaderShape),
        }
    }
}

impl fmt::Debug for ClasspathScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClasspathScope::Flat { entries, parent } => f
                .debug_struct("Flat")
                .field("entries", entries)
                .field("parent", parent)
                .finish(),
            ClasspathScope::Opaque { parent, .. } => {
                f.debug_struct("Opaque").field("parent", parent).finish()
            }
        }
    }
}

/// Handle to a registered scope. A released slot bumps its generation, so stale handles
/// are detected instead of aliasing a newer scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

pub(crate) struct ScopeRecord {
    pub(crate) scope: ClasspathScope,
    pub(crate) exported: Option<ClasspathFactory>,
}

struct Slot {
    generation: u32,
    record: Option<ScopeRecord>,
}

#[derive(Default)]
pub(crate) struct ScopeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ScopeArena {
    pub(crate) fn insert(&mut self, scope: ClasspathScope) -> ScopeId {
        let record = ScopeRecord {
            scope,
            exported: None,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return ScopeId {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        ScopeId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, id: ScopeId) -> Option<&ScopeRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ScopeId) -> Option<&mut ScopeRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    pub(crate) fn remove(&mut self, id: ScopeId) -> Option<ScopeRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(record)
    }

    /// Forget cached exports of `classpath_id` so the owning scope exports afresh.
    pub(crate) fn forget_export(&mut self, classpath_id: u64) {
        for slot in &mut self.slots {
            if let Some(record) = &mut slot.record {
                if record
                    .exported
                    .as_ref()
                    .is_some_and(|factory| factory.classpath_id == classpath_id)
                {
                    record.exported = None;
                }
            }
        }
    }
}
