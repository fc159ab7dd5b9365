//! Named workspace store and its change notifications.

use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::RwLock;
use strum_macros::Display;
use tokio::sync::broadcast;

use crate::table::TableWorkspace;

/// Capacity of the notification channel. Subscribers that fall further behind than this
/// receive a lag error and must resynchronise.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Kind of data held by a workspace
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum WorkspaceKind {
    /// Raw, time-stamped neutron events
    Event,
    /// Binned data
    Histogram,
    /// Tabular data
    Table,
    /// A group of other workspaces
    Group,
}

/// Logical view of a workspace, as far as scheduling is concerned.
#[derive(Clone, Debug, PartialEq)]
pub struct Workspace {
    pub kind: WorkspaceKind,
    /// Total duration of the run in seconds
    pub run_duration: Option<f64>,
    /// Total proton charge of the run
    pub proton_charge: Option<f64>,
    /// Scale factor applied to the data
    pub scale_factor: f64,
    /// Names of member workspaces, for groups
    pub members: Vec<String>,
    /// Free-form properties (sample logs, history, ...)
    pub properties: BTreeMap<String, String>,
    /// Table contents, for table workspaces
    pub table: Option<TableWorkspace>,
}

impl Workspace {
    fn with_kind(kind: WorkspaceKind) -> Self {
        Workspace {
            kind,
            run_duration: None,
            proton_charge: None,
            scale_factor: 1.0,
            members: Vec::new(),
            properties: BTreeMap::new(),
            table: None,
        }
    }

    /// An event workspace for a run of the given duration and proton charge.
    pub fn event(run_duration: f64, proton_charge: f64) -> Self {
        Workspace {
            run_duration: Some(run_duration),
            proton_charge: Some(proton_charge),
            ..Self::with_kind(WorkspaceKind::Event)
        }
    }

    pub fn histogram() -> Self {
        Self::with_kind(WorkspaceKind::Histogram)
    }

    pub fn group(members: Vec<String>) -> Self {
        Workspace {
            members,
            ..Self::with_kind(WorkspaceKind::Group)
        }
    }

    pub fn table(table: TableWorkspace) -> Self {
        Workspace {
            table: Some(table),
            ..Self::with_kind(WorkspaceKind::Table)
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

/// Change notification published by a workspace store.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    Added(String),
    Removed(String),
    Renamed { old: String, new: String },
    Cleared,
    Replaced(String),
}

/// Trait for workspace stores.
///
/// A store is shared between the scheduler and the background execution slot and must be
/// internally synchronised.
pub trait WorkspaceStore: Send + Sync {
    fn exists(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> Option<Workspace>;

    /// Add or replace a workspace.
    fn put(&self, name: &str, workspace: Workspace);

    /// Remove a workspace. Returns whether it existed.
    fn remove(&self, name: &str) -> bool;

    /// Rename a workspace. Returns whether it existed.
    fn rename(&self, old: &str, new: &str) -> bool;

    fn clear(&self);

    /// Names of all workspaces, sorted.
    fn names(&self) -> Vec<String>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// In-memory [WorkspaceStore].
#[derive(Debug)]
pub struct InMemoryWorkspaceStore {
    workspaces: RwLock<HashMap<String, Workspace>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryWorkspaceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkspaceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        InMemoryWorkspaceStore {
            workspaces: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Workspace>> {
        self.workspaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Workspace>> {
        self.workspaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WorkspaceStore for InMemoryWorkspaceStore {
    fn exists(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Workspace> {
        self.read().get(name).cloned()
    }

    fn put(&self, name: &str, workspace: Workspace) {
        let previous = self.write().insert(name.to_string(), workspace);
        match previous {
            Some(_) => self.notify(StoreEvent::Replaced(name.to_string())),
            None => self.notify(StoreEvent::Added(name.to_string())),
        }
    }

    fn remove(&self, name: &str) -> bool {
        let removed = self.write().remove(name).is_some();
        if removed {
            self.notify(StoreEvent::Removed(name.to_string()));
        }
        removed
    }

    fn rename(&self, old: &str, new: &str) -> bool {
        let renamed = {
            let mut workspaces = self.write();
            match workspaces.remove(old) {
                Some(workspace) => {
                    workspaces.insert(new.to_string(), workspace);
                    true
                }
                None => false,
            }
        };
        if renamed {
            self.notify(StoreEvent::Renamed {
                old: old.to_string(),
                new: new.to_string(),
            });
        }
        renamed
    }

    fn clear(&self) {
        self.write().clear();
        self.notify(StoreEvent::Cleared);
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
