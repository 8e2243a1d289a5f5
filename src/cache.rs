//! Process-wide aggregation of the latest poll results.
//!
//! Collectors write through the update methods, readers take a [`snapshot`]
//! and work on it without holding any lock. All value types own their data,
//! so cloning the state is a deep copy - later cache mutations are never
//! observable through a snapshot.
//!
//! [`snapshot`]: Cache::snapshot

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use pmon_api_types::{Backup, DatastoreStatus, Disk, Guest, Node, PbsTask};

/// Key of a backup within one PBS instance: `{datastore}/{backup_id}`.
pub fn backup_key(datastore: &str, backup_id: &str) -> String {
    format!("{}/{}", datastore, backup_id)
}

#[derive(Clone, Debug, Default, Serialize)]
/// Owned copy of the full cache state at one instant
pub struct CacheSnapshot {
    /// instance -> node name -> node
    pub nodes: HashMap<String, HashMap<String, Node>>,
    /// cluster id -> vmid -> guest
    pub guests: HashMap<String, HashMap<u64, Guest>>,
    /// disk identity -> disk
    pub disks: HashMap<String, Disk>,
    /// pbs instance -> datastore name -> status
    pub datastores: HashMap<String, HashMap<String, DatastoreStatus>>,
    /// pbs instance -> backup key -> latest backup
    pub backups: HashMap<String, HashMap<String, Backup>>,
    /// pbs instance -> recent tasks
    pub tasks: HashMap<String, Vec<PbsTask>>,
    /// collector name -> epoch of the last completed poll
    pub last_poll: HashMap<String, i64>,
}

#[derive(Default)]
pub struct Cache {
    state: RwLock<CacheSnapshot>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node map of one instance.
    pub fn update_nodes(&self, instance: &str, nodes: HashMap<String, Node>) {
        let mut state = self.state.write().unwrap();
        state.nodes.insert(instance.to_string(), nodes);
    }

    /// Replace the guest map of one cluster.
    pub fn update_guests(&self, cluster_id: &str, guests: HashMap<u64, Guest>) {
        let mut state = self.state.write().unwrap();
        state.guests.insert(cluster_id.to_string(), guests);
    }

    /// Merge disks by identity. A disk missed in one poll is not evicted.
    pub fn update_disks(&self, disks: HashMap<String, Disk>) {
        let mut state = self.state.write().unwrap();
        for (identity, disk) in disks {
            state.disks.insert(identity, disk);
        }
    }

    /// Replace the datastore map of one PBS instance.
    pub fn update_datastores(&self, pbs_instance: &str, datastores: HashMap<String, DatastoreStatus>) {
        let mut state = self.state.write().unwrap();
        state.datastores.insert(pbs_instance.to_string(), datastores);
    }

    /// Replace the backup map of one PBS instance.
    pub fn update_backups(&self, pbs_instance: &str, backups: HashMap<String, Backup>) {
        let mut state = self.state.write().unwrap();
        state.backups.insert(pbs_instance.to_string(), backups);
    }

    /// Replace the task list of one PBS instance. `None` (the task section
    /// was skipped this cycle) leaves the previous list in place.
    pub fn update_tasks(&self, pbs_instance: &str, tasks: Option<Vec<PbsTask>>) {
        if let Some(tasks) = tasks {
            let mut state = self.state.write().unwrap();
            state.tasks.insert(pbs_instance.to_string(), tasks);
        }
    }

    /// Set the temperature of an existing node entry. A no-op when the node
    /// is not (or no longer) cached.
    pub fn update_node_temperature(&self, instance: &str, node: &str, value: f64) {
        let mut state = self.state.write().unwrap();
        if let Some(entry) = state
            .nodes
            .get_mut(instance)
            .and_then(|nodes| nodes.get_mut(node))
        {
            entry.temperature = Some(value);
        }
    }

    /// Record per-collector liveness.
    pub fn set_last_poll(&self, collector: &str, time: i64) {
        let mut state = self.state.write().unwrap();
        state.last_poll.insert(collector.to_string(), time);
    }

    /// Deep copy of the full state in a single read-lock critical section.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.state.read().unwrap().clone()
    }
}
