//! Desired vs actual diffing. Pure; all I/O happens in the tick.

use crate::runtime::RuntimeProcess;
use crate::service::{ServiceKey, ServiceRecord, ServiceStatus};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Build and start. `replace` is set when the backend still holds a
    /// dead process for the key.
    Create {
        record: ServiceRecord,
        replace: bool,
    },

    /// Rebuild and push a changed spec to a live process.
    Update { record: ServiceRecord },

    Delete { key: ServiceKey },

    /// Copy the backend's view of a live process into the record.
    SyncStatus {
        key: ServiceKey,
        status: ServiceStatus,
    },
}

impl Action {
    pub fn key(&self) -> ServiceKey {
        match self {
            Action::Create { record, .. } | Action::Update { record } => record.key(),
            Action::Delete { key } | Action::SyncStatus { key, .. } => key.clone(),
        }
    }
}

pub fn plan(records: &[ServiceRecord], processes: &[RuntimeProcess]) -> Vec<Action> {
    let mut live: HashMap<ServiceKey, &RuntimeProcess> = HashMap::new();
    let mut dead: HashSet<ServiceKey> = HashSet::new();
    for process in processes {
        if process.status.is_terminal() {
            dead.insert(process.key());
        } else {
            live.insert(process.key(), process);
        }
    }

    let desired: BTreeMap<ServiceKey, &ServiceRecord> = records
        .iter()
        .filter(|r| r.status() != &ServiceStatus::Stopped)
        .map(|r| (r.key(), r))
        .collect();

    let mut actions = Vec::new();
    for (key, record) in &desired {
        if record.status().is_held() {
            continue;
        }
        match live.get(key) {
            None => actions.push(Action::Create {
                record: (*record).clone(),
                replace: dead.contains(key),
            }),
            Some(_) if record.needs_update() => actions.push(Action::Update {
                record: (*record).clone(),
            }),
            Some(process) if &process.status != record.status() => {
                actions.push(Action::SyncStatus {
                    key: key.clone(),
                    status: process.status.clone(),
                })
            }
            Some(_) => {}
        }
    }

    let mut orphans: Vec<ServiceKey> = live
        .keys()
        .chain(dead.iter())
        .filter(|key| !desired.contains_key(*key))
        .cloned()
        .collect();
    orphans.sort();
    orphans.dedup();
    actions.extend(orphans.into_iter().map(|key| Action::Delete { key }));

    actions
}
