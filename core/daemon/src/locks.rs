//! Device Lock Table.
//!
//! Maps a device path to the one non-terminal session holding it. `acquire`
//! checks and claims under a single mutex, so concurrent start requests for a
//! device are decided by who takes the mutex first.

use camstream_protocol::SessionRecord;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub device: String,
    pub holder: String,
}

/// Two or more live records claiming the same device at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Device {device} is claimed by multiple live sessions: {}", .session_ids.join(", "))]
pub struct LockCorruption {
    pub device: String,
    pub session_ids: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DeviceLocks {
    held: Mutex<HashMap<String, String>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from persisted records, holding a device for every
    /// non-terminal session.
    pub fn rebuild(records: &[SessionRecord]) -> Result<Self, Vec<LockCorruption>> {
        let mut claims: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for record in records.iter().filter(|record| !record.status.is_terminal()) {
            claims
                .entry(record.device.as_str())
                .or_default()
                .push(record.id.as_str());
        }

        let corrupt: Vec<LockCorruption> = claims
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(device, ids)| LockCorruption {
                device: device.to_string(),
                session_ids: ids.iter().map(|id| id.to_string()).collect(),
            })
            .collect();
        if !corrupt.is_empty() {
            return Err(corrupt);
        }

        let held = claims
            .into_iter()
            .map(|(device, ids)| (device.to_string(), ids[0].to_string()))
            .collect();
        Ok(Self {
            held: Mutex::new(held),
        })
    }

    pub fn acquire(&self, device: &str, session_id: &str) -> Result<(), LockConflict> {
        let mut held = self.guard();
        match held.get(device) {
            Some(holder) if holder != session_id => Err(LockConflict {
                device: device.to_string(),
                holder: holder.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                held.insert(device.to_string(), session_id.to_string());
                Ok(())
            }
        }
    }

    /// Releases the device only if `session_id` is the current holder.
    pub fn release_if_held(&self, device: &str, session_id: &str) -> bool {
        let mut held = self.guard();
        if held.get(device).map(String::as_str) == Some(session_id) {
            held.remove(device);
            true
        } else {
            false
        }
    }

    pub fn holder(&self, device: &str) -> Option<String> {
        self.guard().get(device).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.guard()
            .iter()
            .map(|(device, holder)| (device.clone(), holder.clone()))
            .collect()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, String>> {
        lock_unpoisoned(&self.held)
    }
}

/// Locks a mutex whose data stays consistent across a panicking holder,
/// i.e. every critical section is a single insert, remove or swap.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
