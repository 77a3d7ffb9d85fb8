// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-VM mutual exclusion.
//!
//! Every operation that may mutate a VM or its disks and ports holds that
//! VM's lock from its first read of remote state until it has produced the
//! resulting state. Operations never hold two VM locks at once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use vstack_types::VmId;

type VmLock = Arc<tokio::sync::Mutex<()>>;

/// Hands out exactly one lock per VM identifier for the life of the
/// registry. Entries are never evicted.
#[derive(Debug, Default)]
pub struct VmLocks {
    locks: Mutex<BTreeMap<VmId, VmLock>>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `id`, creating it on first use.
    pub fn handle(&self, id: VmId) -> VmLock {
        let mut locks =
            self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    /// Waits for exclusive access to the VM `id`. Access is released when the
    /// returned guard is dropped.
    pub async fn acquire(&self, id: VmId) -> OwnedMutexGuard<()> {
        self.handle(id).lock_owned().await
    }

    /// The number of VMs a lock has been handed out for.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
