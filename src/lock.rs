// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Per-account advisory locking.
//!
//! Multi-account operations acquire every lock in canonical id order and
//! release in reverse, so two concurrent transfers A→B and B→A serialize
//! instead of deadlocking. Locks are process-local; horizontal replication
//! needs a distributed lock with the same acquisition discipline.

use crate::base::{AccountId, CancelToken};
use crate::error::LedgerError;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;
use std::time::Duration;

type Guard = ArcMutexGuard<RawMutex, ()>;

/// How long one blocking attempt waits before re-checking cancellation.
const ACQUIRE_SLICE: Duration = Duration::from_millis(50);

/// Cooperative mutual exclusion keyed by account id.
///
/// Entries are created lazily on first use and retained for the process
/// lifetime; the working set is bounded by the number of active accounts.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, id: AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `work` while holding the locks for every id in `ids`.
    ///
    /// The id set is deduplicated and sorted into canonical order before
    /// acquisition; every caller uses the same order, so no cyclic wait is
    /// possible. Acquisition blocks but honors `cancel` between bounded
    /// waiting slices.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Cancelled`] if the token fires before all
    /// locks are held; any locks already held are released.
    pub fn with_locks<R>(
        &self,
        ids: &[AccountId],
        cancel: &CancelToken,
        work: impl FnOnce() -> R,
    ) -> Result<R, LedgerError> {
        let mut ordered: Vec<AccountId> = ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards: Vec<Guard> = Vec::with_capacity(ordered.len());
        for id in ordered {
            let mutex = self.handle(id);
            loop {
                if cancel.is_cancelled() {
                    release_reverse(&mut guards);
                    return Err(LedgerError::Cancelled);
                }
                if let Some(guard) = mutex.try_lock_arc_for(ACQUIRE_SLICE) {
                    guards.push(guard);
                    break;
                }
            }
        }

        let result = work();
        release_reverse(&mut guards);
        Ok(result)
    }

    /// Number of lock entries materialized so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

fn release_reverse(guards: &mut Vec<Guard>) {
    while let Some(guard) = guards.pop() {
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[test]
    fn with_locks_runs_work() {
        let manager = LockManager::new();
        let id = AccountId::new();
        let result = manager
            .with_locks(&[id], &CancelToken::new(), || 42)
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn duplicate_ids_acquire_once() {
        let manager = LockManager::new();
        let id = AccountId::new();
        // Would self-deadlock if the duplicate were acquired twice.
        manager
            .with_locks(&[id, id], &CancelToken::new(), || ())
            .unwrap();
    }

    #[test]
    fn opposing_orderings_do_not_deadlock() {
        let manager = Arc::new(LockManager::new());
        let a = AccountId::new();
        let b = AccountId::new();
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for flip in [false, true] {
            for _ in 0..8 {
                let manager = manager.clone();
                let counter = counter.clone();
                let ids = if flip { vec![b, a] } else { vec![a, b] };
                handles.push(thread::spawn(move || {
                    for _ in 0..200 {
                        manager
                            .with_locks(&ids, &CancelToken::new(), || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                }));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16 * 200);
    }

    #[test]
    fn cancellation_aborts_waiting_acquisition() {
        let manager = Arc::new(LockManager::new());
        let id = AccountId::new();
        let cancel = CancelToken::new();

        let blocker_manager = manager.clone();
        let blocker_cancel = CancelToken::new();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let blocker = thread::spawn(move || {
            blocker_manager
                .with_locks(&[id], &blocker_cancel, || {
                    release_rx.recv().unwrap();
                })
                .unwrap();
        });

        // Give the blocker time to take the lock, then cancel a waiter.
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        let result = manager.with_locks(&[id], &cancel, || ());
        assert_eq!(result, Err(LedgerError::Cancelled));

        release_tx.send(()).unwrap();
        blocker.join().unwrap();
    }
}
