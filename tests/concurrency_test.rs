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

//! Concurrency tests using parking_lot's built-in deadlock detector.
//!
//! These tests verify the locking discipline of the engine under
//! contention: concurrent mutations on one account serialize, opposing
//! transfers do not deadlock, duplicate references resolve to a single
//! transaction, and multi-account mutations are observed atomically.

use crossbeam::channel::Receiver;
use ledger_engine::{
    Amount, CancelToken, Engine, EventBus, MemoryStore, TransactionEvent, TransactionRequest,
};
use parking_lot::deadlock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// === Harness ===

struct Harness {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    _events: Receiver<TransactionEvent>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let (bus, events) = EventBus::bounded(16_384);
    Harness {
        engine: Arc::new(Engine::new(store.clone(), bus)),
        store,
        _events: events,
    }
}

fn request(operation: &str, account_id: &str, amount: i64, reference: &str) -> TransactionRequest {
    TransactionRequest {
        operation: operation.to_string(),
        account_id: account_id.to_string(),
        amount,
        currency: "USD".to_string(),
        reference_id: reference.to_string(),
        target_account_id: None,
        original_transaction_id: None,
        metadata: None,
    }
}

fn transfer(source: &str, target: &str, amount: i64, reference: &str) -> TransactionRequest {
    TransactionRequest {
        target_account_id: Some(target.to_string()),
        ..request("transfer", source, amount, reference)
    }
}

// === Deadlock Detection Infrastructure ===

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150)); // Let detector thread exit
}

// === Tests ===

/// N concurrent credits of value v on one account sum to exactly N*v.
#[test]
fn concurrent_credits_sum_exactly() {
    let detector = start_deadlock_detector();
    let h = harness();

    const NUM_THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 50;
    const AMOUNT: i64 = 1_000;

    let mut handles = Vec::with_capacity(NUM_THREADS);
    for thread_id in 0..NUM_THREADS {
        let engine = h.engine.clone();
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let reference = format!("CREDIT-{thread_id}-{i}");
                engine
                    .process(&request("credit", "ACC-HOT", AMOUNT, &reference), &CancelToken::new())
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    let account = h.engine.find_account("ACC-HOT").unwrap();
    assert_eq!(
        account.balance().minor(),
        (NUM_THREADS * OPS_PER_THREAD) as i64 * AMOUNT
    );
}

/// Opposing transfers A->B and B->A for equal amounts leave both balances
/// where they started, and never deadlock.
#[test]
fn opposing_transfers_preserve_balances() {
    let detector = start_deadlock_detector();
    let h = harness();

    let a = h.engine.open_account(Some("A".into()), Amount::ZERO);
    let b = h.engine.open_account(Some("B".into()), Amount::ZERO);
    let token = CancelToken::new();
    h.engine
        .process(&request("credit", "A", 100_000, "SEED-A"), &token)
        .unwrap();
    h.engine
        .process(&request("credit", "B", 100_000, "SEED-B"), &token)
        .unwrap();

    const NUM_THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 25;
    const AMOUNT: i64 = 100;

    let mut handles = Vec::with_capacity(NUM_THREADS);
    for thread_id in 0..NUM_THREADS {
        let engine = h.engine.clone();
        // Half the threads transfer A->B, half B->A.
        let (source, target) = if thread_id % 2 == 0 { ("A", "B") } else { ("B", "A") };
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let reference = format!("XFER-{thread_id}-{i}");
                let outcome = engine
                    .process(&transfer(source, target, AMOUNT, &reference), &CancelToken::new())
                    .unwrap();
                assert_eq!(outcome.response.status, "success");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    let a = h.engine.get_account(&a.id()).unwrap();
    let b = h.engine.get_account(&b.id()).unwrap();
    assert_eq!(a.balance().minor(), 100_000);
    assert_eq!(b.balance().minor(), 100_000);
}

/// Concurrent submissions of the same reference id produce exactly one
/// transaction, and every response carries its id.
#[test]
fn duplicate_reference_race_yields_one_transaction() {
    let detector = start_deadlock_detector();
    let h = harness();

    const NUM_THREADS: usize = 16;

    let mut handles = Vec::with_capacity(NUM_THREADS);
    for _ in 0..NUM_THREADS {
        let engine = h.engine.clone();
        handles.push(thread::spawn(move || {
            engine
                .process(&request("credit", "ACC-RACE", 5_000, "TXN-42"), &CancelToken::new())
                .unwrap()
        }));
    }

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked"))
        .collect();

    stop_deadlock_detector(detector);

    let ids: HashSet<_> = outcomes
        .iter()
        .map(|o| o.response.transaction_id)
        .collect();
    assert_eq!(ids.len(), 1, "all responses carry the same transaction id");
    assert_eq!(outcomes.iter().filter(|o| !o.replayed).count(), 1);

    // Applied exactly once.
    let account = h.engine.find_account("ACC-RACE").unwrap();
    assert_eq!(account.balance().minor(), 5_000);
}

/// A reader outside the locks sees either the pre-state of both transfer
/// accounts or the post-state of both, never a half-applied transfer.
#[test]
fn transfer_mutations_are_observed_atomically() {
    let detector = start_deadlock_detector();
    let h = harness();

    let a = h.engine.open_account(Some("A".into()), Amount::ZERO);
    let b = h.engine.open_account(Some("B".into()), Amount::ZERO);
    let token = CancelToken::new();
    h.engine
        .process(&request("credit", "A", 500_000, "SEED-A"), &token)
        .unwrap();
    h.engine
        .process(&request("credit", "B", 500_000, "SEED-B"), &token)
        .unwrap();
    const TOTAL: i64 = 1_000_000;

    let running = Arc::new(AtomicBool::new(true));

    // Readers snapshot both accounts and assert conservation.
    let mut readers = Vec::new();
    for _ in 0..2 {
        let store = h.store.clone();
        let running = running.clone();
        let (a_id, b_id) = (a.id(), b.id());
        readers.push(thread::spawn(move || {
            let mut observations = 0u64;
            while running.load(Ordering::SeqCst) {
                let snapshot = store.snapshot_accounts(&[a_id, b_id]);
                let sum: i64 = snapshot
                    .iter()
                    .map(|account| account.as_ref().unwrap().balance().minor())
                    .sum();
                assert_eq!(sum, TOTAL, "observed a half-applied transfer");
                observations += 1;
            }
            observations
        }));
    }

    let mut writers = Vec::new();
    for thread_id in 0..4 {
        let engine = h.engine.clone();
        let (source, target) = if thread_id % 2 == 0 { ("A", "B") } else { ("B", "A") };
        writers.push(thread::spawn(move || {
            for i in 0..100 {
                let reference = format!("ATOMIC-{thread_id}-{i}");
                engine
                    .process(&transfer(source, target, 400, &reference), &CancelToken::new())
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.join().expect("Thread panicked");
    }
    running.store(false, Ordering::SeqCst);
    for reader in readers {
        let observations = reader.join().expect("Reader panicked");
        assert!(observations > 0, "reader never observed the accounts");
    }

    stop_deadlock_detector(detector);
}

/// Mixed reserve/capture/release traffic keeps the reservation invariants.
#[test]
fn contended_reservation_lifecycle_stays_consistent() {
    let detector = start_deadlock_detector();
    let h = harness();

    h.engine
        .process(&request("credit", "ACC-RES", 1_000_000, "SEED"), &CancelToken::new())
        .unwrap();

    const NUM_THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 30;

    let mut handles = Vec::with_capacity(NUM_THREADS);
    for thread_id in 0..NUM_THREADS {
        let engine = h.engine.clone();
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let token = CancelToken::new();
                let reserve_ref = format!("RES-{thread_id}-{i}");
                let outcome = engine
                    .process(&request("reserve", "ACC-RES", 500, &reserve_ref), &token)
                    .unwrap();
                if outcome.response.status != "success" {
                    continue;
                }
                // Capture half of them, reverse the rest.
                if i % 2 == 0 {
                    let capture_ref = format!("CAP-{thread_id}-{i}");
                    engine
                        .process(&request("capture", "ACC-RES", 500, &capture_ref), &token)
                        .unwrap();
                } else {
                    let reversal_ref = format!("REL-{thread_id}-{i}");
                    let reversal = TransactionRequest {
                        original_transaction_id: Some(
                            outcome.response.transaction_id.to_string(),
                        ),
                        ..request("reversal", "ACC-RES", 500, &reversal_ref)
                    };
                    engine.process(&reversal, &token).unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    let account = h.engine.find_account("ACC-RES").unwrap();
    assert!(account.reserved().minor() >= 0);
    assert!(account.balance().minor() + account.credit_limit().minor() >= account.reserved().minor());
}
