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

//! In-process domain events.
//!
//! A bounded multi-producer/multi-consumer queue drained by a background
//! worker thread. Publishing never blocks: under overload events are
//! dropped and counted rather than stalling request processing. Delivery
//! is at-least-once; ordering across events is not guaranteed.

use crate::amount::Amount;
use crate::base::{AccountId, EventId, TransactionId};
use crate::error::LedgerError;
use crate::transaction::{OperationType, TransactionStatus};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Emitted after every processed transaction, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionEvent {
    pub event_id: EventId,
    pub transaction_id: TransactionId,
    pub reference_id: String,
    pub account_id: AccountId,
    pub operation: OperationType,
    pub status: TransactionStatus,
    pub amount: Amount,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

/// Bounded event queue handle held by the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<TransactionEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a bus with the given queue capacity, returning the consumer
    /// end for a worker.
    pub fn bounded(capacity: usize) -> (Self, Receiver<TransactionEvent>) {
        let (sender, receiver) = bounded(capacity);
        let bus = Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (bus, receiver)
    }

    /// Enqueues an event without blocking.
    ///
    /// A full queue drops the event and records it in the overflow counter.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EventBusClosed`] once every receiver is gone.
    pub fn publish(&self, event: TransactionEvent) -> Result<(), LedgerError> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    transaction_id = %event.transaction_id,
                    dropped_total = total,
                    "event queue full, dropping event"
                );
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(LedgerError::EventBusClosed),
        }
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Background worker draining the event queue until shutdown.
#[derive(Debug)]
pub struct EventWorker {
    handle: JoinHandle<u64>,
    shutdown: Arc<AtomicBool>,
}

impl EventWorker {
    const POLL: Duration = Duration::from_millis(100);

    /// Spawns the worker thread.
    ///
    /// The handler runs once per event; a handler error is logged and the
    /// event skipped, it never stops the worker or blocks publishers.
    pub fn spawn<F>(receiver: Receiver<TransactionEvent>, mut handler: F) -> Self
    where
        F: FnMut(&TransactionEvent) -> Result<(), LedgerError> + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::spawn(move || {
            let mut processed = 0u64;
            loop {
                match receiver.recv_timeout(Self::POLL) {
                    Ok(event) => {
                        Self::handle_one(&mut handler, &event);
                        processed += 1;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if flag.load(Ordering::SeqCst) {
                            // Drain what is already queued, then exit.
                            while let Ok(event) = receiver.try_recv() {
                                Self::handle_one(&mut handler, &event);
                                processed += 1;
                            }
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(processed, "event worker stopped");
            processed
        });
        Self { handle, shutdown }
    }

    fn handle_one<F>(handler: &mut F, event: &TransactionEvent)
    where
        F: FnMut(&TransactionEvent) -> Result<(), LedgerError>,
    {
        if let Err(error) = handler(event) {
            warn!(
                event_id = %event.event_id,
                transaction_id = %event.transaction_id,
                %error,
                "event handler failed, skipping event"
            );
        }
    }

    /// Signals shutdown and waits for the remaining queue to drain.
    /// Returns the number of events processed over the worker's lifetime.
    pub fn shutdown(self) -> u64 {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.join().unwrap_or_default()
    }
}
