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

//! # Ledger Engine
//!
//! A concurrent financial ledger engine. Clients submit typed
//! money-movement operations (credit, debit, reserve, capture, transfer,
//! reversal) identified by a client-chosen reference id, and the engine
//! returns the authoritative post-operation balances of the affected
//! account.
//!
//! ## Core Components
//!
//! - [`Engine`]: orchestrates validation, idempotency, locking, the
//!   storage transaction and event emission
//! - [`Account`]: balance aggregate enforcing the money invariants
//! - [`Transaction`]: immutable-once-terminal record of a request and its
//!   outcome
//! - [`LockManager`]: per-account mutexes with deadlock-free multi-account
//!   acquisition
//! - [`MemoryStore`]: storage facade with optimistic concurrency and the
//!   unique reference index
//! - [`EventBus`]: bounded in-process event queue drained by a background
//!   worker
//!
//! ## Guarantees
//!
//! - A reference id is applied at most once; retries return the original
//!   outcome.
//! - Multi-account operations (transfer, reversal of transfer) are atomic:
//!   readers see the pre-state of both accounts or the post-state of both.
//! - Business-rule rejections are recorded as Failed transactions, not
//!   request errors.
//!
//! ## Thread Safety
//!
//! Many requests may be processed concurrently from any number of
//! threads; mutations on a single account are totally ordered by its
//! lock. Locks are process-local: horizontal replication requires a
//! distributed lock or single-writer sharding.

pub mod account;
pub mod amount;
pub mod base;
pub mod engine;
pub mod error;
pub mod event;
pub mod lock;
pub mod store;
pub mod transaction;
pub mod wire;

pub use account::{Account, AccountStatus};
pub use amount::Amount;
pub use base::{AccountId, CancelToken, EventId, TransactionId};
pub use engine::{Engine, ProcessOutcome};
pub use error::LedgerError;
pub use event::{EventBus, EventWorker, TransactionEvent};
pub use lock::LockManager;
pub use store::MemoryStore;
pub use transaction::{OperationType, Transaction, TransactionStatus};
pub use wire::{AccountResponse, OpenAccountRequest, TransactionRequest, TransactionResponse};
