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

//! Transaction processing engine.
//!
//! The [`Engine`] turns an incoming request into a durable balance mutation
//! under four guarantees:
//!
//! 1. **Idempotency** — the client reference id is claimed by committing a
//!    Pending record before any balance work; a replayed reference returns
//!    the prior outcome and never mutates.
//! 2. **Mutual exclusion** — every account touched by the operation is
//!    locked in canonical order for the duration of the mutation.
//! 3. **Atomicity** — mutated accounts and the Completed record commit in
//!    one storage transaction; any failure inside rolls everything back.
//! 4. **Events** — an outbound event is published after every outcome,
//!    success or failure, without blocking the request.
//!
//! Business-rule rejections (insufficient funds and friends) are not
//! request errors: the transaction is persisted as Failed and returned
//! with `status="failed"`.

use crate::account::{Account, AccountStatus};
use crate::amount::Amount;
use crate::base::{AccountId, CancelToken, EventId, TransactionId};
use crate::error::LedgerError;
use crate::event::{EventBus, TransactionEvent};
use crate::lock::LockManager;
use crate::store::{MemoryStore, StoreTx};
use crate::transaction::{OperationType, Transaction, TransactionStatus};
use crate::wire::{TransactionRequest, TransactionResponse};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Attempts of the locked mutate/commit cycle before a concurrency
/// conflict is surfaced to the caller. Conflicts can only come from
/// out-of-band writers, since the lock set serializes engine writers.
const COMMIT_RETRIES: usize = 3;

/// Result of processing one request.
pub struct ProcessOutcome {
    pub response: TransactionResponse,
    /// True when the reference id matched a prior transaction and its
    /// projection was returned without mutation. The HTTP layer maps this
    /// to 200 instead of 201.
    pub replayed: bool,
}

/// The transaction-processing engine.
pub struct Engine {
    store: Arc<MemoryStore>,
    locks: LockManager,
    bus: EventBus,
}

impl Engine {
    pub fn new(store: Arc<MemoryStore>, bus: EventBus) -> Self {
        Self {
            store,
            locks: LockManager::new(),
            bus,
        }
    }

    /// Provisions an account, optionally with an external identity and a
    /// credit limit. Provisioning an already-known external identity
    /// returns the existing account.
    pub fn open_account(&self, external_id: Option<String>, credit_limit: Amount) -> Account {
        self.store
            .insert_account(Account::new(external_id, credit_limit))
    }

    pub fn get_account(&self, id: &AccountId) -> Option<Account> {
        self.store.get_account(id)
    }

    /// Looks up an account by opaque id or external identity, never
    /// creating one.
    pub fn find_account(&self, raw: &str) -> Option<Account> {
        match AccountId::parse(raw) {
            Ok(id) => self.store.get_account(&id),
            Err(_) => self.store.find_account_by_external(raw),
        }
    }

    pub fn get_transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.store.get_transaction(id)
    }

    /// Read-back projection of a stored transaction against the current
    /// balances of its account.
    pub fn transaction_response(&self, id: &TransactionId) -> Option<TransactionResponse> {
        let record = self.store.get_transaction(id)?;
        let account = self.store.get_account(&record.account_id())?;
        Some(TransactionResponse::project(&record, &account))
    }

    /// Pending records awaiting reconciliation (stranded by a crash
    /// between the pending-insert commit and the locked commit).
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.store.pending_transactions()
    }

    /// Events dropped by the bus under overload.
    pub fn dropped_events(&self) -> u64 {
        self.bus.dropped()
    }

    /// Administrative status change, serialized with money movements on
    /// the same account.
    pub fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        cancel: &CancelToken,
    ) -> Result<Account, LedgerError> {
        self.locks.with_locks(&[id], cancel, || {
            let mut tx = self.store.begin();
            let mut account = tx.read_account(id)?;
            account.set_status(status);
            let snapshot = account.clone();
            tx.stage_account(account);
            tx.commit()?;
            Ok(snapshot)
        })?
    }

    /// Processes one money-movement request.
    ///
    /// # Errors
    ///
    /// Validation and not-found errors abort before any record is created.
    /// Business-rule rejections return `Ok` with a Failed projection.
    /// `Cancelled` and `ConcurrencyConflict` leave a Pending record behind
    /// that is discoverable via [`Engine::pending_transactions`].
    pub fn process(
        &self,
        request: &TransactionRequest,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome, LedgerError> {
        if request.reference_id.trim().is_empty() {
            return Err(LedgerError::EmptyReference);
        }

        let account = self.resolve_account(&request.account_id)?;

        // Idempotency short-circuit before any other work.
        if let Some(prior) = self.store.find_by_reference(&request.reference_id) {
            return self.replay(prior);
        }

        let operation = OperationType::parse(&request.operation)?;
        let amount = Amount::from_minor(request.amount);
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount);
        }

        let target = match operation {
            OperationType::Transfer => {
                let raw = request
                    .target_account_id
                    .as_deref()
                    .ok_or(LedgerError::MissingTarget)?;
                Some(self.resolve_target(raw)?)
            }
            _ => None,
        };

        // The original is loaded up front so the lock set can cover both
        // accounts of a reversed transfer; its status is re-checked under
        // the locks.
        let original = match operation {
            OperationType::Reversal => {
                let raw = request
                    .original_transaction_id
                    .as_deref()
                    .ok_or(LedgerError::MissingOriginal)?;
                let id = TransactionId::parse(raw)
                    .map_err(|_| LedgerError::MalformedTransactionId(raw.to_string()))?;
                Some(
                    self.store
                        .get_transaction(&id)
                        .ok_or(LedgerError::OriginalNotFound)?,
                )
            }
            _ => None,
        };

        // A reversal is recorded against the original's accounts and for
        // the original's amount; other operations use the request values.
        let (record_amount, record_account, record_target) = match &original {
            Some(original) => (
                original.amount(),
                original.account_id(),
                original.target_account_id(),
            ),
            None => (amount, account.id(), target.as_ref().map(Account::id)),
        };

        let record = Transaction::new(
            request.reference_id.clone(),
            operation,
            record_amount,
            record_account,
            record_target,
            original.as_ref().map(Transaction::id),
            request.metadata.clone(),
        )?;

        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        // Commit the Pending record on its own so the reference is claimed
        // even if the mutation later fails or the process dies.
        let mut pending = self.store.begin();
        pending.stage_transaction(record.clone());
        match pending.commit() {
            Ok(()) => {}
            Err(LedgerError::DuplicateReference(_)) => {
                // Lost the insert race: return the winner's projection.
                let winner = self
                    .store
                    .find_by_reference(&request.reference_id)
                    .ok_or(LedgerError::ConcurrencyConflict)?;
                return self.replay(winner);
            }
            Err(error) => return Err(error),
        }

        let mut lock_ids = vec![record.account_id()];
        if let Some(target_id) = record.target_account_id() {
            lock_ids.push(target_id);
        }

        let locked = self.locks.with_locks(&lock_ids, cancel, || {
            self.execute(record.id(), operation, amount)
        })?;

        match locked {
            Ok((completed, primary)) => {
                info!(
                    transaction_id = %completed.id(),
                    reference_id = %completed.reference_id(),
                    operation = operation.as_str(),
                    amount = %completed.amount(),
                    "transaction completed"
                );
                self.publish(&completed, &request.currency);
                Ok(ProcessOutcome {
                    response: TransactionResponse::project(&completed, &primary),
                    replayed: false,
                })
            }
            Err(error) if error.is_business_rule() => {
                let failed = self.fail_record(record.id(), &error)?;
                warn!(
                    transaction_id = %failed.id(),
                    reference_id = %failed.reference_id(),
                    operation = operation.as_str(),
                    reason = %error,
                    "transaction failed"
                );
                self.publish(&failed, &request.currency);
                let current = self
                    .store
                    .get_account(&failed.account_id())
                    .ok_or(LedgerError::ConcurrencyConflict)?;
                Ok(ProcessOutcome {
                    response: TransactionResponse::project(&failed, &current),
                    replayed: false,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Step 1: opaque ids must exist; anything else is an external
    /// identity, created on first use with zero credit limit.
    fn resolve_account(&self, raw: &str) -> Result<Account, LedgerError> {
        match AccountId::parse(raw) {
            Ok(id) => self
                .store
                .get_account(&id)
                .ok_or_else(|| LedgerError::AccountNotFound(raw.to_string())),
            Err(_) => Ok(self.store.get_or_create_by_external(raw)),
        }
    }

    /// Transfer targets are never auto-created.
    fn resolve_target(&self, raw: &str) -> Result<Account, LedgerError> {
        let found = match AccountId::parse(raw) {
            Ok(id) => self.store.get_account(&id),
            Err(_) => self.store.find_account_by_external(raw),
        };
        found.ok_or_else(|| LedgerError::TargetNotFound(raw.to_string()))
    }

    fn replay(&self, prior: Transaction) -> Result<ProcessOutcome, LedgerError> {
        let account = self
            .store
            .get_account(&prior.account_id())
            .ok_or_else(|| LedgerError::AccountNotFound(prior.account_id().to_string()))?;
        Ok(ProcessOutcome {
            response: TransactionResponse::project(&prior, &account),
            replayed: true,
        })
    }

    /// The locked mutate/commit cycle, retried on optimistic conflicts.
    fn execute(
        &self,
        id: TransactionId,
        operation: OperationType,
        amount: Amount,
    ) -> Result<(Transaction, Account), LedgerError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.execute_once(id, operation, amount) {
                Err(LedgerError::ConcurrencyConflict) if attempts < COMMIT_RETRIES => continue,
                other => return other,
            }
        }
    }

    fn execute_once(
        &self,
        id: TransactionId,
        operation: OperationType,
        amount: Amount,
    ) -> Result<(Transaction, Account), LedgerError> {
        let mut tx = self.store.begin();
        let mut record = tx.read_transaction(id)?;
        let mut primary = tx.read_account(record.account_id())?;

        match operation {
            OperationType::Credit => primary.add_credit(amount)?,
            OperationType::Debit => primary.debit(amount)?,
            OperationType::Reserve => primary.reserve(amount)?,
            OperationType::Capture => primary.capture(amount)?,
            OperationType::Transfer => {
                let target_id = record
                    .target_account_id()
                    .expect("transfer record carries a target");
                if target_id == primary.id() {
                    primary.debit(amount)?;
                    primary.add_credit(amount)?;
                } else {
                    let mut target = tx.read_account(target_id)?;
                    primary.debit(amount)?;
                    target.add_credit(amount)?;
                    tx.stage_account(target);
                }
            }
            OperationType::Reversal => {
                let original_id = record
                    .original_transaction_id()
                    .expect("reversal record carries an original");
                let mut original = tx.read_transaction(original_id)?;
                self.invert(&mut tx, &mut primary, &mut original)?;
                tx.stage_transaction(original);
            }
        }

        record.mark_completed()?;
        let snapshot = primary.clone();
        tx.stage_account(primary);
        tx.stage_transaction(record.clone());
        tx.commit()?;
        Ok((record, snapshot))
    }

    /// Applies the inverse of a Completed transaction's effect and marks
    /// it Reversed. `primary` is the original's source account, already
    /// read through `tx`.
    fn invert(
        &self,
        tx: &mut StoreTx<'_>,
        primary: &mut Account,
        original: &mut Transaction,
    ) -> Result<(), LedgerError> {
        match original.status() {
            TransactionStatus::Completed => {}
            TransactionStatus::Reversed => return Err(LedgerError::AlreadyReversed),
            _ => return Err(LedgerError::NonReversible),
        }

        let amount = original.amount();
        match original.operation() {
            OperationType::Credit => primary.debit(amount)?,
            OperationType::Debit => primary.add_credit(amount)?,
            OperationType::Reserve => primary.release_reservation(amount)?,
            OperationType::Capture => {
                // Restores the balance and re-instates the reservation the
                // capture consumed.
                primary.add_credit(amount)?;
                primary.reserve(amount)?;
            }
            OperationType::Transfer => {
                let target_id = original
                    .target_account_id()
                    .expect("transfer record carries a target");
                if target_id == primary.id() {
                    primary.debit(amount)?;
                    primary.add_credit(amount)?;
                } else {
                    let mut target = tx.read_account(target_id)?;
                    target.debit(amount)?;
                    primary.add_credit(amount)?;
                    tx.stage_account(target);
                }
            }
            OperationType::Reversal => return Err(LedgerError::NonReversible),
        }

        original.mark_reversed()
    }

    /// Persists the Failed outcome outside the rolled-back transaction.
    fn fail_record(
        &self,
        id: TransactionId,
        error: &LedgerError,
    ) -> Result<Transaction, LedgerError> {
        let mut tx = self.store.begin();
        let mut record = tx.read_transaction(id)?;
        record.mark_failed(error.to_string())?;
        tx.stage_transaction(record.clone());
        tx.commit()?;
        Ok(record)
    }

    fn publish(&self, record: &Transaction, currency: &str) {
        let event = TransactionEvent {
            event_id: EventId::new(),
            transaction_id: record.id(),
            reference_id: record.reference_id().to_string(),
            account_id: record.account_id(),
            operation: record.operation(),
            status: record.status(),
            amount: record.amount(),
            currency: currency.to_string(),
            occurred_at: Utc::now(),
        };
        // Best-effort after the commit; a closed bus must not fail the
        // already-durable transaction.
        if let Err(error) = self.bus.publish(event) {
            warn!(
                transaction_id = %record.id(),
                %error,
                "failed to publish transaction event"
            );
        }
    }
}
