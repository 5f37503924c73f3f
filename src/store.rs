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

//! Storage transaction facade.
//!
//! In-memory account and transaction stores with an atomic staged-write
//! transaction on top. Reads inside a [`StoreTx`] capture the account
//! version they observed; [`StoreTx::commit`] re-validates every staged
//! account against the live row and applies all writes or none, so a write
//! based on a stale read fails with `ConcurrencyConflict`.
//!
//! The reference index is the idempotency guarantee: one reference id maps
//! to exactly one transaction id, enforced atomically at commit.

use crate::account::Account;
use crate::amount::Amount;
use crate::base::{AccountId, TransactionId};
use crate::error::LedgerError;
use crate::transaction::{Transaction, TransactionStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Process-local storage engine for accounts and transactions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Account>,
    /// Unique index: external identity -> account id.
    external_index: DashMap<String, AccountId>,
    transactions: DashMap<TransactionId, Transaction>,
    /// Unique index: client reference id -> transaction id.
    reference_index: DashMap<String, TransactionId>,
    /// Serializes commit validation + apply so a commit is atomic.
    commit_gate: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a storage transaction.
    pub fn begin(&self) -> StoreTx<'_> {
        StoreTx {
            store: self,
            observed_versions: HashMap::new(),
            staged_accounts: Vec::new(),
            staged_transactions: Vec::new(),
        }
    }

    pub fn get_account(&self, id: &AccountId) -> Option<Account> {
        self.accounts.get(id).map(|entry| entry.value().clone())
    }

    pub fn find_account_by_external(&self, external_id: &str) -> Option<Account> {
        let id = *self.external_index.get(external_id)?;
        self.get_account(&id)
    }

    /// Loads the account for an external identity, creating a fresh Active
    /// account with zero credit limit on first use. Safe under concurrent
    /// creation: the external index decides a single winner.
    pub fn get_or_create_by_external(&self, external_id: &str) -> Account {
        let id = match self.external_index.entry(external_id.to_string()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let account = Account::new(Some(external_id.to_string()), Amount::ZERO);
                let id = account.id();
                // Publish the row before the index so a reader that wins the
                // index lookup always finds the account.
                self.accounts.insert(id, account);
                entry.insert(id);
                id
            }
        };
        self.accounts
            .get(&id)
            .map(|entry| entry.value().clone())
            .expect("external index points at a stored account")
    }

    /// Inserts a provisioned account. If the external identity is already
    /// taken the existing account is returned unchanged.
    pub fn insert_account(&self, account: Account) -> Account {
        if let Some(external) = account.external_id().map(str::to_string) {
            match self.external_index.entry(external) {
                Entry::Occupied(entry) => {
                    let existing = *entry.get();
                    return self
                        .accounts
                        .get(&existing)
                        .map(|e| e.value().clone())
                        .expect("external index points at a stored account");
                }
                Entry::Vacant(entry) => {
                    let id = account.id();
                    self.accounts.insert(id, account.clone());
                    entry.insert(id);
                    return account;
                }
            }
        }
        self.accounts.insert(account.id(), account.clone());
        account
    }

    pub fn get_transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.transactions.get(id).map(|entry| entry.value().clone())
    }

    /// Idempotency lookup: the prior transaction for a reference id, if any.
    pub fn find_by_reference(&self, reference_id: &str) -> Option<Transaction> {
        let id = *self.reference_index.get(reference_id)?;
        self.get_transaction(&id)
    }

    /// Reads several accounts as one consistent snapshot: no commit can
    /// interleave between the reads, so a multi-account mutation is
    /// observed on all of them or none.
    pub fn snapshot_accounts(&self, ids: &[AccountId]) -> Vec<Option<Account>> {
        let _gate = self.commit_gate.lock();
        ids.iter().map(|id| self.get_account(id)).collect()
    }

    /// Pending records, e.g. stranded by a crash between the pending-insert
    /// commit and the locked commit. Input for a reconciliation sweep.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|entry| entry.status() == TransactionStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

/// A staged storage transaction over [`MemoryStore`].
///
/// Dropping the transaction without committing rolls it back; nothing is
/// visible to other readers until `commit` succeeds.
#[derive(Debug)]
pub struct StoreTx<'a> {
    store: &'a MemoryStore,
    observed_versions: HashMap<AccountId, u64>,
    staged_accounts: Vec<Account>,
    staged_transactions: Vec<Transaction>,
}

impl StoreTx<'_> {
    /// Reads an account, remembering the version for commit validation.
    pub fn read_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        let account = self
            .store
            .get_account(&id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
        self.observed_versions.insert(id, account.version());
        Ok(account)
    }

    pub fn read_transaction(&self, id: TransactionId) -> Result<Transaction, LedgerError> {
        self.store
            .get_transaction(&id)
            .ok_or(LedgerError::OriginalNotFound)
    }

    /// Stages an account write. The account must have been read through
    /// this transaction.
    pub fn stage_account(&mut self, account: Account) {
        debug_assert!(
            self.observed_versions.contains_key(&account.id()),
            "staged account was not read through this transaction"
        );
        self.staged_accounts.push(account);
    }

    pub fn stage_transaction(&mut self, transaction: Transaction) {
        self.staged_transactions.push(transaction);
    }

    /// Validates and applies every staged write atomically.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ConcurrencyConflict`] if any staged account's live
    ///   version differs from the version observed at read time.
    /// - [`LedgerError::DuplicateReference`] if a staged transaction's
    ///   reference id is already claimed by a different transaction.
    pub fn commit(self) -> Result<(), LedgerError> {
        let _gate = self.store.commit_gate.lock();

        for account in &self.staged_accounts {
            let observed = self.observed_versions[&account.id()];
            let live = self
                .store
                .get_account(&account.id())
                .ok_or(LedgerError::ConcurrencyConflict)?;
            if live.version() != observed {
                return Err(LedgerError::ConcurrencyConflict);
            }
        }
        for transaction in &self.staged_transactions {
            if let Some(claimed) = self.store.reference_index.get(transaction.reference_id()) {
                if *claimed != transaction.id() {
                    return Err(LedgerError::DuplicateReference(
                        transaction.reference_id().to_string(),
                    ));
                }
            }
        }

        for mut account in self.staged_accounts {
            account.bump_version();
            self.store.accounts.insert(account.id(), account);
        }
        for transaction in self.staged_transactions {
            let reference = transaction.reference_id().to_string();
            let id = transaction.id();
            // Row before index, so an index hit always finds the record.
            self.store.transactions.insert(id, transaction);
            self.store.reference_index.insert(reference, id);
        }
        Ok(())
    }

    /// Discards every staged write. Dropping the transaction has the same
    /// effect; the method exists to make rollback explicit at call sites.
    pub fn rollback(self) {}
}
