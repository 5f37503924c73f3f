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

//! Account aggregate.
//!
//! Holds the balance triple (balance, reserved, credit limit) and enforces
//! the money invariants on every mutation. The aggregate is ignorant of
//! persistence: the storage facade owns durability and the concurrency
//! token, this type only guards in-memory state.

use crate::amount::Amount;
use crate::base::AccountId;
use crate::error::LedgerError;
use chrono::{DateTime, Utc};

/// Account lifecycle status. Only Active accounts accept mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Closed => "closed",
        }
    }
}

/// Ledger account.
///
/// # Invariants
///
/// - `reserved >= 0`
/// - `balance + credit_limit - reserved >= 0` (debit capacity)
/// - a non-Active account rejects every mutating operation
#[derive(Debug, Clone)]
pub struct Account {
    id: AccountId,
    external_id: Option<String>,
    balance: Amount,
    reserved: Amount,
    credit_limit: Amount,
    status: AccountStatus,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(external_id: Option<String>, credit_limit: Amount) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            external_id,
            balance: Amount::ZERO,
            reserved: Amount::ZERO,
            credit_limit,
            status: AccountStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn reserved(&self) -> Amount {
        self.reserved
    }

    pub fn credit_limit(&self) -> Amount {
        self.credit_limit
    }

    /// Returns `balance - reserved`, the amount spendable without credit.
    pub fn available(&self) -> Amount {
        self.balance - self.reserved
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    /// Optimistic-concurrency token; advanced by the store on each commit.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Credits the balance.
    pub fn add_credit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.check_mutable(amount)?;
        self.balance += amount;
        self.touch();
        Ok(())
    }

    /// Debits the balance, allowing overdraft up to the credit limit.
    pub fn debit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.check_mutable(amount)?;
        if amount > self.available() + self.credit_limit {
            return Err(LedgerError::InsufficientFunds);
        }
        self.balance -= amount;
        self.touch();
        Ok(())
    }

    /// Holds part of the available balance against a future capture.
    pub fn reserve(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.check_mutable(amount)?;
        if amount > self.available() {
            return Err(LedgerError::InsufficientAvailable);
        }
        self.reserved += amount;
        self.touch();
        Ok(())
    }

    /// Converts a reservation into a debit.
    pub fn capture(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.check_mutable(amount)?;
        if amount > self.reserved {
            return Err(LedgerError::InsufficientReserved);
        }
        self.reserved -= amount;
        self.balance -= amount;
        self.touch();
        Ok(())
    }

    /// Returns reserved funds to the available balance.
    pub fn release_reservation(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.check_mutable(amount)?;
        if amount > self.reserved {
            return Err(LedgerError::InvalidReservation);
        }
        self.reserved -= amount;
        self.touch();
        Ok(())
    }

    pub fn set_status(&mut self, status: AccountStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    fn check_mutable(&self, amount: Amount) -> Result<(), LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount);
        }
        if self.status != AccountStatus::Active {
            return Err(LedgerError::AccountNotActive);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.assert_invariants();
    }

    fn assert_invariants(&self) {
        debug_assert!(
            !self.reserved.is_negative(),
            "invariant violated: reserved balance went negative: {}",
            self.reserved
        );
        debug_assert!(
            !(self.balance + self.credit_limit - self.reserved).is_negative(),
            "invariant violated: debit capacity went negative: balance={} credit={} reserved={}",
            self.balance,
            self.credit_limit,
            self.reserved
        );
    }
}
