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

//! Transaction records.
//!
//! A transaction captures one client request and its outcome. Records follow
//! a state machine:
//! - `Pending` → `Completed` (engine commits) or `Failed` (engine rolls back)
//! - `Completed` → `Reversed` (a completed reversal targets this record)
//!
//! `Failed` and `Reversed` are terminal.

use crate::amount::Amount;
use crate::base::{AccountId, TransactionId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// The supported money-movement operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Credit,
    Debit,
    Reserve,
    Capture,
    Transfer,
    Reversal,
}

impl OperationType {
    /// Parses the wire vocabulary, case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        match raw.to_lowercase().as_str() {
            "credit" => Ok(OperationType::Credit),
            "debit" => Ok(OperationType::Debit),
            "reserve" => Ok(OperationType::Reserve),
            "capture" => Ok(OperationType::Capture),
            "transfer" => Ok(OperationType::Transfer),
            "reversal" => Ok(OperationType::Reversal),
            _ => Err(LedgerError::UnknownOperation(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Credit => "credit",
            OperationType::Debit => "debit",
            OperationType::Reserve => "reserve",
            OperationType::Capture => "capture",
            OperationType::Transfer => "transfer",
            OperationType::Reversal => "reversal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

/// One client request and its outcome.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    reference_id: String,
    operation: OperationType,
    amount: Amount,
    account_id: AccountId,
    target_account_id: Option<AccountId>,
    original_transaction_id: Option<TransactionId>,
    metadata: Option<String>,
    timestamp: DateTime<Utc>,
    status: TransactionStatus,
    error_message: Option<String>,
}

impl Transaction {
    /// Creates a Pending record, validating the operation linkage.
    pub fn new(
        reference_id: impl Into<String>,
        operation: OperationType,
        amount: Amount,
        account_id: AccountId,
        target_account_id: Option<AccountId>,
        original_transaction_id: Option<TransactionId>,
        metadata: Option<String>,
    ) -> Result<Self, LedgerError> {
        let reference_id = reference_id.into();
        if reference_id.trim().is_empty() {
            return Err(LedgerError::EmptyReference);
        }
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount);
        }
        if operation == OperationType::Transfer && target_account_id.is_none() {
            return Err(LedgerError::MissingTarget);
        }
        if operation == OperationType::Reversal && original_transaction_id.is_none() {
            return Err(LedgerError::MissingOriginal);
        }

        Ok(Self {
            id: TransactionId::new(),
            reference_id,
            operation,
            amount,
            account_id,
            target_account_id,
            original_transaction_id,
            metadata,
            timestamp: Utc::now(),
            status: TransactionStatus::Pending,
            error_message: None,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn target_account_id(&self) -> Option<AccountId> {
        self.target_account_id
    }

    pub fn original_transaction_id(&self) -> Option<TransactionId> {
        self.original_transaction_id
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Marks the record Completed. Legal only from Pending.
    pub fn mark_completed(&mut self) -> Result<(), LedgerError> {
        self.transition(TransactionStatus::Pending, TransactionStatus::Completed)
    }

    /// Marks the record Failed with the rejection reason. Legal only from Pending.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), LedgerError> {
        self.transition(TransactionStatus::Pending, TransactionStatus::Failed)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Marks the record Reversed. Legal only from Completed.
    pub fn mark_reversed(&mut self) -> Result<(), LedgerError> {
        self.transition(TransactionStatus::Completed, TransactionStatus::Reversed)
    }

    fn transition(
        &mut self,
        expected: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<(), LedgerError> {
        if self.status != expected {
            return Err(LedgerError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credit(reference: &str) -> Transaction {
        Transaction::new(
            reference,
            OperationType::Credit,
            Amount::from_minor(5_000),
            AccountId::new(),
            None,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(OperationType::parse("CREDIT").unwrap(), OperationType::Credit);
        assert_eq!(OperationType::parse("Transfer").unwrap(), OperationType::Transfer);
        assert_eq!(OperationType::parse("reversal").unwrap(), OperationType::Reversal);
    }

    #[test]
    fn parse_rejects_unknown_operation() {
        assert_eq!(
            OperationType::parse("refund"),
            Err(LedgerError::UnknownOperation("refund".into()))
        );
    }

    #[test]
    fn new_record_starts_pending() {
        let tx = credit("TXN-1");
        assert_eq!(tx.status(), TransactionStatus::Pending);
        assert_eq!(tx.reference_id(), "TXN-1");
        assert!(tx.error_message().is_none());
    }

    #[test]
    fn empty_reference_is_rejected() {
        let result = Transaction::new(
            "  ",
            OperationType::Credit,
            Amount::from_minor(100),
            AccountId::new(),
            None,
            None,
            None,
        );
        assert_eq!(result.unwrap_err(), LedgerError::EmptyReference);
    }

    #[test]
    fn non_positive_amount_is_rejected() {
        let result = Transaction::new(
            "TXN-1",
            OperationType::Debit,
            Amount::ZERO,
            AccountId::new(),
            None,
            None,
            None,
        );
        assert_eq!(result.unwrap_err(), LedgerError::InvalidAmount);
    }

    #[test]
    fn transfer_requires_target() {
        let result = Transaction::new(
            "TXN-1",
            OperationType::Transfer,
            Amount::from_minor(100),
            AccountId::new(),
            None,
            None,
            None,
        );
        assert_eq!(result.unwrap_err(), LedgerError::MissingTarget);
    }

    #[test]
    fn reversal_requires_original() {
        let result = Transaction::new(
            "TXN-1",
            OperationType::Reversal,
            Amount::from_minor(100),
            AccountId::new(),
            None,
            None,
            None,
        );
        assert_eq!(result.unwrap_err(), LedgerError::MissingOriginal);
    }

    #[test]
    fn pending_completes() {
        let mut tx = credit("TXN-1");
        tx.mark_completed().unwrap();
        assert_eq!(tx.status(), TransactionStatus::Completed);
    }

    #[test]
    fn pending_fails_with_reason() {
        let mut tx = credit("TXN-1");
        tx.mark_failed("insufficient funds").unwrap();
        assert_eq!(tx.status(), TransactionStatus::Failed);
        assert_eq!(tx.error_message(), Some("insufficient funds"));
    }

    #[test]
    fn completed_reverses() {
        let mut tx = credit("TXN-1");
        tx.mark_completed().unwrap();
        tx.mark_reversed().unwrap();
        assert_eq!(tx.status(), TransactionStatus::Reversed);
    }

    #[test]
    fn failed_is_terminal() {
        let mut tx = credit("TXN-1");
        tx.mark_failed("boom").unwrap();
        assert!(tx.mark_completed().is_err());
        assert!(tx.mark_reversed().is_err());
        assert!(tx.mark_failed("again").is_err());
    }

    #[test]
    fn pending_cannot_reverse() {
        let mut tx = credit("TXN-1");
        let result = tx.mark_reversed();
        assert_eq!(
            result,
            Err(LedgerError::InvalidTransition {
                from: TransactionStatus::Pending,
                to: TransactionStatus::Reversed,
            })
        );
    }

    #[test]
    fn reversed_is_terminal() {
        let mut tx = credit("TXN-1");
        tx.mark_completed().unwrap();
        tx.mark_reversed().unwrap();
        assert!(tx.mark_completed().is_err());
        assert!(tx.mark_failed("nope").is_err());
    }
}
