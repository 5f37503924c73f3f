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

//! Wire-format request and response documents.
//!
//! Fields are snake_case JSON, amounts are integer minor units, timestamps
//! are ISO-8601 UTC. Conversion between wire and engine types happens here
//! and nowhere else.

use crate::account::Account;
use crate::base::TransactionId;
use crate::transaction::{Transaction, TransactionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A money-movement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// One of credit, debit, reserve, capture, transfer, reversal
    /// (case-insensitive).
    pub operation: String,
    /// Opaque account id, or an external identity string.
    pub account_id: String,
    /// Minor units; must be positive.
    pub amount: i64,
    /// Echoed, never converted.
    pub currency: String,
    /// Client-chosen idempotency key.
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// The authoritative post-operation projection returned to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub transaction_id: TransactionId,
    /// "success", "failed" or "pending".
    pub status: String,
    pub balance: i64,
    pub reserved_balance: i64,
    pub available_balance: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransactionResponse {
    /// Builds the projection of a transaction against an account snapshot.
    pub fn project(transaction: &Transaction, account: &Account) -> Self {
        Self {
            transaction_id: transaction.id(),
            status: wire_status(transaction.status()).to_string(),
            balance: account.balance().minor(),
            reserved_balance: account.reserved().minor(),
            available_balance: account.available().minor(),
            timestamp: transaction.timestamp(),
            error_message: transaction.error_message().map(str::to_string),
        }
    }
}

/// Maps a record status onto the wire vocabulary. A Reversed record reads
/// back as a success-terminal state.
pub fn wire_status(status: TransactionStatus) -> &'static str {
    match status {
        TransactionStatus::Completed | TransactionStatus::Reversed => "success",
        TransactionStatus::Failed => "failed",
        TransactionStatus::Pending => "pending",
    }
}

/// Account provisioning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccountRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Minor units; defaults to zero.
    #[serde(default)]
    pub credit_limit: i64,
}

/// Account read-back document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponse {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub balance: i64,
    pub reserved_balance: i64,
    pub available_balance: i64,
    pub credit_limit: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Account> for AccountResponse {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id().to_string(),
            external_id: account.external_id().map(str::to_string),
            balance: account.balance().minor(),
            reserved_balance: account.reserved().minor(),
            available_balance: account.available().minor(),
            credit_limit: account.credit_limit().minor(),
            status: account.status().as_str().to_string(),
            created_at: account.created_at(),
            updated_at: account.updated_at(),
        }
    }
}
