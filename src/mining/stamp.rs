// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Deterministic algorithms behind a validation stamp.
//!
//! Every function here depends only on its arguments, so that the
//! cross-validators can reproduce exactly what the coordinator computed.

use crate::{
    base::{LedgerOperations, StampError, Transaction, TransactionMovement, UnspentOutput},
    crypto::Hash,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed part of each transaction fee.
pub const BASE_FEE: u64 = 100;
/// Fee for each byte of transaction content.
pub const BYTE_FEE: u64 = 1;
/// Fee for each transfer.
pub const TRANSFER_FEE: u64 = 10;

/// Max milliseconds a stamp timestamp can be ahead of the local clock.
pub const MAX_TIMESTAMP_DRIFT: u64 = 5_000;
/// Max milliseconds a stamp timestamp can lag behind the local clock.
pub const MAX_STAMP_AGE: u64 = 60_000;

/// Milliseconds since the unix epoch.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Checks if a stamp timestamp is acceptable with respect to `now`.
pub fn is_timestamp_acceptable(timestamp: u64, now: u64) -> bool {
    timestamp <= now.saturating_add(MAX_TIMESTAMP_DRIFT)
        && timestamp.saturating_add(MAX_STAMP_AGE) >= now
}

pub fn transaction_fee(tx: &Transaction) -> u64 {
    let content_fee = (tx.data.content.len() as u64).saturating_mul(BYTE_FEE);
    let transfers_fee = (tx.data.transfers.len() as u64).saturating_mul(TRANSFER_FEE);
    BASE_FEE
        .saturating_add(content_fee)
        .saturating_add(transfers_fee)
}

/// Compute the ledger operations of a pending transaction.
///
/// When the previous unspent outputs do not cover movements and fee the
/// previous outputs are kept untouched and the error is returned.
pub fn ledger_operations(
    tx: &Transaction,
    previous_unspent_outputs: &[UnspentOutput],
) -> (LedgerOperations, Option<StampError>) {
    let fee = transaction_fee(tx);
    let transaction_movements: Vec<TransactionMovement> = tx
        .data
        .transfers
        .iter()
        .map(|transfer| TransactionMovement {
            to: transfer.to,
            amount: transfer.amount,
        })
        .collect();

    let input = previous_unspent_outputs
        .iter()
        .fold(0u64, |acc, utxo| acc.saturating_add(utxo.amount));
    let output = transaction_movements
        .iter()
        .fold(fee, |acc, movement| acc.saturating_add(movement.amount));

    if input < output {
        let ops = LedgerOperations {
            fee,
            transaction_movements,
            unspent_outputs: previous_unspent_outputs.to_vec(),
        };
        return (ops, Some(StampError::InsufficientFunds));
    }

    let change = input - output;
    let unspent_outputs = match change {
        0 => vec![],
        amount => vec![UnspentOutput {
            from: tx.address,
            amount,
        }],
    };
    let ops = LedgerOperations {
        fee,
        transaction_movements,
        unspent_outputs,
    };
    (ops, None)
}

/// Chain the proof of integrity of the previous transaction (if any) with
/// the hash of the pending transaction.
pub fn proof_of_integrity(previous_transaction: Option<&Transaction>, tx: &Transaction) -> Hash {
    let previous_proof = previous_transaction
        .and_then(|prev| prev.validation_stamp.as_ref())
        .map(|stamp| stamp.proof_of_integrity)
        .unwrap_or_default();
    let mut buf = previous_proof.as_bytes().to_vec();
    buf.extend_from_slice(tx.pending_hash().as_bytes());
    Hash::from_data(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{create_test_address, create_test_stamp, create_test_tx};

    fn utxo(amount: u64) -> UnspentOutput {
        UnspentOutput {
            from: create_test_address(7),
            amount,
        }
    }

    #[test]
    fn fee_computation() {
        let tx = create_test_tx();

        // "hello" content and a single transfer.
        assert_eq!(transaction_fee(&tx), BASE_FEE + 5 * BYTE_FEE + TRANSFER_FEE);
    }

    #[test]
    fn change_becomes_new_unspent_output() {
        let tx = create_test_tx();
        let fee = transaction_fee(&tx);

        let (ops, err) = ledger_operations(&tx, &[utxo(3_000), utxo(2_000)]);

        assert!(err.is_none());
        assert_eq!(ops.fee, fee);
        assert_eq!(ops.transaction_movements.len(), 1);
        assert_eq!(ops.unspent_outputs.len(), 1);
        assert_eq!(ops.unspent_outputs[0].from, tx.address);
        assert_eq!(ops.unspent_outputs[0].amount, 5_000 - 1_000 - fee);
    }

    #[test]
    fn exact_spending_leaves_no_change() {
        let tx = create_test_tx();
        let fee = transaction_fee(&tx);

        let (ops, err) = ledger_operations(&tx, &[utxo(1_000 + fee)]);

        assert!(err.is_none());
        assert!(ops.unspent_outputs.is_empty());
    }

    #[test]
    fn insufficient_funds() {
        let tx = create_test_tx();

        let (ops, err) = ledger_operations(&tx, &[utxo(10)]);

        assert_eq!(err, Some(StampError::InsufficientFunds));
        assert_eq!(ops.unspent_outputs, vec![utxo(10)]);
    }

    #[test]
    fn proof_of_integrity_chaining() {
        let tx = create_test_tx();
        let mut prev = create_test_tx();
        prev.validation_stamp = Some(create_test_stamp());

        let first = proof_of_integrity(None, &tx);
        let chained = proof_of_integrity(Some(&prev), &tx);

        assert_ne!(first, chained);
        assert_eq!(chained, proof_of_integrity(Some(&prev), &tx));
    }

    #[test]
    fn timestamp_bounds() {
        let now = 1_000_000;

        assert!(is_timestamp_acceptable(now, now));
        assert!(is_timestamp_acceptable(now + MAX_TIMESTAMP_DRIFT, now));
        assert!(!is_timestamp_acceptable(now + MAX_TIMESTAMP_DRIFT + 1, now));
        assert!(is_timestamp_acceptable(now - MAX_STAMP_AGE, now));
        assert!(!is_timestamp_acceptable(now - MAX_STAMP_AGE - 1, now));
    }
}
