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

//! Structures exchanged by the nodes taking part to a transaction mining round.
//!
//! All the structures are serialized anonymously with MessagePack, thus their
//! fields order is part of the wire format.

use crate::{
    base::serialize::rmp_serialize,
    crypto::{Hash, Hashable, KeyPair, PublicKey},
    Result,
};

/// Network node as seen by the p2p layer.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Node {
    /// Key used by the node at its first registration.
    pub first_public_key: PublicKey,
    /// Key currently used by the node. Identifies the node within a round.
    pub last_public_key: PublicKey,
    /// Transport endpoint (opaque for the mining core).
    pub endpoint: String,
}

impl Node {
    pub fn new(first_public_key: PublicKey, last_public_key: PublicKey, endpoint: String) -> Self {
        Node {
            first_public_key,
            last_public_key,
            endpoint,
        }
    }
}

/// Transaction kind.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransactionKind {
    #[serde(rename = "transfer")]
    Transfer,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "code")]
    Code,
}

/// Funds transfer requested by a transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Transfer {
    /// Recipient chain address.
    pub to: Hash,
    /// Transferred amount.
    pub amount: u64,
}

/// Transaction payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TransactionData {
    pub kind: TransactionKind,
    /// Opaque content.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    /// Requested transfers.
    pub transfers: Vec<Transfer>,
    /// Chains that shall be notified about this transaction.
    pub recipients: Vec<Hash>,
}

/// Funds available to a chain, produced by a previous transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct UnspentOutput {
    /// Address of the transaction that produced the output.
    pub from: Hash,
    pub amount: u64,
}

/// Movement of funds toward another chain.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TransactionMovement {
    pub to: Hash,
    pub amount: u64,
}

/// Ledger effects of a validated transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct LedgerOperations {
    pub fee: u64,
    pub transaction_movements: Vec<TransactionMovement>,
    pub unspent_outputs: Vec<UnspentOutput>,
}

/// Error carried by a validation stamp.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum StampError {
    /// The pending transaction did not pass the semantic validation.
    #[serde(rename = "pending_transaction")]
    PendingTransaction,
    /// Previous unspent outputs do not cover movements and fee.
    #[serde(rename = "insufficient_funds")]
    InsufficientFunds,
}

/// Stamp produced by the coordinator of a mining round.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ValidationStamp {
    /// Milliseconds since the unix epoch, chosen by the coordinator.
    pub timestamp: u64,
    /// Chained hash of the previous proof and of the pending transaction.
    pub proof_of_integrity: Hash,
    pub ledger_operations: LedgerOperations,
    pub error: Option<StampError>,
    /// Coordinator signature of all the other fields.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl ValidationStamp {
    /// Bytes covered by the coordinator signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        rmp_serialize(&(
            self.timestamp,
            &self.proof_of_integrity,
            &self.ledger_operations,
            &self.error,
        ))
    }

    /// Sign the stamp, replacing any previous signature.
    pub fn sign(mut self, keypair: &KeyPair) -> Result<Self> {
        let payload = self.signing_payload()?;
        self.signature = keypair.sign(&payload);
        Ok(self)
    }

    /// Verify the stamp signature against the given key.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        match self.signing_payload() {
            Ok(payload) => public_key.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }
}

/// Field of a validation stamp (or of the replication plan) found different
/// by a cross-validator.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Inconsistency {
    #[serde(rename = "timestamp")]
    Timestamp,
    #[serde(rename = "signature")]
    Signature,
    #[serde(rename = "proof_of_integrity")]
    ProofOfIntegrity,
    #[serde(rename = "transaction_fee")]
    TransactionFee,
    #[serde(rename = "transaction_movements")]
    TransactionMovements,
    #[serde(rename = "unspent_outputs")]
    UnspentOutputs,
    #[serde(rename = "errors")]
    Errors,
    #[serde(rename = "replication_tree")]
    ReplicationTree,
}

/// Attestation of a cross-validator about a validation stamp.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct CrossValidationStamp {
    pub node_public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Empty when the cross-validator agrees with the stamp.
    pub inconsistencies: Vec<Inconsistency>,
}

impl CrossValidationStamp {
    fn signing_payload(stamp: &ValidationStamp, inconsistencies: &[Inconsistency]) -> Result<Vec<u8>> {
        rmp_serialize(&(stamp, inconsistencies))
    }

    /// Create a signed cross-validation stamp.
    pub fn new(
        keypair: &KeyPair,
        stamp: &ValidationStamp,
        inconsistencies: Vec<Inconsistency>,
    ) -> Result<Self> {
        let payload = Self::signing_payload(stamp, &inconsistencies)?;
        Ok(CrossValidationStamp {
            node_public_key: keypair.public_key(),
            signature: keypair.sign(&payload),
            inconsistencies,
        })
    }

    /// Verify the signature against the validation stamp it refers to.
    pub fn verify(&self, stamp: &ValidationStamp) -> bool {
        match Self::signing_payload(stamp, &self.inconsistencies) {
            Ok(payload) => self.node_public_key.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }

    /// Checks if the cross-validator agrees with the validation stamp.
    pub fn is_agreement(&self) -> bool {
        self.inconsistencies.is_empty()
    }
}

/// Transaction, either pending or validated.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Transaction {
    /// Content derived address.
    pub address: Hash,
    pub data: TransactionData,
    /// Key of the previous transaction of the chain.
    pub previous_public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub previous_signature: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub origin_signature: Vec<u8>,
    /// Present once validated.
    pub validation_stamp: Option<ValidationStamp>,
    /// Non empty once validated.
    pub cross_validation_stamps: Vec<CrossValidationStamp>,
}

impl Transaction {
    /// Address of the previous transaction of the chain.
    pub fn previous_address(&self) -> Hash {
        self.previous_public_key.to_address()
    }

    /// Pending form of the transaction (without stamps).
    pub fn to_pending(&self) -> Transaction {
        Transaction {
            validation_stamp: None,
            cross_validation_stamps: vec![],
            ..self.clone()
        }
    }

    /// Hash of the pending form.
    pub fn pending_hash(&self) -> Hash {
        self.to_pending().primary_hash()
    }

    pub fn is_validated(&self) -> bool {
        self.validation_stamp.is_some() && !self.cross_validation_stamps.is_empty()
    }
}

/// Compact view of a validated transaction.
/// This is what storage nodes sign to acknowledge the replication.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TransactionSummary {
    pub address: Hash,
    pub timestamp: u64,
    pub kind: TransactionKind,
    pub fee: u64,
    pub movements_addresses: Vec<Hash>,
}

impl TransactionSummary {
    /// Build the summary of a transaction. Returns `None` for pending ones.
    pub fn from_transaction(tx: &Transaction) -> Option<Self> {
        let stamp = tx.validation_stamp.as_ref()?;
        let movements_addresses = stamp
            .ledger_operations
            .transaction_movements
            .iter()
            .map(|movement| movement.to)
            .collect();
        Some(TransactionSummary {
            address: tx.address,
            timestamp: stamp.timestamp,
            kind: tx.data.kind,
            fee: stamp.ledger_operations.fee,
            movements_addresses,
        })
    }

    /// Bytes signed by storage nodes.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        rmp_serialize(self)
    }
}

/// Proof that a validated transaction has been replicated.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ReplicationAttestation {
    pub transaction_summary: TransactionSummary,
    /// Position within the chain storage nodes and acknowledgment signature.
    pub confirmations: Vec<(usize, Vec<u8>)>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        base::serialize::rmp_deserialize,
        crypto::ed25519::tests::create_test_keypair,
    };

    /// Test node whose keys derive from `seed`.
    pub fn create_test_node(seed: u8) -> Node {
        let public_key = create_test_keypair(seed).public_key();
        Node::new(public_key, public_key, format!("127.0.0.1:{}", 3000 + seed as u16))
    }

    pub fn create_test_address(seed: u8) -> Hash {
        Hash::from_data(&[seed])
    }

    /// Pending transfer transaction of the chain owned by the key with seed 200.
    pub fn create_test_tx() -> Transaction {
        let previous_keypair = create_test_keypair(200);
        let data = TransactionData {
            kind: TransactionKind::Transfer,
            content: b"hello".to_vec(),
            transfers: vec![Transfer {
                to: create_test_address(1),
                amount: 1_000,
            }],
            recipients: vec![],
        };
        let payload = rmp_serialize(&data).unwrap();
        Transaction {
            address: create_test_keypair(201).public_key().to_address(),
            previous_public_key: previous_keypair.public_key(),
            previous_signature: previous_keypair.sign(&payload),
            origin_signature: create_test_keypair(202).sign(&payload),
            data,
            validation_stamp: None,
            cross_validation_stamps: vec![],
        }
    }

    pub fn create_test_stamp() -> ValidationStamp {
        ValidationStamp {
            timestamp: 1_650_000_000_000,
            proof_of_integrity: create_test_address(9),
            ledger_operations: LedgerOperations {
                fee: 10,
                transaction_movements: vec![TransactionMovement {
                    to: create_test_address(1),
                    amount: 1_000,
                }],
                unspent_outputs: vec![],
            },
            error: None,
            signature: vec![],
        }
    }

    #[test]
    fn validation_stamp_signature() {
        let keypair = create_test_keypair(1);

        let stamp = create_test_stamp().sign(&keypair).unwrap();

        assert!(stamp.verify(&keypair.public_key()));
        assert!(!stamp.verify(&create_test_keypair(2).public_key()));
    }

    #[test]
    fn tampered_validation_stamp() {
        let keypair = create_test_keypair(1);
        let mut stamp = create_test_stamp().sign(&keypair).unwrap();

        stamp.ledger_operations.fee += 1;

        assert!(!stamp.verify(&keypair.public_key()));
    }

    #[test]
    fn cross_validation_stamp_signature() {
        let stamp = create_test_stamp();
        let keypair = create_test_keypair(3);

        let cross_stamp =
            CrossValidationStamp::new(&keypair, &stamp, vec![Inconsistency::TransactionFee])
                .unwrap();

        assert!(cross_stamp.verify(&stamp));
        assert!(!cross_stamp.is_agreement());
        let mut other = stamp.clone();
        other.timestamp += 1;
        assert!(!cross_stamp.verify(&other));
    }

    #[test]
    fn pending_form() {
        let mut tx = create_test_tx();
        tx.validation_stamp = Some(create_test_stamp());

        let pending = tx.to_pending();

        assert!(pending.validation_stamp.is_none());
        assert_eq!(pending.pending_hash(), create_test_tx().pending_hash());
        assert!(!tx.is_validated());
    }

    #[test]
    fn previous_address_derivation() {
        let tx = create_test_tx();

        assert_eq!(
            tx.previous_address(),
            create_test_keypair(200).public_key().to_address()
        );
    }

    #[test]
    fn summary_of_validated_transaction() {
        let mut tx = create_test_tx();
        assert!(TransactionSummary::from_transaction(&tx).is_none());
        tx.validation_stamp = Some(create_test_stamp());

        let summary = TransactionSummary::from_transaction(&tx).unwrap();

        assert_eq!(summary.address, tx.address);
        assert_eq!(summary.fee, 10);
        assert_eq!(summary.movements_addresses, vec![create_test_address(1)]);
    }

    #[test]
    fn transaction_serialization() {
        let tx = create_test_tx();

        let buf = rmp_serialize(&tx).unwrap();
        let decoded: Transaction = rmp_deserialize(&buf).unwrap();

        assert_eq!(decoded, tx);
    }
}
