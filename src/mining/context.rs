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

//! Validation context of a single mining round.
//!
//! The context is threaded through the workflow by value: every operation
//! consumes it and returns the updated version.

use super::{stamp, StorageQuorum, TransactionContext};
use crate::{
    base::{
        bitset::{self, BitSet},
        CrossValidationStamp, Inconsistency, Node, ReplicationAttestation, StampError,
        Transaction, TransactionSummary, UnspentOutput, ValidationStamp,
    },
    crypto::{KeyPair, PublicKey},
    Error, ErrorKind, Result,
};
use std::collections::BTreeMap;

/// Availability of the storage nodes as observed by one validation node.
/// Each bit refers to the storage node at the same position of its list.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct StorageNodesView {
    pub chain: BitSet,
    pub beacon: BitSet,
    pub io: BitSet,
}

impl StorageNodesView {
    pub fn bitset(&self, kind: StorageKind) -> &BitSet {
        match kind {
            StorageKind::Chain => &self.chain,
            StorageKind::Beacon => &self.beacon,
            StorageKind::Io => &self.io,
        }
    }
}

/// Assignment of the storage nodes to the confirmed validation nodes.
///
/// One row per confirmed validation node (coordinator first), each row is a
/// bitset over the corresponding storage nodes list.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct ReplicationTree {
    pub chain: Vec<BitSet>,
    pub beacon: Vec<BitSet>,
    pub io: Vec<BitSet>,
}

impl ReplicationTree {
    /// Storage node `i` goes to row `i mod rows`.
    /// Availability views are not taken into account, every storage node gets
    /// a row. They only order the requests within a row.
    pub fn partition(rows: usize, chain: usize, beacon: usize, io: usize) -> Self {
        ReplicationTree {
            chain: partition_set(rows, chain),
            beacon: partition_set(rows, beacon),
            io: partition_set(rows, io),
        }
    }
}

/// Storage nodes set.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum StorageKind {
    Chain,
    Beacon,
    Io,
}

impl ReplicationTree {
    pub fn matrix(&self, kind: StorageKind) -> &[BitSet] {
        match kind {
            StorageKind::Chain => &self.chain,
            StorageKind::Beacon => &self.beacon,
            StorageKind::Io => &self.io,
        }
    }
}

fn partition_set(rows: usize, len: usize) -> Vec<BitSet> {
    (0..rows)
        .map(|row| (0..len).map(|i| i % rows == row).collect())
        .collect()
}

fn row_nodes(matrix: &[BitSet], row: usize, nodes: &[Node]) -> Vec<Node> {
    match matrix.get(row) {
        Some(bits) => nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| bitset::is_set(bits, *i))
            .map(|(_, node)| node.clone())
            .collect(),
        None => vec![],
    }
}

/// Everything produced and gathered during a mining round.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Pending transaction under validation.
    pub transaction: Transaction,
    /// Node that received the transaction from the client.
    pub welcome_node: Node,
    pub coordinator_node: Node,
    /// Ordering drives the coordinator failover.
    pub cross_validation_nodes: Vec<Node>,
    pub chain_storage_nodes: Vec<Node>,
    pub beacon_storage_nodes: Vec<Node>,
    pub io_storage_nodes: Vec<Node>,
    pub previous_transaction: Option<Transaction>,
    pub previous_unspent_outputs: Vec<UnspentOutput>,
    pub previous_storage_nodes: Vec<Node>,
    /// Locally observed storage nodes availability.
    pub storage_nodes_view: StorageNodesView,
    /// One bit per cross-validation node.
    pub cross_validation_nodes_confirmation: BitSet,
    /// Views reported by the cross-validation nodes, by position.
    pub cross_validation_nodes_view: Vec<Option<StorageNodesView>>,
    pub validation_stamp: Option<ValidationStamp>,
    pub full_replication_tree: Option<ReplicationTree>,
    pub cross_validation_stamps: Vec<CrossValidationStamp>,
    /// Chain storage node position to acknowledgment signature.
    pub storage_nodes_confirmations: BTreeMap<usize, Vec<u8>>,
    pub pending_transaction_valid: bool,
}

impl ValidationContext {
    /// Create the context of a new round. The first validation node is the
    /// coordinator, the others are the cross-validation nodes.
    pub fn new(
        transaction: Transaction,
        welcome_node: Node,
        coordinator_node: Node,
        cross_validation_nodes: Vec<Node>,
        chain_storage_nodes: Vec<Node>,
        beacon_storage_nodes: Vec<Node>,
        io_storage_nodes: Vec<Node>,
    ) -> Self {
        let cross_count = cross_validation_nodes.len();
        ValidationContext {
            transaction,
            welcome_node,
            coordinator_node,
            cross_validation_nodes,
            chain_storage_nodes,
            beacon_storage_nodes,
            io_storage_nodes,
            previous_transaction: None,
            previous_unspent_outputs: vec![],
            previous_storage_nodes: vec![],
            storage_nodes_view: StorageNodesView::default(),
            cross_validation_nodes_confirmation: bitset::zeros(cross_count),
            cross_validation_nodes_view: vec![None; cross_count],
            validation_stamp: None,
            full_replication_tree: None,
            cross_validation_stamps: vec![],
            storage_nodes_confirmations: BTreeMap::new(),
            pending_transaction_valid: true,
        }
    }

    pub fn set_pending_transaction_validation(mut self, valid: bool) -> Self {
        self.pending_transaction_valid = valid;
        self
    }

    /// Store the context fetched for the transaction chain.
    pub fn put_transaction_context(mut self, tx_context: TransactionContext) -> Self {
        self.previous_transaction = tx_context.previous_transaction;
        self.previous_unspent_outputs = tx_context.unspent_outputs;
        self.previous_storage_nodes = tx_context.previous_storage_nodes;
        self.storage_nodes_view = tx_context.view;
        self
    }

    /// Position of a node within the cross-validation nodes.
    pub fn cross_validation_position(&self, public_key: &PublicKey) -> Option<usize> {
        self.cross_validation_nodes
            .iter()
            .position(|node| node.last_public_key == *public_key)
    }

    pub fn is_coordinator(&self, public_key: &PublicKey) -> bool {
        self.coordinator_node.last_public_key == *public_key
    }

    /// Aggregate the context received from a cross-validation node.
    /// Contexts from unknown nodes are ignored.
    pub fn aggregate_mining_context(
        mut self,
        previous_storage_nodes: Vec<Node>,
        view: StorageNodesView,
        from: &PublicKey,
    ) -> Self {
        let index = match self.cross_validation_position(from) {
            Some(index) => index,
            None => return self,
        };
        for node in previous_storage_nodes {
            let known = self
                .previous_storage_nodes
                .iter()
                .any(|prev| prev.last_public_key == node.last_public_key);
            if !known {
                self.previous_storage_nodes.push(node);
            }
        }
        if let Some(slot) = self.cross_validation_nodes_view.get_mut(index) {
            *slot = Some(view);
        }
        if let Some(mut bit) = self.cross_validation_nodes_confirmation.get_mut(index) {
            *bit = true;
        }
        self
    }

    /// All the cross-validation nodes have sent their context.
    pub fn enough_confirmations(&self) -> bool {
        self.cross_validation_nodes_confirmation.all()
    }

    pub fn confirmation_count(&self) -> usize {
        self.cross_validation_nodes_confirmation.count_ones()
    }

    /// Cross-validation nodes whose confirmation bit is set.
    pub fn confirmed_cross_validation_nodes(&self) -> Vec<Node> {
        self.cross_validation_nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| bitset::is_set(&self.cross_validation_nodes_confirmation, *i))
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// Coordinator followed by the confirmed cross-validation nodes.
    pub fn confirmed_validation_nodes(&self) -> Vec<Node> {
        let mut nodes = vec![self.coordinator_node.clone()];
        nodes.extend(self.confirmed_cross_validation_nodes());
        nodes
    }

    fn unsigned_stamp(&self, timestamp: u64) -> ValidationStamp {
        let (ledger_operations, ledger_error) =
            stamp::ledger_operations(&self.transaction, &self.previous_unspent_outputs);
        let error = match self.pending_transaction_valid {
            false => Some(StampError::PendingTransaction),
            true => ledger_error,
        };
        ValidationStamp {
            timestamp,
            proof_of_integrity: stamp::proof_of_integrity(
                self.previous_transaction.as_ref(),
                &self.transaction,
            ),
            ledger_operations,
            error,
            signature: vec![],
        }
    }

    /// Create and sign the validation stamp. An already set stamp is kept.
    pub fn create_validation_stamp(mut self, keypair: &KeyPair, timestamp: u64) -> Result<Self> {
        if self.validation_stamp.is_some() {
            return Ok(self);
        }
        let validation_stamp = self.unsigned_stamp(timestamp).sign(keypair)?;
        self.validation_stamp = Some(validation_stamp);
        Ok(self)
    }

    fn expected_replication_tree(&self) -> ReplicationTree {
        ReplicationTree::partition(
            1 + self.confirmation_count(),
            self.chain_storage_nodes.len(),
            self.beacon_storage_nodes.len(),
            self.io_storage_nodes.len(),
        )
    }

    /// Partition the storage nodes over the confirmed validation nodes.
    /// Requires the validation stamp.
    pub fn create_replication_tree(mut self) -> Self {
        if self.validation_stamp.is_some() {
            self.full_replication_tree = Some(self.expected_replication_tree());
        }
        self
    }

    /// Store what the coordinator sent with the cross-validation request.
    pub fn put_cross_validation_request(
        mut self,
        validation_stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        confirmed_validation_nodes: BitSet,
    ) -> Self {
        if self.validation_stamp.is_none() {
            self.validation_stamp = Some(validation_stamp);
            self.full_replication_tree = Some(replication_tree);
            self.cross_validation_nodes_confirmation = confirmed_validation_nodes;
        }
        self
    }

    fn inconsistencies(&self, now: u64) -> Result<Vec<Inconsistency>> {
        let (received, tree) = match (&self.validation_stamp, &self.full_replication_tree) {
            (Some(received), Some(tree)) => (received, tree),
            _ => {
                return Err(Error::new_ext(
                    ErrorKind::ResourceNotFound,
                    "missing validation stamp",
                ))
            }
        };
        let expected = self.unsigned_stamp(received.timestamp);
        let expected_ops = &expected.ledger_operations;
        let received_ops = &received.ledger_operations;

        let mut inconsistencies = vec![];
        if !stamp::is_timestamp_acceptable(received.timestamp, now) {
            inconsistencies.push(Inconsistency::Timestamp);
        }
        if !received.verify(&self.coordinator_node.last_public_key) {
            inconsistencies.push(Inconsistency::Signature);
        }
        if received.proof_of_integrity != expected.proof_of_integrity {
            inconsistencies.push(Inconsistency::ProofOfIntegrity);
        }
        if received_ops.fee != expected_ops.fee {
            inconsistencies.push(Inconsistency::TransactionFee);
        }
        if received_ops.transaction_movements != expected_ops.transaction_movements {
            inconsistencies.push(Inconsistency::TransactionMovements);
        }
        if received_ops.unspent_outputs != expected_ops.unspent_outputs {
            inconsistencies.push(Inconsistency::UnspentOutputs);
        }
        if received.error != expected.error {
            inconsistencies.push(Inconsistency::Errors);
        }
        if *tree != self.expected_replication_tree() {
            inconsistencies.push(Inconsistency::ReplicationTree);
        }
        Ok(inconsistencies)
    }

    /// Verify the received validation stamp and replication tree and append
    /// the resulting, signed, cross-validation stamp.
    pub fn cross_validate(mut self, keypair: &KeyPair, now: u64) -> Result<Self> {
        let inconsistencies = self.inconsistencies(now)?;
        let stamp = match &self.validation_stamp {
            Some(stamp) => stamp,
            None => return Err(ErrorKind::ResourceNotFound.into()),
        };
        let cross_stamp = CrossValidationStamp::new(keypair, stamp, inconsistencies)?;
        self.cross_validation_stamps.push(cross_stamp);
        Ok(self)
    }

    /// Append a cross-validation stamp received from a confirmed
    /// cross-validation node. Duplicates and invalid stamps are ignored.
    pub fn add_cross_validation_stamp(mut self, cross_stamp: CrossValidationStamp) -> Self {
        let confirmed = self
            .cross_validation_position(&cross_stamp.node_public_key)
            .map(|i| bitset::is_set(&self.cross_validation_nodes_confirmation, i))
            .unwrap_or(false);
        let duplicated = self
            .cross_validation_stamps
            .iter()
            .any(|stamp| stamp.node_public_key == cross_stamp.node_public_key);
        let valid = match &self.validation_stamp {
            Some(stamp) => cross_stamp.verify(stamp),
            None => false,
        };
        if confirmed && !duplicated && valid {
            self.cross_validation_stamps.push(cross_stamp);
        }
        self
    }

    /// Every collected cross-validation stamp agrees with the validation stamp.
    pub fn atomic_commitment(&self) -> bool {
        self.cross_validation_stamps
            .iter()
            .all(CrossValidationStamp::is_agreement)
    }

    pub fn enough_cross_validation_stamps(&self) -> bool {
        self.cross_validation_stamps.len() == self.confirmation_count()
    }

    /// Row of a validation node within the replication tree.
    pub fn replication_row(&self, public_key: &PublicKey) -> Option<usize> {
        self.confirmed_validation_nodes()
            .iter()
            .position(|node| node.last_public_key == *public_key)
    }

    pub fn storage_nodes(&self, kind: StorageKind) -> &[Node] {
        match kind {
            StorageKind::Chain => &self.chain_storage_nodes,
            StorageKind::Beacon => &self.beacon_storage_nodes,
            StorageKind::Io => &self.io_storage_nodes,
        }
    }

    /// Storage nodes of the given set assigned to a validation node.
    pub fn replication_nodes(&self, kind: StorageKind, public_key: &PublicKey) -> Vec<Node> {
        match (&self.full_replication_tree, self.replication_row(public_key)) {
            (Some(tree), Some(row)) => row_nodes(tree.matrix(kind), row, self.storage_nodes(kind)),
            _ => vec![],
        }
    }

    pub fn chain_replication_nodes(&self, public_key: &PublicKey) -> Vec<Node> {
        self.replication_nodes(StorageKind::Chain, public_key)
    }

    pub fn beacon_replication_nodes(&self, public_key: &PublicKey) -> Vec<Node> {
        self.replication_nodes(StorageKind::Beacon, public_key)
    }

    /// Storage node reported unreachable by at least one of the collected
    /// views: the local one and the confirmed cross-validation nodes ones.
    pub fn is_reported_unreachable(&self, kind: StorageKind, index: usize) -> bool {
        std::iter::once(&self.storage_nodes_view)
            .chain(self.cross_validation_nodes_view.iter().flatten())
            .any(|view| matches!(view.bitset(kind).get(index).map(|bit| *bit), Some(false)))
    }

    /// Chain storage nodes assigned to a validation node, the ones reported
    /// unreachable moved last.
    pub fn chain_replication_plan(&self, public_key: &PublicKey) -> Vec<Node> {
        let mut plan: Vec<(bool, Node)> = self
            .chain_replication_nodes(public_key)
            .into_iter()
            .map(|node| {
                let unreachable = self
                    .chain_storage_position(&node.last_public_key)
                    .map(|index| self.is_reported_unreachable(StorageKind::Chain, index))
                    .unwrap_or(false);
                (unreachable, node)
            })
            .collect();
        plan.sort_by_key(|(unreachable, _)| *unreachable);
        plan.into_iter().map(|(_, node)| node).collect()
    }

    /// IO storage nodes assigned to a validation node, chain storage nodes
    /// excluded since they already hold the transaction.
    pub fn io_replication_nodes(&self, public_key: &PublicKey) -> Vec<Node> {
        self.replication_nodes(StorageKind::Io, public_key)
            .into_iter()
            .filter(|node| {
                !self
                    .chain_storage_nodes
                    .iter()
                    .any(|chain| chain.last_public_key == node.last_public_key)
            })
            .collect()
    }

    /// Position of a node within the chain storage nodes.
    pub fn chain_storage_position(&self, public_key: &PublicKey) -> Result<usize> {
        self.chain_storage_nodes
            .iter()
            .position(|node| node.last_public_key == *public_key)
            .ok_or_else(|| Error::new_ext(ErrorKind::ResourceNotFound, "not a chain storage node"))
    }

    pub fn add_storage_confirmation(mut self, index: usize, signature: Vec<u8>) -> Self {
        if index < self.chain_storage_nodes.len() {
            self.storage_nodes_confirmations.insert(index, signature);
        }
        self
    }

    /// Checks the acknowledgments received from the chain storage nodes
    /// assigned to the given validation node against the quorum.
    pub fn enough_storage_confirmations(&self, public_key: &PublicKey, quorum: StorageQuorum) -> bool {
        let row = self.chain_replication_nodes(public_key);
        let confirmed = row
            .iter()
            .filter_map(|node| self.chain_storage_position(&node.last_public_key).ok())
            .filter(|index| self.storage_nodes_confirmations.contains_key(index))
            .count();
        confirmed >= quorum.required(row.len())
    }

    /// Promote the first remaining cross-validation node to coordinator.
    /// Confirmations and views are reset. `None` when no candidate is left.
    pub fn next_coordinator(mut self) -> Option<Self> {
        if self.cross_validation_nodes.is_empty() {
            return None;
        }
        self.coordinator_node = self.cross_validation_nodes.remove(0);
        let cross_count = self.cross_validation_nodes.len();
        self.cross_validation_nodes_confirmation = bitset::zeros(cross_count);
        self.cross_validation_nodes_view = vec![None; cross_count];
        Some(self)
    }

    /// Validated transaction, cross-validation stamps sorted by signer.
    pub fn to_validated_transaction(&self) -> Option<Transaction> {
        let validation_stamp = self.validation_stamp.clone()?;
        let mut cross_validation_stamps = self.cross_validation_stamps.clone();
        cross_validation_stamps.sort_by(|a, b| a.node_public_key.cmp(&b.node_public_key));
        Some(Transaction {
            validation_stamp: Some(validation_stamp),
            cross_validation_stamps,
            ..self.transaction.clone()
        })
    }

    pub fn transaction_summary(&self) -> Option<TransactionSummary> {
        self.to_validated_transaction()
            .as_ref()
            .and_then(TransactionSummary::from_transaction)
    }

    /// Attestation of the storage acknowledgments collected so far.
    pub fn replication_attestation(&self) -> Option<ReplicationAttestation> {
        let transaction_summary = self.transaction_summary()?;
        let confirmations = self
            .storage_nodes_confirmations
            .iter()
            .map(|(index, signature)| (*index, signature.clone()))
            .collect();
        Some(ReplicationAttestation {
            transaction_summary,
            confirmations,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        base::schema::tests::{create_test_address, create_test_node, create_test_tx},
        crypto::ed25519::tests::create_test_keypair,
    };

    pub const COORDINATOR_SEED: u8 = 1;
    pub const CROSS_VALIDATOR_SEEDS: [u8; 2] = [2, 3];
    pub const CHAIN_STORAGE_SEEDS: [u8; 3] = [10, 11, 12];

    pub fn create_test_utxos() -> Vec<UnspentOutput> {
        vec![UnspentOutput {
            from: create_test_address(7),
            amount: 5_000,
        }]
    }

    /// Chain context as fetched by every validation node.
    pub fn create_test_tx_context() -> TransactionContext {
        TransactionContext {
            previous_transaction: None,
            unspent_outputs: create_test_utxos(),
            previous_storage_nodes: vec![create_test_node(40)],
            view: StorageNodesView {
                chain: bitset::ones(3),
                beacon: bitset::ones(3),
                io: bitset::ones(3),
            },
        }
    }

    /// Context of a round with three validation nodes and three storage nodes
    /// per set, fetched transaction context already in place.
    pub fn create_test_context() -> ValidationContext {
        let chain: Vec<Node> = CHAIN_STORAGE_SEEDS.iter().map(|s| create_test_node(*s)).collect();
        let beacon: Vec<Node> = (20..23).map(create_test_node).collect();
        let io: Vec<Node> = (30..33).map(create_test_node).collect();
        let tx_context = create_test_tx_context();
        ValidationContext::new(
            create_test_tx(),
            create_test_node(50),
            create_test_node(COORDINATOR_SEED),
            CROSS_VALIDATOR_SEEDS.iter().map(|s| create_test_node(*s)).collect(),
            chain,
            beacon,
            io,
        )
        .put_transaction_context(tx_context)
    }

    fn public_key(seed: u8) -> PublicKey {
        create_test_keypair(seed).public_key()
    }

    fn confirm_all(ctx: ValidationContext) -> ValidationContext {
        CROSS_VALIDATOR_SEEDS.iter().fold(ctx, |ctx, seed| {
            ctx.aggregate_mining_context(vec![], StorageNodesView::default(), &public_key(*seed))
        })
    }

    /// Coordinator side context with stamp and tree.
    pub fn create_stamped_context(timestamp: u64) -> ValidationContext {
        confirm_all(create_test_context())
            .create_validation_stamp(&create_test_keypair(COORDINATOR_SEED), timestamp)
            .unwrap()
            .create_replication_tree()
    }

    /// What a cross-validator holds after the coordinator request.
    fn cross_validator_view(coordinator: &ValidationContext) -> ValidationContext {
        create_test_context().put_cross_validation_request(
            coordinator.validation_stamp.clone().unwrap(),
            coordinator.full_replication_tree.clone().unwrap(),
            coordinator.cross_validation_nodes_confirmation.clone(),
        )
    }

    #[test]
    fn aggregate_from_cross_validator() {
        let ctx = create_test_context().aggregate_mining_context(
            vec![create_test_node(40), create_test_node(41)],
            StorageNodesView::default(),
            &public_key(3),
        );

        assert_eq!(ctx.confirmation_count(), 1);
        assert!(bitset::is_set(&ctx.cross_validation_nodes_confirmation, 1));
        assert!(ctx.cross_validation_nodes_view[0].is_none());
        assert!(ctx.cross_validation_nodes_view[1].is_some());
        assert_eq!(ctx.previous_storage_nodes.len(), 2);
        assert!(!ctx.enough_confirmations());
    }

    #[test]
    fn aggregate_from_unknown_node() {
        let ctx = create_test_context().aggregate_mining_context(
            vec![create_test_node(41)],
            StorageNodesView::default(),
            &public_key(99),
        );

        assert_eq!(ctx.confirmation_count(), 0);
        assert_eq!(ctx.previous_storage_nodes.len(), 1);
    }

    #[test]
    fn all_confirmations() {
        let ctx = confirm_all(create_test_context());

        assert!(ctx.enough_confirmations());
        assert_eq!(ctx.confirmed_validation_nodes().len(), 3);
    }

    #[test]
    fn validation_stamp_is_set_once() {
        let ctx = create_stamped_context(1_000);

        let ctx = ctx
            .create_validation_stamp(&create_test_keypair(COORDINATOR_SEED), 2_000)
            .unwrap();

        assert_eq!(ctx.validation_stamp.unwrap().timestamp, 1_000);
    }

    #[test]
    fn replication_tree_requires_stamp() {
        let ctx = confirm_all(create_test_context()).create_replication_tree();

        assert!(ctx.full_replication_tree.is_none());
    }

    #[test]
    fn pending_validation_error_takes_precedence() {
        let ctx = confirm_all(create_test_context())
            .set_pending_transaction_validation(false)
            .create_validation_stamp(&create_test_keypair(COORDINATOR_SEED), 1_000)
            .unwrap();

        assert_eq!(
            ctx.validation_stamp.unwrap().error,
            Some(StampError::PendingTransaction)
        );
    }

    #[test]
    fn replication_tree_is_total_partition() {
        for rows in 1..=4 {
            for len in 1..=7 {
                let tree = ReplicationTree::partition(rows, len, len, len);
                for matrix in [&tree.chain, &tree.beacon, &tree.io] {
                    assert_eq!(matrix.len(), rows);
                    for i in 0..len {
                        let owners = matrix.iter().filter(|row| bitset::is_set(row, i)).count();
                        assert_eq!(owners, 1);
                    }
                }
            }
        }
    }

    #[test]
    fn replication_rows() {
        let ctx = create_stamped_context(1_000);

        let coordinator_row = ctx.chain_replication_nodes(&public_key(COORDINATOR_SEED));
        let last_row = ctx.chain_replication_nodes(&public_key(3));

        assert_eq!(coordinator_row, vec![create_test_node(10)]);
        assert_eq!(last_row, vec![create_test_node(12)]);
        assert!(ctx.chain_replication_nodes(&public_key(99)).is_empty());
    }

    #[test]
    fn io_row_excludes_chain_storage_nodes() {
        let mut ctx = create_stamped_context(1_000);
        ctx.io_storage_nodes[0] = create_test_node(10);

        let row = ctx.io_replication_nodes(&public_key(COORDINATOR_SEED));

        assert!(row.is_empty());
    }

    #[test]
    fn cross_validation_agreement() {
        let now = stamp::timestamp_ms();
        let coordinator = create_stamped_context(now);

        let ctx = cross_validator_view(&coordinator)
            .cross_validate(&create_test_keypair(2), now)
            .unwrap();

        assert_eq!(ctx.cross_validation_stamps.len(), 1);
        assert!(ctx.atomic_commitment());
        assert!(!ctx.enough_cross_validation_stamps());
    }

    #[test]
    fn cross_validation_detects_ledger_mismatch() {
        let now = stamp::timestamp_ms();
        let coordinator = create_stamped_context(now);
        let mut ctx = cross_validator_view(&coordinator);
        ctx.previous_unspent_outputs[0].amount = 4_000;

        let ctx = ctx.cross_validate(&create_test_keypair(2), now).unwrap();

        let inconsistencies = &ctx.cross_validation_stamps[0].inconsistencies;
        assert_eq!(inconsistencies, &vec![Inconsistency::UnspentOutputs]);
        assert!(!ctx.atomic_commitment());
    }

    #[test]
    fn cross_validation_detects_stale_timestamp() {
        let now = stamp::timestamp_ms();
        let coordinator = create_stamped_context(now - stamp::MAX_STAMP_AGE - 1);

        let ctx = cross_validator_view(&coordinator)
            .cross_validate(&create_test_keypair(2), now)
            .unwrap();

        assert_eq!(
            ctx.cross_validation_stamps[0].inconsistencies,
            vec![Inconsistency::Timestamp]
        );
    }

    #[test]
    fn cross_validation_detects_foreign_signature() {
        let now = stamp::timestamp_ms();
        let coordinator = confirm_all(create_test_context())
            .create_validation_stamp(&create_test_keypair(99), now)
            .unwrap()
            .create_replication_tree();

        let ctx = cross_validator_view(&coordinator)
            .cross_validate(&create_test_keypair(2), now)
            .unwrap();

        assert_eq!(
            ctx.cross_validation_stamps[0].inconsistencies,
            vec![Inconsistency::Signature]
        );
    }

    #[test]
    fn cross_validation_detects_tree_mismatch() {
        let now = stamp::timestamp_ms();
        let coordinator = create_stamped_context(now);
        let tree = ReplicationTree::partition(2, 3, 3, 3);

        let ctx = create_test_context()
            .put_cross_validation_request(
                coordinator.validation_stamp.clone().unwrap(),
                tree,
                coordinator.cross_validation_nodes_confirmation.clone(),
            )
            .cross_validate(&create_test_keypair(2), now)
            .unwrap();

        assert_eq!(
            ctx.cross_validation_stamps[0].inconsistencies,
            vec![Inconsistency::ReplicationTree]
        );
    }

    #[test]
    fn cross_validation_without_stamp() {
        let res = create_test_context().cross_validate(&create_test_keypair(2), 0);

        assert_eq!(res.unwrap_err().kind, ErrorKind::ResourceNotFound);
    }

    #[test]
    fn collect_cross_validation_stamps() {
        let now = stamp::timestamp_ms();
        let coordinator = create_stamped_context(now);
        let stamp = coordinator.validation_stamp.clone().unwrap();
        let first = CrossValidationStamp::new(&create_test_keypair(2), &stamp, vec![]).unwrap();
        let second = CrossValidationStamp::new(&create_test_keypair(3), &stamp, vec![]).unwrap();

        let ctx = coordinator
            .add_cross_validation_stamp(second)
            .add_cross_validation_stamp(first.clone())
            .add_cross_validation_stamp(first);

        assert_eq!(ctx.cross_validation_stamps.len(), 2);
        assert!(ctx.enough_cross_validation_stamps());
        assert!(ctx.atomic_commitment());
        let tx = ctx.to_validated_transaction().unwrap();
        let signers: Vec<PublicKey> = tx
            .cross_validation_stamps
            .iter()
            .map(|stamp| stamp.node_public_key)
            .collect();
        let mut sorted = signers.clone();
        sorted.sort();
        assert_eq!(signers, sorted);
        assert!(tx.is_validated());
    }

    #[test]
    fn reject_stamp_from_unconfirmed_or_forged() {
        let coordinator = create_stamped_context(stamp::timestamp_ms());
        let stamp = coordinator.validation_stamp.clone().unwrap();
        let outsider = CrossValidationStamp::new(&create_test_keypair(99), &stamp, vec![]).unwrap();
        let mut forged = CrossValidationStamp::new(&create_test_keypair(2), &stamp, vec![]).unwrap();
        forged.inconsistencies.push(Inconsistency::Errors);

        let ctx = coordinator
            .add_cross_validation_stamp(outsider)
            .add_cross_validation_stamp(forged);

        assert!(ctx.cross_validation_stamps.is_empty());
    }

    #[test]
    fn single_disagreement_breaks_commitment() {
        let coordinator = create_stamped_context(stamp::timestamp_ms());
        let stamp = coordinator.validation_stamp.clone().unwrap();
        let agree = CrossValidationStamp::new(&create_test_keypair(2), &stamp, vec![]).unwrap();
        let disagree = CrossValidationStamp::new(
            &create_test_keypair(3),
            &stamp,
            vec![Inconsistency::TransactionFee],
        )
        .unwrap();

        let ctx = coordinator
            .add_cross_validation_stamp(agree)
            .add_cross_validation_stamp(disagree);

        assert!(ctx.enough_cross_validation_stamps());
        assert!(!ctx.atomic_commitment());
    }

    #[test]
    fn chain_storage_position_lookup() {
        let ctx = create_test_context();

        assert_eq!(ctx.chain_storage_position(&public_key(11)).unwrap(), 1);
        assert_eq!(
            ctx.chain_storage_position(&public_key(99)).unwrap_err().kind,
            ErrorKind::ResourceNotFound
        );
    }

    #[test]
    fn storage_confirmations_quorum() {
        let ctx = create_stamped_context(1_000);
        let coordinator = public_key(COORDINATOR_SEED);
        assert!(!ctx.enough_storage_confirmations(&coordinator, StorageQuorum::Majority));

        let ctx = ctx.add_storage_confirmation(0, vec![1, 2, 3]).add_storage_confirmation(9, vec![]);

        assert!(ctx.enough_storage_confirmations(&coordinator, StorageQuorum::Majority));
        assert!(!ctx.enough_storage_confirmations(&public_key(2), StorageQuorum::All));
        assert_eq!(ctx.storage_nodes_confirmations.len(), 1);
        let attestation = ctx.replication_attestation().unwrap();
        assert_eq!(attestation.confirmations, vec![(0, vec![1, 2, 3])]);
    }

    #[test]
    fn unreachable_storage_nodes_are_contacted_last() {
        let mut ctx = confirm_all(create_test_context());
        ctx.chain_storage_nodes = (10..16).map(create_test_node).collect();
        let view = StorageNodesView {
            chain: bitset::from_bools(&[false, true, true, true, true, true]),
            ..Default::default()
        };
        let ctx = ctx
            .aggregate_mining_context(vec![], view, &public_key(2))
            .create_validation_stamp(&create_test_keypair(COORDINATOR_SEED), 1_000)
            .unwrap()
            .create_replication_tree();
        let coordinator = public_key(COORDINATOR_SEED);

        assert!(ctx.is_reported_unreachable(StorageKind::Chain, 0));
        assert!(!ctx.is_reported_unreachable(StorageKind::Chain, 3));
        assert!(!ctx.is_reported_unreachable(StorageKind::Beacon, 0));
        assert_eq!(
            ctx.chain_replication_nodes(&coordinator),
            vec![create_test_node(10), create_test_node(13)]
        );
        assert_eq!(
            ctx.chain_replication_plan(&coordinator),
            vec![create_test_node(13), create_test_node(10)]
        );
    }

    #[test]
    fn zero_quorum_still_needs_an_acknowledgment() {
        let ctx = create_stamped_context(1_000);
        let coordinator = public_key(COORDINATOR_SEED);

        assert!(!ctx.enough_storage_confirmations(&coordinator, StorageQuorum::AtLeast(0)));

        let ctx = ctx.add_storage_confirmation(0, vec![1]);

        assert!(ctx.enough_storage_confirmations(&coordinator, StorageQuorum::AtLeast(0)));
    }

    #[test]
    fn failover_follows_list_order() {
        let ctx = confirm_all(create_test_context());

        let ctx = ctx.next_coordinator().unwrap();
        assert_eq!(ctx.coordinator_node, create_test_node(2));
        assert_eq!(ctx.cross_validation_nodes, vec![create_test_node(3)]);
        assert_eq!(ctx.confirmation_count(), 0);
        assert_eq!(ctx.cross_validation_nodes_view.len(), 1);

        let ctx = ctx.next_coordinator().unwrap();
        assert_eq!(ctx.coordinator_node, create_test_node(3));
        assert!(ctx.cross_validation_nodes.is_empty());

        assert!(ctx.next_coordinator().is_none());
    }
}
