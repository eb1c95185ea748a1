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

//! Messages exchanged by the mining service.
//! Message elements defined as "packed" are structures serialized in
//! "MessagePack" format.

use super::{ReplicationTree, StorageNodesView};
use crate::{
    base::{BitSet, CrossValidationStamp, ReplicationAttestation, Transaction, ValidationStamp},
    channel,
    crypto::{Hash, PublicKey},
    Error,
};

/// Message types enumeration.
/// Enum variants are internally tagged with numeric strings.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// Exception response used for the full set of messages.
    #[serde(rename = "0")]
    Exception(Error),
    /// Generic positive response.
    #[serde(rename = "1")]
    Ok,
    /// Start a mining round. Sent by the welcome node to every validation node.
    #[serde(rename = "2")]
    StartMining {
        /// Pending transaction.
        transaction: Transaction,
        welcome_node_public_key: PublicKey,
        /// Elected validation nodes, coordinator first.
        validation_node_public_keys: Vec<PublicKey>,
    },
    /// Context gathered by a cross-validation node, sent to the coordinator.
    #[serde(rename = "3")]
    AddMiningContext {
        /// Transaction address.
        address: Hash,
        validation_node_public_key: PublicKey,
        previous_storage_nodes_public_keys: Vec<PublicKey>,
        chain_storage_nodes_view: BitSet,
        beacon_storage_nodes_view: BitSet,
        io_storage_nodes_view: BitSet,
    },
    /// Coordinator request to cross-validate its stamp.
    #[serde(rename = "4")]
    CrossValidate {
        address: Hash,
        validation_stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        /// One bit per cross-validation node.
        confirmed_validation_nodes: BitSet,
    },
    /// Cross-validation result, sent to every confirmed validation node.
    #[serde(rename = "5")]
    CrossValidationDone {
        address: Hash,
        cross_validation_stamp: CrossValidationStamp,
    },
    /// Request to store a validated transaction as part of its chain.
    #[serde(rename = "6")]
    ReplicateTransactionChain { transaction: Transaction },
    /// Storage acknowledgment of a `ReplicateTransactionChain` request.
    #[serde(rename = "7")]
    AcknowledgeStorage {
        address: Hash,
        /// Signature of the transaction summary.
        #[serde(with = "serde_bytes")]
        signature: Vec<u8>,
        node_public_key: PublicKey,
    },
    /// Best effort copy of a validated transaction (IO storage nodes).
    #[serde(rename = "8")]
    ReplicateTransaction { transaction: Transaction },
    /// Replication proof, sent to the welcome node and beacon storage nodes.
    #[serde(rename = "9")]
    ReplicationAttestation { attestation: ReplicationAttestation },
    /// Notify the previous storage nodes about the new chain head.
    #[serde(rename = "10")]
    NotifyLastTransactionAddress {
        last_address: Hash,
        previous_address: Hash,
        timestamp: u64,
    },
    /// Stop mining service.
    #[serde(rename = "254")]
    Stop,
    /// Packed message serialized using MessagePack.
    #[serde(rename = "255")]
    Packed {
        /// Serialized message bytes.
        #[serde(with = "serde_bytes")]
        buf: Vec<u8>,
    },
}

impl Message {
    /// Builds the context message of a cross-validation node.
    pub fn add_mining_context(
        address: Hash,
        validation_node_public_key: PublicKey,
        previous_storage_nodes_public_keys: Vec<PublicKey>,
        view: StorageNodesView,
    ) -> Self {
        Message::AddMiningContext {
            address,
            validation_node_public_key,
            previous_storage_nodes_public_keys,
            chain_storage_nodes_view: view.chain,
            beacon_storage_nodes_view: view.beacon,
            io_storage_nodes_view: view.io,
        }
    }
}

/// Helper structure to transparently deserialize both single and vector of
/// messages. Used to deserialize the content of `Packed` message types.
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum MultiMessage {
    /// Simple message.
    Simple(Message),
    /// Vector of messages.
    Sequence(Vec<Message>),
}

/// Mining request sender alias.
pub type MiningRequestSender = channel::RequestSender<Message, Message>;

/// Mining request receiver alias.
pub type MiningRequestReceiver = channel::RequestReceiver<Message, Message>;

/// Mining response sender alias.
pub type MiningResponseSender = channel::Sender<Message>;
