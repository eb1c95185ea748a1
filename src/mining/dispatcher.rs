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

//! Entry point of the messages directed to the mining service.

use super::{
    message::{Message, MultiMessage},
    Collaborators, Event, MiningConfig, Registry, ValidationContext, Workflow,
};
use crate::{
    base::{
        serialize::{rmp_deserialize, rmp_serialize},
        Mutex, Node, Transaction,
    },
    crypto::{KeyPair, PublicKey},
    Error, ErrorKind, Result,
};
use std::sync::Arc;

pub struct Dispatcher {
    /// Mining service configuration.
    config: Arc<Mutex<MiningConfig>>,
    /// Local node keys.
    keypair: Arc<KeyPair>,
    collaborators: Collaborators,
    /// Running rounds.
    registry: Registry,
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Dispatcher {
            config: self.config.clone(),
            keypair: self.keypair.clone(),
            collaborators: self.collaborators.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl Dispatcher {
    pub fn new(
        config: Arc<Mutex<MiningConfig>>,
        keypair: Arc<KeyPair>,
        collaborators: Collaborators,
        registry: Registry,
    ) -> Self {
        Dispatcher {
            config,
            keypair,
            collaborators,
            registry,
        }
    }

    fn resolve_node(&self, public_key: &PublicKey) -> Result<Node> {
        self.collaborators.p2p.node_info(public_key).ok_or_else(|| {
            Error::new_ext(
                ErrorKind::ResourceNotFound,
                format!("unknown node {}", public_key.to_node_id()),
            )
        })
    }

    /// Check the election and start a new round.
    fn start_mining(
        &self,
        transaction: Transaction,
        welcome_node_public_key: PublicKey,
        validation_node_public_keys: Vec<PublicKey>,
    ) -> Result<()> {
        let election = &self.collaborators.election;
        let elected: Vec<PublicKey> = election
            .validation_nodes(&transaction)
            .iter()
            .map(|node| node.last_public_key)
            .collect();
        if elected.is_empty() || elected != validation_node_public_keys {
            return Err(Error::new_ext(
                ErrorKind::InvalidElection,
                "validation nodes do not match the election",
            ));
        }
        if !elected.contains(&self.keypair.public_key()) {
            return Err(Error::new_ext(
                ErrorKind::InvalidElection,
                "local node is not a validation node",
            ));
        }

        let welcome_node = self.resolve_node(&welcome_node_public_key)?;
        let mut validation_nodes = validation_node_public_keys
            .iter()
            .map(|public_key| self.resolve_node(public_key))
            .collect::<Result<Vec<Node>>>()?
            .into_iter();
        let coordinator_node = validation_nodes
            .next()
            .ok_or_else(|| Error::new(ErrorKind::InvalidElection))?;

        let context = ValidationContext::new(
            transaction.clone(),
            welcome_node,
            coordinator_node,
            validation_nodes.collect(),
            election.chain_storage_nodes(&transaction.address),
            election.beacon_storage_nodes(&transaction.address),
            election.io_storage_nodes(&transaction),
        );
        let workflow = Workflow::new(
            self.config.lock().clone(),
            self.keypair.clone(),
            self.collaborators.clone(),
            context,
        );
        self.registry.spawn(workflow)?;
        debug!("[mining] round started for {}", transaction.address);
        Ok(())
    }

    fn start_mining_handler(
        &self,
        transaction: Transaction,
        welcome_node_public_key: PublicKey,
        validation_node_public_keys: Vec<PublicKey>,
    ) -> Message {
        match self.start_mining(
            transaction,
            welcome_node_public_key,
            validation_node_public_keys,
        ) {
            Ok(()) => Message::Ok,
            Err(err) => {
                warn!("[mining] round not started: {}", err.to_string_full());
                Message::Exception(err)
            }
        }
    }

    async fn request_handler(&self, req: Message) -> Option<Message> {
        match req {
            Message::StartMining {
                transaction,
                welcome_node_public_key,
                validation_node_public_keys,
            } => Some(self.start_mining_handler(
                transaction,
                welcome_node_public_key,
                validation_node_public_keys,
            )),
            req @ (Message::AddMiningContext { .. }
            | Message::CrossValidate { .. }
            | Message::CrossValidationDone { .. }) => {
                if let Some((address, event)) = Event::from_message(req) {
                    self.registry.route(address, event).await;
                }
                Some(Message::Ok)
            }
            Message::ReplicateTransactionChain { .. }
            | Message::ReplicateTransaction { .. }
            | Message::ReplicationAttestation { .. }
            | Message::NotifyLastTransactionAddress { .. } => Some(Message::Exception(
                Error::new_ext(ErrorKind::NotImplemented, "storage requests are not served here"),
            )),
            _ => None,
        }
    }

    async fn packed_message_handler(&self, buf: Vec<u8>) -> Option<Message> {
        trace!("RX ({}): {}", buf.len(), hex::encode(&buf));
        const ARRAY_HIGH_NIBBLE: u8 = 0x90;

        // Only the anonymous serialization format is accepted.
        let tag = buf.first().cloned().unwrap_or_default();
        if (tag & ARRAY_HIGH_NIBBLE) != ARRAY_HIGH_NIBBLE {
            let err = Error::new_ext(
                ErrorKind::MalformedData,
                "expected anonymous serialization format",
            );
            return Some(Message::Exception(err));
        }

        let res = match rmp_deserialize(&buf) {
            Ok(MultiMessage::Simple(req)) => self.request_handler(req).await.map(MultiMessage::Simple),
            Ok(MultiMessage::Sequence(requests)) => {
                let mut responses = Vec::with_capacity(requests.len());
                for req in requests.into_iter() {
                    if let Some(res) = self.request_handler(req).await {
                        responses.push(res);
                    }
                }
                match responses.is_empty() {
                    true => None,
                    false => Some(MultiMessage::Sequence(responses)),
                }
            }
            Err(_err) => {
                let res = Message::Exception(ErrorKind::MalformedData.into());
                Some(MultiMessage::Simple(res))
            }
        };
        res.map(|res| {
            let buf = rmp_serialize(&res).unwrap_or_default();
            trace!("TX ({}): {}", buf.len(), hex::encode(&buf));
            Message::Packed { buf }
        })
    }

    /// Handle a request, returning the response (if any).
    pub async fn message_handler(&self, req: Message) -> Option<Message> {
        match req {
            Message::Packed { buf } => self.packed_message_handler(buf).await,
            req => self.request_handler(req).await,
        }
    }
}
