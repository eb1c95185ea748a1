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

//! Outbound traffic of a mining round.
//!
//! The chain replication requests run concurrently and report back to the
//! workflow through its event channel. Everything else is either fire and
//! forget or awaited with a bound.

use super::{workflow::Event, Message};
use crate::{
    base::{Node, Transaction},
    channel::Sender,
    error::{Error, ErrorKind, Result},
    p2p::P2p,
};
use async_std::{future, task};
use futures::{future::join_all, stream, StreamExt};
use std::{sync::Arc, time::Duration};

fn check_response(response: Result<Message>) -> Result<()> {
    match response? {
        Message::Exception(err) => Err(err),
        _ => Ok(()),
    }
}

/// Send a message to each node without waiting for the responses.
pub fn notify(p2p: &Arc<dyn P2p>, nodes: Vec<Node>, message: Message) {
    for node in nodes {
        let request = p2p.send_message(&node, message.clone());
        task::spawn(async move {
            if let Err(err) = check_response(request.await) {
                debug!(
                    "[replication] message to {} failed: {}",
                    node.last_public_key.to_node_id(),
                    err.to_string_full()
                );
            }
        });
    }
}

/// Send a message to each node and wait for all the responses, each request
/// bounded by `timeout`. Failures are only logged.
pub async fn deliver(p2p: &Arc<dyn P2p>, nodes: Vec<Node>, message: Message, timeout: Duration) {
    let requests = nodes.into_iter().map(|node| {
        let request = p2p.send_message(&node, message.clone());
        async move {
            let response = match future::timeout(timeout, request).await {
                Ok(response) => response,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = check_response(response) {
                warn!(
                    "[replication] delivery to {} failed: {}",
                    node.last_public_key.to_node_id(),
                    err.to_string_full()
                );
            }
        }
    });
    join_all(requests).await;
}

fn storage_event(node: &Node, response: Result<Message>) -> Event {
    match response {
        Ok(Message::AcknowledgeStorage {
            signature,
            node_public_key,
            ..
        }) => Event::StorageAcknowledged {
            node_public_key,
            signature,
        },
        Ok(Message::Exception(err)) => Event::ReplicationError(err),
        Ok(_) => Event::StorageFailed {
            node_public_key: node.last_public_key,
            error: Error::new_ext(ErrorKind::MalformedData, "unexpected response"),
        },
        Err(error) => Event::StorageFailed {
            node_public_key: node.last_public_key,
            error,
        },
    }
}

/// Send the validated transaction to the given chain storage nodes, at most
/// `concurrency` requests at a time. The outcome of each request is posted to
/// the workflow as an event.
pub fn fan_out(
    p2p: Arc<dyn P2p>,
    nodes: Vec<Node>,
    transaction: Transaction,
    concurrency: usize,
    timeout: Duration,
    events: Sender<Event>,
) {
    task::spawn(async move {
        stream::iter(nodes)
            .for_each_concurrent(concurrency.max(1), |node| {
                let request = p2p.send_message(
                    &node,
                    Message::ReplicateTransactionChain {
                        transaction: transaction.clone(),
                    },
                );
                let events = events.clone();
                async move {
                    let response = match future::timeout(timeout, request).await {
                        Ok(response) => response,
                        Err(err) => Err(err.into()),
                    };
                    let event = storage_event(&node, response);
                    if events.send(event).await.is_err() {
                        trace!("[replication] round closed before the storage response");
                    }
                }
            })
            .await;
    });
}
