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

//! Peer to peer transport seam.
//!
//! Discovery, connection management and peers health are provided by the
//! hosting node. The mining core only needs to resolve a node from its key
//! and to exchange request/response messages with it.

use crate::{base::Node, crypto::PublicKey, mining::Message, Result};
use futures::future::BoxFuture;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait P2p: Send + Sync + 'static {
    /// Node currently registered with the given last public key.
    fn node_info(&self, public_key: &PublicKey) -> Option<Node>;

    /// Send a message and wait for the peer response.
    /// Transport failures are reported as `BadNetwork` errors.
    fn send_message(&self, node: &Node, message: Message) -> BoxFuture<'static, Result<Message>>;
}
