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

//! Election of the nodes taking part to a mining round.
//!
//! Ranking algorithms live outside of this crate. Implementors compute the
//! elected sets over their current view of the network; the returned order is
//! significant and must be the same on every node.

use crate::{
    base::{Node, Transaction},
    crypto::Hash,
};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait Election: Send + Sync + 'static {
    /// Validation nodes of a transaction, the first one is the coordinator.
    fn validation_nodes(&self, tx: &Transaction) -> Vec<Node>;

    /// Nodes in charge of storing the chain of the given address.
    fn chain_storage_nodes(&self, address: &Hash) -> Vec<Node>;

    /// Nodes in charge of storing the beacon summary of the given address.
    fn beacon_storage_nodes(&self, address: &Hash) -> Vec<Node>;

    /// Nodes in charge of storing the transaction movements and recipients.
    fn io_storage_nodes(&self, tx: &Transaction) -> Vec<Node>;
}
