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

//! Chain context of the transaction under validation.

use super::StorageNodesView;
use crate::{
    base::{Node, Transaction, UnspentOutput},
    crypto::Hash,
    Result,
};
use futures::future::BoxFuture;

#[cfg(test)]
use mockall::automock;

/// Data fetched from the storage nodes of the transaction chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionContext {
    /// Last transaction of the chain, `None` for a new chain.
    pub previous_transaction: Option<Transaction>,
    pub unspent_outputs: Vec<UnspentOutput>,
    /// Nodes currently holding the chain.
    pub previous_storage_nodes: Vec<Node>,
    /// Availability of the candidate storage nodes observed while fetching.
    pub view: StorageNodesView,
}

/// Retrieves the transaction chain context from the network.
#[cfg_attr(test, automock)]
pub trait ContextFetcher: Send + Sync + 'static {
    fn fetch_context(
        &self,
        previous_address: Hash,
        chain_storage_nodes: Vec<Node>,
        beacon_storage_nodes: Vec<Node>,
        io_storage_nodes: Vec<Node>,
    ) -> BoxFuture<'static, Result<TransactionContext>>;
}
