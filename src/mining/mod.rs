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

//! Transaction mining service components.
//!
//! Every transaction is validated by a small set of elected nodes, without a
//! chain of blocks: one coordinator produces the validation stamp and the
//! replication plan, the cross-validation nodes verify them and, once all of
//! them agree, each validation node replicates the transaction to its share
//! of the storage nodes.
//!
//! The service exploits several sub-modules, in particular:
//! - dispatcher: handle incoming mining messages.
//! - registry: keeps track of the running rounds.
//! - workflow: the per-round state machine.
//! - context: the data gathered and produced during a round.
//! - replication: outbound traffic toward the storage nodes.
//!
//! External components can interact with mining service via message
//! passing.

pub(crate) mod context;
pub(crate) mod dispatcher;
pub(crate) mod registry;
pub(crate) mod replication;
pub(crate) mod transaction_context;
pub(crate) mod workflow;

pub mod message;
pub mod service;
pub mod stamp;
pub mod worker;


pub use context::{ReplicationTree, StorageKind, StorageNodesView, ValidationContext};
pub use dispatcher::Dispatcher;
pub use message::{
    Message, MiningRequestReceiver, MiningRequestSender, MiningResponseSender, MultiMessage,
};
pub use registry::Registry;
pub use service::{MiningConfig, MiningService, StorageQuorum};
pub use transaction_context::{ContextFetcher, TransactionContext};
pub use workflow::{
    Collaborators, Event, MaliciousDetector, Outcome, PendingValidator, State, TimerKind,
    Workflow, WorkflowReport,
};

#[cfg(test)]
pub use transaction_context::MockContextFetcher;
