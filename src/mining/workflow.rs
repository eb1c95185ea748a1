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

//! Mining round state machine.
//!
//! One workflow instance runs for each transaction a node is elected to
//! validate. Network messages, timer expirations and replication results are
//! funneled through a single event channel, so the validation context is only
//! ever touched by the instance task.
//!
//! Events that can't be handled in the current state are postponed and
//! replayed, in arrival order, after the next state transition.

use super::{
    replication, stamp, ContextFetcher, Message, MiningConfig, ReplicationTree, StorageKind,
    StorageNodesView, ValidationContext,
};
use crate::{
    base::{bitset, BitSet, CrossValidationStamp, Node, Transaction, ValidationStamp},
    channel::{simple_channel, Receiver, Sender},
    crypto::{Hash, KeyPair, PublicKey},
    election::Election,
    p2p::P2p,
    Error, ErrorKind, Result,
};
use async_std::{future, task};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

/// Closure trait to validate the pending transaction semantics.
pub trait PendingValidator: Fn(&Transaction) -> Result<()> + Send + Sync + 'static {}

impl<T: Fn(&Transaction) -> Result<()> + Send + Sync + 'static> PendingValidator for T {}

/// Closure trait invoked with the full context when consensus is not reached.
pub trait MaliciousDetector: Fn(&ValidationContext) + Send + Sync + 'static {}

impl<T: Fn(&ValidationContext) + Send + Sync + 'static> MaliciousDetector for T {}

/// External subsystems used by a mining round.
#[derive(Clone)]
pub struct Collaborators {
    pub p2p: Arc<dyn P2p>,
    pub election: Arc<dyn Election>,
    pub context_fetcher: Arc<dyn ContextFetcher>,
    pub pending_validator: Arc<dyn PendingValidator>,
    pub malicious_detector: Arc<dyn MaliciousDetector>,
}

/// Workflow states.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Idle,
    Coordinator,
    CrossValidator,
    WaitCrossValidationStamps,
    Replication,
    ConsensusNotReached,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum TimerKind {
    /// Hard stop of the whole round.
    Global,
    /// Coordinator wait for the cross-validation nodes contexts.
    ConfirmationWindow,
    /// Cross-validation node wait for the coordinator request.
    CoordinatorLiveness,
}

/// Workflow input events.
#[derive(Debug, Clone)]
pub enum Event {
    MiningContext {
        from: PublicKey,
        previous_storage_nodes: Vec<PublicKey>,
        view: StorageNodesView,
    },
    CrossValidate {
        validation_stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        confirmed_validation_nodes: BitSet,
    },
    CrossValidationDone {
        cross_validation_stamp: CrossValidationStamp,
    },
    StorageAcknowledged {
        node_public_key: PublicKey,
        signature: Vec<u8>,
    },
    /// Non fatal replication request failure.
    StorageFailed {
        node_public_key: PublicKey,
        error: Error,
    },
    /// Fatal replication failure.
    ReplicationError(Error),
    Timeout {
        kind: TimerKind,
        id: u64,
    },
    Stop,
}

impl Event {
    /// Extract the round address and the event carried by a peer message.
    pub fn from_message(message: Message) -> Option<(Hash, Event)> {
        match message {
            Message::AddMiningContext {
                address,
                validation_node_public_key,
                previous_storage_nodes_public_keys,
                chain_storage_nodes_view,
                beacon_storage_nodes_view,
                io_storage_nodes_view,
            } => {
                let event = Event::MiningContext {
                    from: validation_node_public_key,
                    previous_storage_nodes: previous_storage_nodes_public_keys,
                    view: StorageNodesView {
                        chain: chain_storage_nodes_view,
                        beacon: beacon_storage_nodes_view,
                        io: io_storage_nodes_view,
                    },
                };
                Some((address, event))
            }
            Message::CrossValidate {
                address,
                validation_stamp,
                replication_tree,
                confirmed_validation_nodes,
            } => {
                let event = Event::CrossValidate {
                    validation_stamp,
                    replication_tree,
                    confirmed_validation_nodes,
                };
                Some((address, event))
            }
            Message::CrossValidationDone {
                address,
                cross_validation_stamp,
            } => Some((
                address,
                Event::CrossValidationDone {
                    cross_validation_stamp,
                },
            )),
            _ => None,
        }
    }
}

/// How a round ended.
#[derive(Debug, PartialEq, Clone)]
pub enum Outcome {
    /// Storage quorum reached and attestation sent.
    Replicated,
    /// Cross-validation nodes disagree with the validation stamp.
    ConsensusNotReached,
    Aborted(Error),
    /// Global timer expired.
    TimedOut,
    Stopped,
}

/// Final report of a mining round.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub address: Hash,
    pub outcome: Outcome,
    pub context: ValidationContext,
}

/// Result of the handling of an event.
enum Step {
    Stay,
    Next(State),
    Postpone(Event),
    Discard,
    Finish(Outcome),
}

fn abort(kind: ErrorKind, reason: &str) -> Step {
    Step::Finish(Outcome::Aborted(Error::new_ext(kind, reason.to_string())))
}

pub struct Workflow {
    config: MiningConfig,
    keypair: Arc<KeyPair>,
    public_key: PublicKey,
    collaborators: Collaborators,
    context: ValidationContext,
    state: State,
    event_tx: Sender<Event>,
    event_rx: Receiver<Event>,
    /// Events to be handled before reading the channel again.
    inbox: VecDeque<Event>,
    postponed: Vec<Event>,
    /// Armed timers identifiers.
    timers: HashMap<TimerKind, u64>,
    timer_seq: u64,
    /// Replication requests still in flight.
    pending_replies: usize,
    /// Log prefix.
    tag: String,
}

impl Workflow {
    pub fn new(
        config: MiningConfig,
        keypair: Arc<KeyPair>,
        collaborators: Collaborators,
        context: ValidationContext,
    ) -> Self {
        let (event_tx, event_rx) = simple_channel();
        let public_key = keypair.public_key();
        let address = context.transaction.address;
        let tag = format!(
            "({}) {}",
            public_key.to_node_id(),
            hex::encode(&address.hash_value()[..4])
        );
        Workflow {
            config,
            keypair,
            public_key,
            collaborators,
            context,
            state: State::Idle,
            event_tx,
            event_rx,
            inbox: VecDeque::new(),
            postponed: vec![],
            timers: HashMap::new(),
            timer_seq: 0,
            pending_replies: 0,
            tag,
        }
    }

    /// Address of the transaction under validation.
    pub fn address(&self) -> Hash {
        self.context.transaction.address
    }

    pub fn event_sender(&self) -> Sender<Event> {
        self.event_tx.clone()
    }

    /// Queue events to be handled before the ones arriving on the channel.
    pub fn push_events(&mut self, events: Vec<Event>) {
        self.inbox.extend(events);
    }

    /// Run the round to completion.
    pub async fn run(mut self) -> WorkflowReport {
        debug!("[mining] {} round started", self.tag);
        let outcome = match self.start().await {
            Ok(state) => self.event_loop(state).await,
            Err(err) => Outcome::Aborted(err),
        };
        self.event_rx.close();
        match &outcome {
            Outcome::Replicated => info!("[mining] {} transaction replicated", self.tag),
            Outcome::Aborted(err) => {
                error!("[mining] {} round aborted: {}", self.tag, err.to_string_full())
            }
            other => warn!("[mining] {} round ended: {:?}", self.tag, other),
        }
        WorkflowReport {
            address: self.address(),
            outcome,
            context: self.context,
        }
    }

    fn update<F>(&mut self, op: F)
    where
        F: FnOnce(ValidationContext) -> ValidationContext,
    {
        self.context = op(self.context.clone());
    }

    fn try_update<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(ValidationContext) -> Result<ValidationContext>,
    {
        self.context = op(self.context.clone())?;
        Ok(())
    }

    async fn start(&mut self) -> Result<State> {
        self.arm_timer(TimerKind::Global);

        let valid = match (self.collaborators.pending_validator)(&self.context.transaction) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "[mining] {} invalid pending transaction: {}",
                    self.tag,
                    err.to_string_full()
                );
                false
            }
        };
        self.update(|ctx| ctx.set_pending_transaction_validation(valid));

        let fetch = self.collaborators.context_fetcher.fetch_context(
            self.context.transaction.previous_address(),
            self.context.chain_storage_nodes.clone(),
            self.context.beacon_storage_nodes.clone(),
            self.context.io_storage_nodes.clone(),
        );
        let timeout = Duration::from_millis(self.config.context_timeout);
        let tx_context = future::timeout(timeout, fetch).await??;
        self.update(|ctx| ctx.put_transaction_context(tx_context));

        if self.context.is_coordinator(&self.public_key) {
            Ok(State::Coordinator)
        } else if self
            .context
            .cross_validation_position(&self.public_key)
            .is_some()
        {
            Ok(State::CrossValidator)
        } else {
            Err(Error::new_ext(
                ErrorKind::InvalidElection,
                "not a validation node",
            ))
        }
    }

    async fn event_loop(&mut self, initial: State) -> Outcome {
        let mut step = Step::Next(initial);
        loop {
            match step {
                Step::Next(state) => {
                    debug!("[mining] {} {:?} -> {:?}", self.tag, self.state, state);
                    self.state = state;
                    for event in self.postponed.drain(..).rev() {
                        self.inbox.push_front(event);
                    }
                    step = self.enter_state().await;
                    continue;
                }
                Step::Finish(outcome) => return outcome,
                Step::Postpone(event) => {
                    trace!("[mining] {} postponed {:?}", self.tag, event);
                    self.postponed.push(event);
                }
                Step::Stay | Step::Discard => {}
            }
            let event = match self.inbox.pop_front() {
                Some(event) => event,
                None => match self.event_rx.recv().await {
                    Ok(event) => event,
                    Err(_) => return Outcome::Stopped,
                },
            };
            step = self.handle_event(event).await;
        }
    }

    async fn enter_state(&mut self) -> Step {
        match self.state {
            State::Idle => Step::Stay,
            State::Coordinator => self.enter_coordinator(),
            State::CrossValidator => self.enter_cross_validator(),
            State::WaitCrossValidationStamps => self.check_cross_validation_stamps(),
            State::Replication => self.enter_replication(),
            State::ConsensusNotReached => {
                (self.collaborators.malicious_detector)(&self.context);
                Step::Finish(Outcome::ConsensusNotReached)
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Step {
        match event {
            Event::Stop => return Step::Finish(Outcome::Stopped),
            Event::Timeout { kind, id } => return self.handle_timeout(kind, id),
            _ => (),
        }
        match self.state {
            State::Coordinator => self.on_coordinator(event),
            State::CrossValidator => self.on_cross_validator(event),
            State::WaitCrossValidationStamps => self.on_wait_cross_validation_stamps(event),
            State::Replication => self.on_replication(event).await,
            State::Idle | State::ConsensusNotReached => Step::Postpone(event),
        }
    }

    fn arm_timer(&mut self, kind: TimerKind) {
        self.timer_seq += 1;
        let id = self.timer_seq;
        self.timers.insert(kind, id);
        let delay = Duration::from_millis(match kind {
            TimerKind::Global => self.config.global_timeout,
            TimerKind::ConfirmationWindow => self.config.confirmation_timeout,
            TimerKind::CoordinatorLiveness => self.config.coordinator_timeout,
        });
        let event_tx = self.event_tx.clone();
        task::spawn(async move {
            task::sleep(delay).await;
            let _ = event_tx.send(Event::Timeout { kind, id }).await;
        });
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        self.timers.remove(&kind);
    }

    fn handle_timeout(&mut self, kind: TimerKind, id: u64) -> Step {
        if self.timers.get(&kind) != Some(&id) {
            return Step::Discard;
        }
        self.timers.remove(&kind);
        match (kind, self.state) {
            (TimerKind::Global, _) => Step::Finish(Outcome::TimedOut),
            (TimerKind::ConfirmationWindow, State::Coordinator) => {
                debug!(
                    "[mining] {} confirmation window expired ({} of {} confirmed)",
                    self.tag,
                    self.context.confirmation_count(),
                    self.context.cross_validation_nodes.len()
                );
                self.coordinate()
            }
            (TimerKind::CoordinatorLiveness, State::CrossValidator) => self.failover(),
            _ => Step::Discard,
        }
    }

    fn resolve_nodes(&self, public_keys: &[PublicKey]) -> Vec<Node> {
        public_keys
            .iter()
            .filter_map(|public_key| self.collaborators.p2p.node_info(public_key))
            .collect()
    }

    fn enter_coordinator(&mut self) -> Step {
        if self.context.cross_validation_nodes.is_empty() {
            return abort(ErrorKind::NoQuorum, "no cross-validation nodes");
        }
        self.arm_timer(TimerKind::ConfirmationWindow);
        Step::Stay
    }

    fn on_coordinator(&mut self, event: Event) -> Step {
        match event {
            Event::MiningContext {
                from,
                previous_storage_nodes,
                view,
            } => {
                if self.context.cross_validation_position(&from).is_none() {
                    warn!(
                        "[mining] {} context from unknown node {}",
                        self.tag,
                        from.to_node_id()
                    );
                    return Step::Discard;
                }
                let previous_storage_nodes = self.resolve_nodes(&previous_storage_nodes);
                self.update(|ctx| ctx.aggregate_mining_context(previous_storage_nodes, view, &from));
                match self.context.enough_confirmations() {
                    true => self.coordinate(),
                    false => Step::Stay,
                }
            }
            event @ Event::CrossValidationDone { .. } => Step::Postpone(event),
            _ => Step::Discard,
        }
    }

    /// Create stamp and replication tree and ask the confirmed
    /// cross-validation nodes to verify them.
    fn coordinate(&mut self) -> Step {
        self.cancel_timer(TimerKind::ConfirmationWindow);
        if self.context.confirmation_count() == 0 {
            return abort(ErrorKind::NoQuorum, "no cross-validation node confirmed");
        }

        let keypair = self.keypair.clone();
        let timestamp = stamp::timestamp_ms();
        if let Err(err) = self.try_update(|ctx| ctx.create_validation_stamp(&keypair, timestamp)) {
            return Step::Finish(Outcome::Aborted(err));
        }
        self.update(ValidationContext::create_replication_tree);

        let (validation_stamp, replication_tree) = match (
            &self.context.validation_stamp,
            &self.context.full_replication_tree,
        ) {
            (Some(stamp), Some(tree)) => (stamp.clone(), tree.clone()),
            _ => return abort(ErrorKind::Other, "validation stamp not created"),
        };
        let message = Message::CrossValidate {
            address: self.address(),
            validation_stamp,
            replication_tree,
            confirmed_validation_nodes: self.context.cross_validation_nodes_confirmation.clone(),
        };
        replication::notify(
            &self.collaborators.p2p,
            self.context.confirmed_cross_validation_nodes(),
            message,
        );
        Step::Next(State::WaitCrossValidationStamps)
    }

    fn enter_cross_validator(&mut self) -> Step {
        let previous_storage_nodes = self
            .context
            .previous_storage_nodes
            .iter()
            .map(|node| node.last_public_key)
            .collect();
        let message = Message::add_mining_context(
            self.address(),
            self.public_key,
            previous_storage_nodes,
            self.context.storage_nodes_view.clone(),
        );
        replication::notify(
            &self.collaborators.p2p,
            vec![self.context.coordinator_node.clone()],
            message,
        );
        self.arm_timer(TimerKind::CoordinatorLiveness);
        Step::Stay
    }

    fn on_cross_validator(&mut self, event: Event) -> Step {
        match event {
            Event::CrossValidate {
                validation_stamp,
                replication_tree,
                confirmed_validation_nodes,
            } => self.cross_validate(validation_stamp, replication_tree, confirmed_validation_nodes),
            event @ (Event::CrossValidationDone { .. } | Event::MiningContext { .. }) => {
                Step::Postpone(event)
            }
            _ => Step::Discard,
        }
    }

    fn cross_validate(
        &mut self,
        validation_stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        confirmed_validation_nodes: BitSet,
    ) -> Step {
        if confirmed_validation_nodes.len() != self.context.cross_validation_nodes.len() {
            warn!("[mining] {} malformed cross-validation request", self.tag);
            return Step::Discard;
        }
        let position = match self.context.cross_validation_position(&self.public_key) {
            Some(position) => position,
            None => return Step::Discard,
        };
        if !bitset::is_set(&confirmed_validation_nodes, position) {
            return abort(ErrorKind::InvalidElection, "not confirmed by the coordinator");
        }

        self.update(|ctx| {
            ctx.put_cross_validation_request(
                validation_stamp,
                replication_tree,
                confirmed_validation_nodes,
            )
        });
        let keypair = self.keypair.clone();
        let now = stamp::timestamp_ms();
        if let Err(err) = self.try_update(|ctx| ctx.cross_validate(&keypair, now)) {
            return Step::Finish(Outcome::Aborted(err));
        }
        self.cancel_timer(TimerKind::CoordinatorLiveness);

        let cross_validation_stamp = match self.context.cross_validation_stamps.last() {
            Some(stamp) => stamp.clone(),
            None => return abort(ErrorKind::Other, "cross-validation stamp not created"),
        };
        if !cross_validation_stamp.is_agreement() {
            warn!(
                "[mining] {} inconsistent validation stamp: {:?}",
                self.tag, cross_validation_stamp.inconsistencies
            );
        }
        let mut recipients = vec![self.context.coordinator_node.clone()];
        recipients.extend(
            self.context
                .confirmed_cross_validation_nodes()
                .into_iter()
                .filter(|node| node.last_public_key != self.public_key),
        );
        let message = Message::CrossValidationDone {
            address: self.address(),
            cross_validation_stamp,
        };
        replication::notify(&self.collaborators.p2p, recipients, message);
        Step::Next(State::WaitCrossValidationStamps)
    }

    /// Promote the next cross-validation node after a coordinator timeout.
    fn failover(&mut self) -> Step {
        let context = match self.context.clone().next_coordinator() {
            Some(context) => context,
            None => return abort(ErrorKind::NoQuorum, "no coordinator candidate left"),
        };
        self.context = context;
        warn!(
            "[mining] {} coordinator not responding, promoted {}",
            self.tag,
            self.context.coordinator_node.last_public_key.to_node_id()
        );
        match self.context.is_coordinator(&self.public_key) {
            true => Step::Next(State::Coordinator),
            false => Step::Next(State::CrossValidator),
        }
    }

    fn on_wait_cross_validation_stamps(&mut self, event: Event) -> Step {
        match event {
            Event::CrossValidationDone {
                cross_validation_stamp,
            } => {
                let collected = self.context.cross_validation_stamps.len();
                self.update(|ctx| ctx.add_cross_validation_stamp(cross_validation_stamp));
                if self.context.cross_validation_stamps.len() == collected {
                    warn!("[mining] {} cross-validation stamp rejected", self.tag);
                    return Step::Discard;
                }
                self.check_cross_validation_stamps()
            }
            _ => Step::Discard,
        }
    }

    fn check_cross_validation_stamps(&self) -> Step {
        if !self.context.enough_cross_validation_stamps() {
            return Step::Stay;
        }
        match self.context.atomic_commitment() {
            true => Step::Next(State::Replication),
            false => Step::Next(State::ConsensusNotReached),
        }
    }

    fn enter_replication(&mut self) -> Step {
        let transaction = match self.context.to_validated_transaction() {
            Some(transaction) => transaction,
            None => return abort(ErrorKind::Other, "validated transaction not available"),
        };
        let nodes = self.context.chain_replication_plan(&self.public_key);
        if nodes.is_empty() {
            debug!("[mining] {} no chain storage node assigned", self.tag);
            return Step::Finish(Outcome::Replicated);
        }
        let unreachable = nodes
            .iter()
            .filter_map(|node| self.context.chain_storage_position(&node.last_public_key).ok())
            .filter(|index| self.context.is_reported_unreachable(StorageKind::Chain, *index))
            .count();
        if unreachable > 0 {
            warn!(
                "[mining] {} {} of {} chain storage nodes reported unreachable",
                self.tag,
                unreachable,
                nodes.len()
            );
        }
        self.pending_replies = nodes.len();
        replication::fan_out(
            self.collaborators.p2p.clone(),
            nodes,
            transaction,
            self.config.replication_concurrency,
            Duration::from_millis(self.config.replication_timeout),
            self.event_tx.clone(),
        );
        Step::Stay
    }

    fn verify_acknowledgment(&self, node_public_key: &PublicKey, signature: &[u8]) -> Result<usize> {
        let index = self.context.chain_storage_position(node_public_key)?;
        let summary = self
            .context
            .transaction_summary()
            .ok_or_else(|| Error::new(ErrorKind::ResourceNotFound))?;
        match node_public_key.verify(&summary.signing_payload()?, signature) {
            true => Ok(index),
            false => Err(ErrorKind::InvalidSignature.into()),
        }
    }

    async fn on_replication(&mut self, event: Event) -> Step {
        match event {
            Event::StorageAcknowledged {
                node_public_key,
                signature,
            } => {
                self.pending_replies = self.pending_replies.saturating_sub(1);
                match self.verify_acknowledgment(&node_public_key, &signature) {
                    Ok(index) => self.update(|ctx| ctx.add_storage_confirmation(index, signature)),
                    Err(err) => warn!(
                        "[mining] {} acknowledgment from {} dropped: {}",
                        self.tag,
                        node_public_key.to_node_id(),
                        err
                    ),
                }
                self.check_replication().await
            }
            Event::StorageFailed {
                node_public_key,
                error,
            } => {
                self.pending_replies = self.pending_replies.saturating_sub(1);
                warn!(
                    "[mining] {} storage node {} failed: {}",
                    self.tag,
                    node_public_key.to_node_id(),
                    error.to_string_full()
                );
                self.check_replication().await
            }
            Event::ReplicationError(err) => Step::Finish(Outcome::Aborted(err)),
            _ => Step::Discard,
        }
    }

    async fn check_replication(&mut self) -> Step {
        let quorum = self.config.storage_quorum;
        if self
            .context
            .enough_storage_confirmations(&self.public_key, quorum)
        {
            self.notify_replicated().await;
            return Step::Finish(Outcome::Replicated);
        }
        match self.pending_replies {
            0 => abort(ErrorKind::ReplicationFault, "storage quorum not reached"),
            _ => Step::Stay,
        }
    }

    /// Attest the replication and notify the interested nodes.
    async fn notify_replicated(&self) {
        let (attestation, transaction) = match (
            self.context.replication_attestation(),
            self.context.to_validated_transaction(),
        ) {
            (Some(attestation), Some(transaction)) => (attestation, transaction),
            _ => return,
        };
        let p2p = &self.collaborators.p2p;
        let timeout = Duration::from_millis(self.config.replication_timeout);

        let mut attestation_nodes = vec![self.context.welcome_node.clone()];
        attestation_nodes.extend(self.context.beacon_replication_nodes(&self.public_key));
        let io_nodes = self.context.io_replication_nodes(&self.public_key);
        let notification = Message::NotifyLastTransactionAddress {
            last_address: transaction.address,
            previous_address: transaction.previous_address(),
            timestamp: attestation.transaction_summary.timestamp,
        };

        futures::join!(
            replication::deliver(
                p2p,
                attestation_nodes,
                Message::ReplicationAttestation { attestation },
                timeout,
            ),
            replication::deliver(
                p2p,
                io_nodes,
                Message::ReplicateTransaction { transaction },
                timeout,
            ),
            replication::deliver(
                p2p,
                self.context.previous_storage_nodes.clone(),
                notification,
                timeout,
            ),
        );
    }
}
