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

//! Running mining rounds, indexed by transaction address.
//!
//! Events addressed to a round that is not registered yet are kept aside and
//! delivered when the round starts. The orphans buffer is bounded, the oldest
//! address is evicted first. Late events for a recently finished round are
//! dropped.
//!
//! Rounds reports are published to every subscriber. If the subscriber closes
//! the receiving side of the channel then this is interpreted as an implicit
//! unsubscribe.

use super::workflow::{Event, Workflow, WorkflowReport};
use crate::{
    base::{Mutex, RwLock},
    channel::{simple_channel, Receiver, Sender},
    crypto::Hash,
    Error, ErrorKind, Result,
};
use async_std::task::{self, JoinHandle};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

/// Max number of buffered events for a single unknown round.
const MAX_ORPHAN_EVENTS: usize = 64;

/// Number of finished rounds remembered to drop their late events.
const MAX_FINISHED_ROUNDS: usize = 256;

struct Rounds {
    running: HashMap<Hash, Sender<Event>>,
    orphans: HashMap<Hash, Vec<Event>>,
    /// Orphans addresses in arrival order.
    orphans_order: VecDeque<Hash>,
    max_orphans: usize,
    /// Recently finished rounds, oldest first.
    finished: VecDeque<Hash>,
}

impl Rounds {
    fn finish(&mut self, address: Hash) {
        self.running.remove(&address);
        if self.finished.len() >= MAX_FINISHED_ROUNDS {
            self.finished.pop_front();
        }
        self.finished.push_back(address);
    }

    /// Register a running round and take its orphan events.
    fn register(&mut self, address: Hash, sender: Sender<Event>) -> Vec<Event> {
        self.finished.retain(|finished| *finished != address);
        self.running.insert(address, sender);
        self.take_orphans(&address)
    }

    fn is_finished(&self, address: &Hash) -> bool {
        self.finished.contains(address)
    }

    fn add_orphan(&mut self, address: Hash, event: Event) {
        if let Some(events) = self.orphans.get_mut(&address) {
            if events.len() < MAX_ORPHAN_EVENTS {
                events.push(event);
            } else {
                warn!("[registry] too many orphan events for {}", address);
            }
            return;
        }
        if self.max_orphans == 0 {
            return;
        }
        while self.orphans_order.len() >= self.max_orphans {
            if let Some(oldest) = self.orphans_order.pop_front() {
                debug!("[registry] evicted orphan events for {}", oldest);
                self.orphans.remove(&oldest);
            }
        }
        self.orphans_order.push_back(address);
        self.orphans.insert(address, vec![event]);
    }

    fn take_orphans(&mut self, address: &Hash) -> Vec<Event> {
        match self.orphans.remove(address) {
            Some(events) => {
                self.orphans_order.retain(|orphan| orphan != address);
                events
            }
            None => vec![],
        }
    }
}

/// Shared registry of the running rounds.
#[derive(Clone)]
pub struct Registry {
    rounds: Arc<RwLock<Rounds>>,
    subscribers: Arc<Mutex<Vec<Sender<WorkflowReport>>>>,
}

impl Registry {
    pub fn new(max_orphans: usize) -> Self {
        let rounds = Rounds {
            running: HashMap::new(),
            orphans: HashMap::new(),
            orphans_order: VecDeque::new(),
            max_orphans,
            finished: VecDeque::new(),
        };
        Registry {
            rounds: Arc::new(RwLock::new(rounds)),
            subscribers: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Subscribe to the reports of the rounds ending from now on.
    pub fn subscribe(&self) -> Receiver<WorkflowReport> {
        let (tx_chan, rx_chan) = simple_channel();
        self.subscribers.lock().push(tx_chan);
        rx_chan
    }

    pub fn contains(&self, address: &Hash) -> bool {
        self.rounds.read().running.contains_key(address)
    }

    /// Number of running rounds.
    pub fn len(&self) -> usize {
        self.rounds.read().running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of addresses with orphan events.
    pub fn orphans_count(&self) -> usize {
        self.rounds.read().orphans_order.len()
    }

    /// Register and start a round.
    /// Fails if a round for the same address is already running.
    pub fn spawn(&self, mut workflow: Workflow) -> Result<JoinHandle<WorkflowReport>> {
        let address = workflow.address();
        let orphans = {
            let mut rounds = self.rounds.write();
            if rounds.running.contains_key(&address) {
                return Err(Error::new_ext(
                    ErrorKind::DuplicatedWorkflow,
                    format!("round for {} already running", address),
                ));
            }
            rounds.register(address, workflow.event_sender())
        };
        if !orphans.is_empty() {
            debug!("[registry] {} orphan events for {}", orphans.len(), address);
        }
        workflow.push_events(orphans);

        let registry = self.clone();
        let handle = task::spawn(async move {
            let report = workflow.run().await;
            registry.remove(&report.address);
            registry.publish(&report).await;
            report
        });
        Ok(handle)
    }

    /// Forward an event to the round of the given address.
    pub async fn route(&self, address: Hash, event: Event) {
        let sender = {
            let mut rounds = self.rounds.write();
            match rounds.running.get(&address) {
                Some(sender) => sender.clone(),
                None if rounds.is_finished(&address) => {
                    trace!("[registry] dropped late event for {}", address);
                    return;
                }
                None => {
                    rounds.add_orphan(address, event);
                    return;
                }
            }
        };
        if sender.send(event).await.is_err() {
            debug!("[registry] round {} already closed", address);
        }
    }

    fn remove(&self, address: &Hash) {
        self.rounds.write().finish(*address);
    }

    async fn publish(&self, report: &WorkflowReport) {
        let subscribers = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|sub| !sub.is_closed());
            subscribers.clone()
        };
        for sub in subscribers {
            if sub.send(report.clone()).await.is_err() {
                debug!("[registry] report subscriber gone");
            }
        }
    }

    /// Stop all the running rounds.
    pub async fn stop_all(&self) {
        let senders: Vec<Sender<Event>> = self.rounds.read().running.values().cloned().collect();
        for sender in senders {
            let _ = sender.send(Event::Stop).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::schema::tests::create_test_address,
        crypto::ed25519::tests::create_test_keypair,
        mining::{
            context::tests::create_test_context, workflow::tests::create_workflow,
            StorageNodesView,
        },
        p2p::MockP2p,
    };

    fn context_event(seed: u8) -> Event {
        Event::MiningContext {
            from: create_test_keypair(seed).public_key(),
            previous_storage_nodes: vec![],
            view: StorageNodesView::default(),
        }
    }

    fn event_source(event: &Event) -> Option<u8> {
        match event {
            Event::MiningContext { from, .. } => {
                (0..=255u8).find(|seed| create_test_keypair(*seed).public_key() == *from)
            }
            _ => None,
        }
    }

    #[test]
    fn orphans_are_kept_in_order() {
        let registry = Registry::new(4);
        let address = create_test_address(1);

        task::block_on(async {
            registry.route(address, context_event(1)).await;
            registry.route(address, context_event(2)).await;
        });

        let mut rounds = registry.rounds.write();
        let orphans = rounds.take_orphans(&address);
        let sources: Vec<Option<u8>> = orphans.iter().map(event_source).collect();
        assert_eq!(sources, vec![Some(1), Some(2)]);
        assert!(rounds.orphans_order.is_empty());
    }

    #[test]
    fn oldest_orphan_is_evicted() {
        let registry = Registry::new(2);

        task::block_on(async {
            for seed in 1..=3 {
                registry.route(create_test_address(seed), context_event(seed)).await;
            }
        });

        assert_eq!(registry.orphans_count(), 2);
        let rounds = registry.rounds.read();
        assert!(!rounds.orphans.contains_key(&create_test_address(1)));
        assert!(rounds.orphans.contains_key(&create_test_address(3)));
    }

    #[test]
    fn orphan_events_per_round_are_bounded() {
        let registry = Registry::new(2);
        let address = create_test_address(1);

        task::block_on(async {
            for _ in 0..MAX_ORPHAN_EVENTS + 5 {
                registry.route(address, Event::Stop).await;
            }
        });

        let rounds = registry.rounds.read();
        assert_eq!(rounds.orphans[&address].len(), MAX_ORPHAN_EVENTS);
    }

    #[test]
    fn late_events_of_finished_round_are_dropped() {
        let registry = Registry::new(4);
        let address = create_test_address(1);
        let (tx_chan, _rx_chan) = simple_channel();
        registry.rounds.write().register(address, tx_chan);

        registry.remove(&address);
        task::block_on(registry.route(address, context_event(2)));

        assert!(!registry.contains(&address));
        assert_eq!(registry.orphans_count(), 0);

        let (tx_chan, _rx_chan) = simple_channel();
        let orphans = registry.rounds.write().register(address, tx_chan);

        assert!(orphans.is_empty());
        assert!(registry.contains(&address));
        assert!(!registry.rounds.read().is_finished(&address));
    }

    #[test]
    fn finished_rounds_record_is_bounded() {
        let registry = Registry::new(4);
        let mut rounds = registry.rounds.write();

        for i in 0..MAX_FINISHED_ROUNDS + 1 {
            rounds.finish(Hash::from_data(&i.to_be_bytes()));
        }

        assert_eq!(rounds.finished.len(), MAX_FINISHED_ROUNDS);
        assert!(!rounds.is_finished(&Hash::from_data(&0usize.to_be_bytes())));
        assert!(rounds.is_finished(&Hash::from_data(&1usize.to_be_bytes())));
    }

    #[test]
    fn duplicated_round() {
        let registry = Registry::new(2);
        let ctx = create_test_context();
        let address = ctx.transaction.address;
        let (tx_chan, _rx_chan) = simple_channel();
        registry.rounds.write().running.insert(address, tx_chan);

        let workflow = create_workflow(1, Default::default(), MockP2p::new(), ctx);
        let err = registry.spawn(workflow).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DuplicatedWorkflow);
        assert!(registry.contains(&address));
    }
}
