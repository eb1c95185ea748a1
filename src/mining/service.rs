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

use super::{
    message::{Message, MiningRequestSender},
    worker::MiningWorker,
    Collaborators, Registry, WorkflowReport,
};
use crate::{
    channel::{confirmed_channel, Receiver},
    crypto::KeyPair,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Number of storage acknowledgments required to attest a replication,
/// computed over the chain storage nodes assigned to the local node.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum StorageQuorum {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "majority")]
    Majority,
    /// Fixed number of acknowledgments, capped to the assigned nodes.
    #[serde(rename = "at_least")]
    AtLeast(usize),
}

impl Default for StorageQuorum {
    fn default() -> Self {
        StorageQuorum::Majority
    }
}

impl StorageQuorum {
    /// Acknowledgments required when `expected` nodes are contacted.
    /// At least one whenever some node is contacted.
    pub fn required(&self, expected: usize) -> usize {
        match self {
            StorageQuorum::All => expected,
            StorageQuorum::Majority => expected / 2 + 1,
            StorageQuorum::AtLeast(count) => (*count).max(1),
        }
        .min(expected)
    }
}

/// Mining service configuration. Timeouts are in milliseconds.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct MiningConfig {
    /// Max time to fetch the transaction chain context.
    pub context_timeout: u64,
    /// Max time the coordinator waits for the cross-validation nodes contexts.
    pub confirmation_timeout: u64,
    /// Max time a cross-validation node waits for the coordinator request.
    /// Should exceed `confirmation_timeout`.
    pub coordinator_timeout: u64,
    /// Hard stop of a round.
    pub global_timeout: u64,
    /// Max time for a single storage request.
    pub replication_timeout: u64,
    /// Max number of concurrent chain replication requests.
    pub replication_concurrency: usize,
    pub storage_quorum: StorageQuorum,
    /// Max number of unknown rounds with buffered events.
    pub max_orphans: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            context_timeout: 2_000,
            confirmation_timeout: 3_000,
            coordinator_timeout: 5_000,
            global_timeout: 30_000,
            replication_timeout: 3_000,
            replication_concurrency: 8,
            storage_quorum: StorageQuorum::Majority,
            max_orphans: 256,
        }
    }
}

/// Mining service data.
pub struct MiningService {
    /// Worker object.
    worker: Option<MiningWorker>,
    /// Threads data.
    handler: Option<JoinHandle<MiningWorker>>,
    /// To send messages to worker.
    tx_chan: MiningRequestSender,
    /// Running rounds.
    registry: Registry,
    /// To check if the worker thread is still alive.
    canary: Arc<()>,
}

impl MiningService {
    /// Create a new mining service instance.
    pub fn new(config: MiningConfig, keypair: Arc<KeyPair>, collaborators: Collaborators) -> Self {
        let (tx_chan, rx_chan) = confirmed_channel::<Message, Message>();

        let worker = MiningWorker::new(config, keypair, collaborators, rx_chan);
        let registry = worker.registry();

        MiningService {
            worker: Some(worker),
            handler: None,
            tx_chan,
            registry,
            canary: Arc::new(()),
        }
    }

    /// Start mining service.
    pub fn start(&mut self) {
        debug!("Starting mining service");
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                warn!("service was already running");
                return;
            }
        };

        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            worker.run_sync();
            worker
        });
        self.handler = Some(handle);
    }

    /// Stop mining service. Running rounds are stopped.
    pub fn stop(&mut self) {
        debug!("Stopping mining service");
        match self.handler.take() {
            Some(handle) => {
                if let Err(err) = self.tx_chan.send_sync(Message::Stop) {
                    error!("Error stopping mining service thread: {:?}", err);
                }
                match handle.join() {
                    Ok(worker) => self.worker = Some(worker),
                    Err(_) => error!("mining service thread panicked"),
                }
            }
            None => {
                debug!("service was not running");
            }
        };
    }

    /// Check if service is running.
    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2 && self.worker.is_none()
    }

    /// Get a clone of mining-service input channel.
    pub fn request_channel(&self) -> MiningRequestSender {
        self.tx_chan.clone()
    }

    /// Subscribe to the reports of the ending rounds.
    pub fn subscribe_reports(&self) -> Receiver<WorkflowReport> {
        self.registry.subscribe()
    }

    /// Set the mining configuration. Effective only while the service is stopped.
    pub fn set_config(&mut self, config: MiningConfig) {
        match self.worker.as_mut() {
            Some(worker) => worker.set_config(config),
            None => warn!("mining configuration not changed: service running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::Transaction,
        crypto::ed25519::tests::ed25519_test_keypair,
        election::MockElection,
        mining::{MockContextFetcher, ValidationContext},
        p2p::MockP2p,
        Result,
    };

    fn create_mining_service() -> MiningService {
        let collaborators = Collaborators {
            p2p: Arc::new(MockP2p::new()),
            election: Arc::new(MockElection::new()),
            context_fetcher: Arc::new(MockContextFetcher::new()),
            pending_validator: Arc::new(|_: &Transaction| -> Result<()> { Ok(()) }),
            malicious_detector: Arc::new(|_: &ValidationContext| {}),
        };
        MiningService::new(
            MiningConfig::default(),
            Arc::new(ed25519_test_keypair()),
            collaborators,
        )
    }

    #[test]
    fn start_stop() {
        let mut svc = create_mining_service();

        svc.start();
        assert!(svc.is_running());

        svc.stop();
        assert!(!svc.is_running());
    }

    #[test]
    fn stopped_subthread() {
        let mut svc = create_mining_service();

        svc.start();
        assert!(svc.is_running());

        svc.tx_chan.send_sync(Message::Stop).unwrap();
        std::thread::sleep(std::time::Duration::from_secs(1));

        assert!(!svc.is_running());
        svc.stop();
    }

    #[test]
    fn config_changes_only_when_stopped() {
        let mut svc = create_mining_service();
        let config = MiningConfig {
            global_timeout: 1_000,
            ..Default::default()
        };

        svc.set_config(config.clone());
        svc.start();
        svc.set_config(MiningConfig::default());
        svc.stop();

        let worker = svc.worker.as_ref().unwrap();
        assert_eq!(*worker.config().lock(), config);
    }

    #[test]
    fn quorum_requirements() {
        assert_eq!(StorageQuorum::All.required(3), 3);
        assert_eq!(StorageQuorum::Majority.required(3), 2);
        assert_eq!(StorageQuorum::Majority.required(4), 3);
        assert_eq!(StorageQuorum::Majority.required(0), 0);
        assert_eq!(StorageQuorum::AtLeast(5).required(3), 3);
        assert_eq!(StorageQuorum::AtLeast(1).required(3), 1);
        assert_eq!(StorageQuorum::AtLeast(0).required(3), 1);
        assert_eq!(StorageQuorum::AtLeast(0).required(0), 0);
    }

    #[test]
    fn partial_config_deserialization() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("global_timeout", 1_000u64);
        let buf = rmp_serde::to_vec_named(&fields).unwrap();

        let config: MiningConfig = rmp_serde::from_slice(&buf).unwrap();

        assert_eq!(config.global_timeout, 1_000);
        assert_eq!(config.storage_quorum, StorageQuorum::Majority);
        assert_eq!(config.confirmation_timeout, MiningConfig::default().confirmation_timeout);
    }
}
