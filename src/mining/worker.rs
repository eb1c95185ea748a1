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
    message::{Message, MiningRequestReceiver, MiningResponseSender},
    Collaborators, Dispatcher, MiningConfig, Registry,
};
use crate::{base::Mutex, crypto::KeyPair};
use async_std::task;
use std::sync::Arc;

pub struct MiningWorker {
    /// Mining service configuration.
    config: Arc<Mutex<MiningConfig>>,
    /// Mining requests receiver.
    rx_chan: MiningRequestReceiver,
    /// Dispatcher subsystem, in charge of handling incoming mining messages.
    dispatcher: Dispatcher,
    /// Running rounds.
    registry: Registry,
}

impl MiningWorker {
    pub fn new(
        config: MiningConfig,
        keypair: Arc<KeyPair>,
        collaborators: Collaborators,
        rx_chan: MiningRequestReceiver,
    ) -> Self {
        let registry = Registry::new(config.max_orphans);
        let config = Arc::new(Mutex::new(config));
        let dispatcher = Dispatcher::new(config.clone(), keypair, collaborators, registry.clone());
        MiningWorker {
            config,
            rx_chan,
            dispatcher,
            registry,
        }
    }

    /// Set the mining configuration. Running rounds keep the old one.
    pub fn set_config(&mut self, config: MiningConfig) {
        *self.config.lock() = config;
    }

    /// Get a shared reference to the configuration.
    pub fn config(&self) -> Arc<Mutex<MiningConfig>> {
        self.config.clone()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    fn handle_message(&self, req: Message, res_chan: MiningResponseSender) {
        let dispatcher = self.dispatcher.clone();
        task::spawn(async move {
            if let Some(res) = dispatcher.message_handler(req).await {
                if let Err(_err) = res_chan.send(res).await {
                    warn!("[mining] response send error");
                }
            }
        });
    }

    /// Mining worker asynchronous task.
    /// This can be stopped by submitting a `Stop` message to its input channel,
    /// the running rounds are stopped as well.
    pub async fn run(&mut self) {
        while let Ok((req, res_chan)) = self.rx_chan.recv().await {
            match req {
                Message::Stop => {
                    self.registry.stop_all().await;
                    break;
                }
                req => self.handle_message(req, res_chan),
            }
        }
        debug!("[mining] worker exit");
    }

    /// Mining worker synchronous task.
    pub fn run_sync(&mut self) {
        task::block_on(self.run());
    }
}
