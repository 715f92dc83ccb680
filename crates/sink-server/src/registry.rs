//! Registered chains and their ingestion heads

use parking_lot::RwLock;
use sink_types::ChainInfo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// One chain's display name and head, with a wake-up for sessions at the tip
pub struct ChainState {
    chain_id: u64,
    name: String,
    latest: RwLock<u64>,
    notify: Notify,
}

impl ChainState {
    fn new(chain_id: u64, name: String, latest: u64) -> Self {
        Self {
            chain_id,
            name,
            latest: RwLock::new(latest),
            notify: Notify::new(),
        }
    }

    /// Chain ID
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest ingested block
    pub fn latest(&self) -> u64 {
        *self.latest.read()
    }

    /// Raise the head. Lower values are ignored. Returns whether it moved.
    pub fn update_latest(&self, number: u64) -> bool {
        let mut latest = self.latest.write();
        if number <= *latest {
            return false;
        }
        *latest = number;
        drop(latest);
        self.notify.notify_waiters();
        true
    }

    /// Future resolving on the next head change. Create it before checking
    /// the head so an update in between is not missed.
    pub fn changed(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Listing entry
    pub fn info(&self) -> ChainInfo {
        ChainInfo {
            chain_id: self.chain_id,
            name: self.name.clone(),
            latest_block: self.latest(),
        }
    }
}

/// All chains known to the server
#[derive(Default)]
pub struct ChainRegistry {
    chains: RwLock<HashMap<u64, Arc<ChainState>>>,
}

impl ChainRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain, or return the existing entry
    pub fn register(&self, chain_id: u64, name: impl Into<String>, latest: u64) -> Arc<ChainState> {
        let mut chains = self.chains.write();
        Arc::clone(
            chains
                .entry(chain_id)
                .or_insert_with(|| Arc::new(ChainState::new(chain_id, name.into(), latest))),
        )
    }

    /// Look up a chain
    pub fn get(&self, chain_id: u64) -> Option<Arc<ChainState>> {
        self.chains.read().get(&chain_id).cloned()
    }

    /// Whether the chain is registered
    pub fn contains(&self, chain_id: u64) -> bool {
        self.chains.read().contains_key(&chain_id)
    }

    /// Latest block of a chain
    pub fn latest(&self, chain_id: u64) -> Option<u64> {
        self.get(chain_id).map(|chain| chain.latest())
    }

    /// Raise a chain's head; false when unknown or not higher
    pub fn update_latest(&self, chain_id: u64, number: u64) -> bool {
        self.get(chain_id)
            .map(|chain| chain.update_latest(number))
            .unwrap_or(false)
    }

    /// Every chain, ordered by chain ID
    pub fn list(&self) -> Vec<ChainInfo> {
        let mut infos: Vec<ChainInfo> = self.chains.read().values().map(|c| c.info()).collect();
        infos.sort_by_key(|info| info.chain_id);
        infos
    }

    /// Number of chains
    pub fn len(&self) -> usize {
        self.chains.read().len()
    }

    /// Whether no chain is registered
    pub fn is_empty(&self) -> bool {
        self.chains.read().is_empty()
    }
}
