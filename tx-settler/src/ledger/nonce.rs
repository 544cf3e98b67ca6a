use std::{collections::HashMap, str::FromStr};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LedgerRpc, Result};

/// Where the nonce of the next transaction comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NonceStrategy {
    /// Always ask the node for the pending nonce
    #[default]
    NodePending,
    /// Use the last successful nonce + 1, ask the node only when nothing is recorded
    InMemory,
    /// Ask the node, but never go below the last successful nonce + 1
    Combined,
}

impl FromStr for NonceStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "nodePending" | "node-pending" => Ok(NonceStrategy::NodePending),
            "inMemory" | "in-memory" => Ok(NonceStrategy::InMemory),
            "combined" => Ok(NonceStrategy::Combined),
            other => Err(format!("Unknown nonce strategy: {other}")),
        }
    }
}

/// Assigns nonces to outgoing transactions, one sender address at a time.
#[derive(Debug, Default)]
pub struct NonceAssigner {
    strategy: NonceStrategy,
    recorded: HashMap<Address, u64>,
}

impl NonceAssigner {
    pub fn new(strategy: NonceStrategy) -> Self {
        NonceAssigner {
            strategy,
            recorded: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> NonceStrategy {
        self.strategy
    }

    pub fn recorded(&self, address: &Address) -> Option<u64> {
        self.recorded.get(address).copied()
    }

    pub async fn next_nonce<R: LedgerRpc>(&self, rpc: &R, address: Address) -> Result<u64> {
        let recorded = self.recorded(&address);

        let nonce = match (self.strategy, recorded) {
            (NonceStrategy::InMemory, Some(last)) => last + 1,
            (NonceStrategy::NodePending | NonceStrategy::InMemory, _) => {
                rpc.pending_nonce_at(address).await?
            }
            (NonceStrategy::Combined, recorded) => {
                let pending = rpc.pending_nonce_at(address).await?;
                match recorded {
                    Some(last) if last >= pending => last + 1,
                    _ => pending,
                }
            }
        };

        debug!(%address, nonce, strategy=?self.strategy, "Assigned nonce");
        Ok(nonce)
    }

    /// Record the outcome of a submission that used `nonce`. A failure forgets what was
    /// recorded, so the next nonce comes from the node again.
    pub fn update_nonce(&mut self, address: Address, nonce: u64, success: bool) {
        match (self.strategy, success) {
            (NonceStrategy::NodePending, _) => {}
            (_, true) => {
                self.recorded.insert(address, nonce);
            }
            (_, false) => {
                self.recorded.remove(&address);
            }
        }
    }
}
