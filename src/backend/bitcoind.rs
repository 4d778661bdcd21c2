//! bitcoind backend over JSON-RPC.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::Txid;
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::{Auth, Client, RpcApi};

use crate::backend::{ChainBackend, RelayOutcome};
use crate::config::BitcoindConfig;
use crate::core::{HeaderInfo, Transaction};
use crate::crypto::hash::Hash256;
use crate::{Result, TopologyError};

/// `sendrawtransaction` answer for a tx that is already confirmed.
const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

/// Wrapper around the blocking Bitcoin Core RPC client.
///
/// Each request runs on tokio's blocking pool so the topology task is never
/// stalled by a slow node.
pub struct BitcoindBackend {
    client: Arc<Client>,
    fee_target_blocks: u16,
}

impl BitcoindBackend {
    pub fn new(config: &BitcoindConfig, fee_target_blocks: u16) -> Result<Self> {
        let auth = match (&config.rpc_user, &config.rpc_password, &config.cookie_file) {
            (Some(user), Some(pass), _) => Auth::UserPass(user.clone(), pass.clone()),
            (_, _, Some(cookie)) => Auth::CookieFile(cookie.clone()),
            _ => Auth::None,
        };

        let client = Client::new(&config.rpc_url, auth)
            .map_err(|e| TopologyError::Backend(format!("failed to create RPC client: {}", e)))?;

        log::info!("Using bitcoind at {}", config.rpc_url);
        Ok(Self {
            client: Arc::new(client),
            fee_target_blocks,
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> bitcoincore_rpc::Result<T> + Send + 'static,
    {
        let client = self.client.clone();
        Ok(tokio::task::spawn_blocking(move || f(&client)).await??)
    }
}

#[async_trait]
impl ChainBackend for BitcoindBackend {
    async fn best_block_hash(&self) -> Result<Hash256> {
        let hash = self.call(|c| c.get_best_block_hash()).await?;
        Ok(Hash256::from(hash))
    }

    async fn block_hash(&self, height: u32) -> Result<Hash256> {
        let hash = self.call(move |c| c.get_block_hash(height as u64)).await?;
        Ok(Hash256::from(hash))
    }

    async fn block_header(&self, hash: &Hash256) -> Result<HeaderInfo> {
        let block_hash = hash.to_block_hash();
        let (header, info) = self
            .call(move |c| {
                let header = c.get_block_header(&block_hash)?;
                let info = c.get_block_header_info(&block_hash)?;
                Ok((header, info))
            })
            .await?;

        let height = u32::try_from(info.height)
            .map_err(|_| TopologyError::Backend(format!("height {} out of range", info.height)))?;

        Ok(HeaderInfo {
            hash: *hash,
            height,
            header,
        })
    }

    async fn block_contents(&self, hash: &Hash256) -> Result<Vec<Transaction>> {
        let block_hash = hash.to_block_hash();
        let block = self.call(move |c| c.get_block(&block_hash)).await?;
        Ok(block.txdata)
    }

    async fn fee_estimate(&self) -> Result<u64> {
        let target = self.fee_target_blocks;
        let estimate = self.call(move |c| c.estimate_smart_fee(target, None)).await?;

        match estimate.fee_rate {
            Some(rate) => Ok(rate.to_sat()),
            None => Err(TopologyError::Backend(format!(
                "no fee estimate for {} blocks: {:?}",
                target,
                estimate.errors.unwrap_or_default()
            ))),
        }
    }

    async fn relay(&self, raw_tx: &[u8]) -> Result<RelayOutcome> {
        let raw_hex = hex::encode(raw_tx);
        let client = self.client.clone();
        let result =
            tokio::task::spawn_blocking(move || client.send_raw_transaction(raw_hex.as_str()))
                .await?;

        relay_outcome(result)
    }
}

/// Map a `sendrawtransaction` answer. Node-side rejections are outcomes, not errors.
fn relay_outcome(result: bitcoincore_rpc::Result<Txid>) -> Result<RelayOutcome> {
    match result {
        Ok(_) => Ok(RelayOutcome::Accepted),
        Err(bitcoincore_rpc::Error::JsonRpc(jsonrpc::error::Error::Rpc(e))) => {
            if e.code == RPC_VERIFY_ALREADY_IN_CHAIN {
                Ok(RelayOutcome::Accepted)
            } else {
                Ok(RelayOutcome::Rejected {
                    status: e.code,
                    message: e.message,
                })
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_error(code: i32, message: &str) -> bitcoincore_rpc::Error {
        bitcoincore_rpc::Error::JsonRpc(jsonrpc::error::Error::Rpc(jsonrpc::error::RpcError {
            code,
            message: message.to_string(),
            data: None,
        }))
    }

    #[test]
    fn test_already_in_chain_counts_as_accepted() {
        let outcome = relay_outcome(Err(rpc_error(-27, "Transaction already in block chain"))).unwrap();
        assert_eq!(outcome, RelayOutcome::Accepted);
    }

    #[test]
    fn test_node_rejection_is_an_outcome() {
        let outcome = relay_outcome(Err(rpc_error(-26, "min relay fee not met"))).unwrap();
        assert_eq!(
            outcome,
            RelayOutcome::Rejected {
                status: -26,
                message: "min relay fee not met".to_string(),
            }
        );
    }

    #[test]
    fn test_transport_failure_is_an_error() {
        let err = relay_outcome(Err(bitcoincore_rpc::Error::ReturnedError("timeout".to_string())))
            .unwrap_err();
        assert!(matches!(err, TopologyError::Backend(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_client_builds_without_contacting_node() {
        let config = BitcoindConfig {
            rpc_url: "http://127.0.0.1:18443".to_string(),
            rpc_user: Some("user".to_string()),
            rpc_password: Some("pass".to_string()),
            cookie_file: None,
        };
        let backend = BitcoindBackend::new(&config, 6).unwrap();
        assert_eq!(backend.fee_target_blocks, 6);
    }
}
