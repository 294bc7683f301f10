use anyhow::{anyhow, Context, Result};
use ethers::{
	prelude::*,
	types::{transaction::eip2718::TypedTransaction, Filter, TxpoolInspect},
};
use serde_json::json;
use std::sync::Arc;

/// The slice of the node's JSON-RPC surface the gateway relies on. Kept
/// behind a trait so request handlers and filter workers can be exercised
/// against a mock node.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait EthRpcApi: Send + Sync + 'static {
	async fn chain_id(&self) -> Result<U256>;

	async fn block_number(&self) -> Result<U64>;

	async fn latest_block(&self) -> Result<Block<H256>>;

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>>;

	async fn new_log_filter(&self, filter: Filter) -> Result<U256>;

	async fn new_block_filter(&self) -> Result<U256>;

	async fn log_filter_changes(&self, id: U256) -> Result<Vec<Log>>;

	async fn block_filter_changes(&self, id: U256) -> Result<Vec<H256>>;

	async fn uninstall_filter(&self, id: U256) -> Result<bool>;

	async fn get_transaction(&self, tx_hash: H256) -> Result<Option<Transaction>>;

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;

	async fn estimate_gas(&self, req: &TypedTransaction) -> Result<U256>;

	async fn transaction_count(&self, address: H160, block: Option<BlockId>) -> Result<U256>;

	async fn call(&self, req: &TypedTransaction) -> Result<Bytes>;

	async fn txpool_inspect(&self) -> Result<TxpoolInspect>;

	async fn syncing(&self) -> Result<SyncingStatus>;

	async fn trace_transaction(&self, tx_hash: H256) -> Result<serde_json::Value>;
}

#[derive(Clone)]
pub struct EthRpcClient {
	provider: Arc<Provider<Http>>,
	chain_name: &'static str,
}

impl EthRpcClient {
	/// Connect to a node and verify it serves the expected chain. A node
	/// that answers with the wrong chain id is a configuration error, so
	/// this fails startup rather than retrying.
	pub async fn connect(
		http_endpoint: &str,
		expected_chain_id: u64,
		chain_name: &'static str,
	) -> Result<Self> {
		let provider = Arc::new(
			Provider::<Http>::try_from(http_endpoint)
				.with_context(|| format!("invalid {chain_name} endpoint {http_endpoint}"))?,
		);

		let client = EthRpcClient { provider, chain_name };

		let chain_id = client
			.chain_id()
			.await
			.with_context(|| format!("cannot connect to the {chain_name} node at {http_endpoint}"))?;
		if chain_id != expected_chain_id.into() {
			return Err(anyhow!(
				"the {chain_name} node at {http_endpoint} reports chain id {chain_id}, expected {expected_chain_id}",
			))
		}

		Ok(client)
	}
}

#[async_trait::async_trait]
impl EthRpcApi for EthRpcClient {
	async fn chain_id(&self) -> Result<U256> {
		Ok(self.provider.get_chainid().await?)
	}

	async fn block_number(&self) -> Result<U64> {
		Ok(self.provider.get_block_number().await?)
	}

	async fn latest_block(&self) -> Result<Block<H256>> {
		self.provider
			.get_block(BlockNumber::Latest)
			.await?
			.ok_or_else(|| anyhow!("{} node returned no latest block", self.chain_name))
	}

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>> {
		Ok(self.provider.get_logs(&filter).await?)
	}

	async fn new_log_filter(&self, filter: Filter) -> Result<U256> {
		Ok(self.provider.new_filter(FilterKind::Logs(&filter)).await?)
	}

	async fn new_block_filter(&self) -> Result<U256> {
		Ok(self.provider.new_filter(FilterKind::NewBlocks).await?)
	}

	async fn log_filter_changes(&self, id: U256) -> Result<Vec<Log>> {
		Ok(self.provider.get_filter_changes(id).await?)
	}

	async fn block_filter_changes(&self, id: U256) -> Result<Vec<H256>> {
		Ok(self.provider.get_filter_changes(id).await?)
	}

	async fn uninstall_filter(&self, id: U256) -> Result<bool> {
		Ok(self.provider.uninstall_filter(id).await?)
	}

	async fn get_transaction(&self, tx_hash: H256) -> Result<Option<Transaction>> {
		Ok(self.provider.get_transaction(tx_hash).await?)
	}

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
		Ok(self.provider.get_transaction_receipt(tx_hash).await?)
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
		Ok(self.provider.send_raw_transaction(raw).await?.tx_hash())
	}

	async fn estimate_gas(&self, req: &TypedTransaction) -> Result<U256> {
		Ok(self.provider.estimate_gas(req, None).await?)
	}

	async fn transaction_count(&self, address: H160, block: Option<BlockId>) -> Result<U256> {
		Ok(self.provider.get_transaction_count(address, block).await?)
	}

	async fn call(&self, req: &TypedTransaction) -> Result<Bytes> {
		Ok(self.provider.call(req, None).await?)
	}

	async fn txpool_inspect(&self) -> Result<TxpoolInspect> {
		Ok(self.provider.txpool_inspect().await?)
	}

	async fn syncing(&self) -> Result<SyncingStatus> {
		Ok(self.provider.syncing().await?)
	}

	async fn trace_transaction(&self, tx_hash: H256) -> Result<serde_json::Value> {
		Ok(self
			.provider
			.request(
				"debug_traceTransaction",
				(
					tx_hash,
					json!({
						"disableStorage": true,
						"disableMemory": true,
						"disableStack": true,
					}),
				),
			)
			.await?)
	}
}
