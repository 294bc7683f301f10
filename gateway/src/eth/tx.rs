//! Construction of unsigned transactions handed back to clients for
//! signing.

use anyhow::{Context, Result};
use ethers::{
	abi::Token,
	types::{transaction::eip2718::TypedTransaction, TransactionRequest, H160, U256},
	utils::to_checksum,
};
use serde_json::{json, Value};

use crate::{chain::Chain, constants::MAX_GAS_LIMIT};

/// Calldata for a nectar-token `transfer(to, amount)`.
pub fn transfer_calldata(chain: &Chain, to: H160, amount: U256) -> Result<Vec<u8>> {
	chain
		.nectar_token
		.abi
		.function("transfer")?
		.encode_input(&[Token::Address(to), Token::Uint(amount)])
		.context("could not encode transfer calldata")
}

/// Build an unsigned contract call for the caller to sign. Gas is the
/// node's estimate padded by half, capped by the block gas limit (itself
/// capped at the protocol maximum); free chains pin the gas price to
/// zero, elsewhere the price is the signer's business.
pub async fn build_transaction(
	chain: &Chain,
	from: H160,
	to: H160,
	data: Vec<u8>,
	nonce: U256,
) -> Result<Value> {
	let block_gas_limit = chain
		.rpc
		.latest_block()
		.await
		.context("could not fetch the latest block for its gas limit")?
		.gas_limit;
	let gas_limit = block_gas_limit.min(U256::from(MAX_GAS_LIMIT));

	let mut gas = gas_limit;
	if !chain.free {
		let call = TypedTransaction::Legacy(
			TransactionRequest::new()
				.from(from)
				.to(to)
				.data(data.clone())
				.gas(gas_limit),
		);
		match chain.rpc.estimate_gas(&call).await {
			// Pad the estimate by half; estimates on these chains run low.
			Ok(estimate) => {
				gas = estimate
					.saturating_mul(U256::from(3u64))
					.checked_div(U256::from(2u64))
					.expect("division by two");
			},
			Err(e) => {
				tracing::debug!("error estimating gas, using the block limit: {e:#}");
			},
		}
	}
	let gas = gas.min(gas_limit);

	let mut tx = json!({
		"to": to_checksum(&to, None),
		"data": format!("0x{}", hex::encode(&data)),
		"value": 0,
		"chainId": chain.chain_id,
		"nonce": nonce.as_u64(),
		"gas": gas.as_u64(),
	});
	if chain.free {
		tx["gasPrice"] = json!(0);
	}

	Ok(tx)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{test_utils::*, ChainName};
	use crate::eth::rpc::MockEthRpcApi;
	use ethers::types::Block;
	use serde_json::json;

	fn latest_block(gas_limit: u64) -> Block<ethers::types::H256> {
		Block { gas_limit: gas_limit.into(), ..Default::default() }
	}

	#[tokio::test]
	async fn pads_the_estimate_by_half() {
		let mut rpc = MockEthRpcApi::new();
		expect_supported_versions(&mut rpc);
		rpc.expect_latest_block().returning(|| Ok(latest_block(8_000_000)));
		rpc.expect_estimate_gas().returning(|_| Ok(U256::from(100_000)));

		let chain = test_chain_with_rpc(ChainName::Home, rpc).await;
		let to = chain.erc20_relay.address;
		let tx = build_transaction(&chain, Default::default(), to, vec![], U256::from(7))
			.await
			.unwrap();

		assert_eq!(tx["gas"], json!(150_000));
		assert_eq!(tx["nonce"], json!(7));
		assert_eq!(tx["chainId"], json!(1337));
		assert!(tx.get("gasPrice").is_none());
	}

	#[tokio::test]
	async fn caps_gas_at_the_block_limit() {
		let mut rpc = MockEthRpcApi::new();
		expect_supported_versions(&mut rpc);
		rpc.expect_latest_block().returning(|| Ok(latest_block(1_000_000)));
		rpc.expect_estimate_gas().returning(|_| Ok(U256::from(900_000)));

		let chain = test_chain_with_rpc(ChainName::Home, rpc).await;
		let to = chain.erc20_relay.address;
		let tx = build_transaction(&chain, Default::default(), to, vec![], U256::zero())
			.await
			.unwrap();

		// 900k * 1.5 exceeds the block limit.
		assert_eq!(tx["gas"], json!(1_000_000));
	}

	#[tokio::test]
	async fn block_limit_is_itself_capped() {
		let mut rpc = MockEthRpcApi::new();
		expect_supported_versions(&mut rpc);
		rpc.expect_latest_block().returning(|| Ok(latest_block(80_000_000)));

		let chain = test_chain_with_rpc(ChainName::Side, rpc).await;
		let to = chain.erc20_relay.address;
		let tx = build_transaction(&chain, Default::default(), to, vec![], U256::zero())
			.await
			.unwrap();

		assert_eq!(tx["gas"], json!(MAX_GAS_LIMIT));
	}

	#[tokio::test]
	async fn free_chains_pin_the_gas_price() {
		let mut rpc = MockEthRpcApi::new();
		expect_supported_versions(&mut rpc);
		rpc.expect_latest_block().returning(|| Ok(latest_block(8_000_000)));
		// No estimate_gas expectation: free chains never estimate.

		let chain = test_chain_with_rpc(ChainName::Side, rpc).await;
		let to = chain.erc20_relay.address;
		let tx = build_transaction(&chain, Default::default(), to, vec![], U256::zero())
			.await
			.unwrap();

		assert_eq!(tx["gasPrice"], json!(0));
		assert_eq!(tx["gas"], json!(8_000_000));
	}

	#[tokio::test]
	async fn transfer_calldata_is_the_erc20_selector() {
		let chain = crate::chain::test_utils::test_chain(ChainName::Home).await;
		let data =
			transfer_calldata(&chain, chain.erc20_relay.address, U256::from(1)).unwrap();

		assert_eq!(&data[..4], crate::constants::TRANSFER_SELECTOR);
		assert_eq!(data.len(), 4 + 32 + 32);
	}
}
