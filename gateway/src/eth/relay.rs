//! Validation and submission of client-signed raw transactions.

use ethers::{
	abi::{self, ParamType, Token},
	types::{Transaction, H160, H256, U256, U64},
	utils::{keccak256, to_checksum},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
	chain::Chain,
	constants::TRANSFER_SELECTOR,
};

#[derive(Error, Debug, PartialEq)]
pub enum RelayRejection {
	/// Refused outright rather than per transaction; surfaces as 403.
	#[error("Posting multiple transactions requires an API key")]
	MultipleWithoutKey,
}

/// Per-transaction result. `message` is the transaction hash on
/// success, a human-readable rejection otherwise.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TxOutcome {
	pub is_error: bool,
	pub message: String,
}

impl TxOutcome {
	fn ok(hash: H256) -> Self {
		Self { is_error: false, message: format!("{hash:#x}") }
	}

	fn err(message: String) -> Self {
		Self { is_error: true, message }
	}
}

#[derive(Debug)]
pub struct RelayOutcome {
	pub results: Vec<TxOutcome>,
	pub errors: bool,
}

/// A signed transaction decoded far enough to validate: recovered
/// sender, recipient, and the legacy network id from its signature.
struct DecodedTx {
	raw: Vec<u8>,
	tx: Transaction,
	hash: H256,
	sender: H160,
}

fn decode_raw_transaction(raw: &str) -> anyhow::Result<DecodedTx> {
	let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))?;
	let mut tx: Transaction = ethers::utils::rlp::decode(&bytes)?;

	// Legacy encodings carry the network id folded into `v`.
	if tx.chain_id.is_none() {
		tx.chain_id = legacy_chain_id(tx.v);
	}
	let sender = tx.recover_from()?;

	Ok(DecodedTx { hash: keccak256(&bytes).into(), sender, tx, raw: bytes })
}

fn legacy_chain_id(v: U64) -> Option<U256> {
	let v = v.as_u64();
	(v >= 35).then(|| U256::from((v - 35) / 2))
}

/// EIP-155 protection aside, a transaction's network id defaults to the
/// chain it is submitted on.
fn network_id(decoded: &DecodedTx, chain: &Chain) -> u64 {
	decoded.tx.chain_id.map(|id| id.as_u64()).unwrap_or(chain.chain_id)
}

/// Whether this transaction is a token withdrawal: a `transfer` of a
/// positive amount to the relay contract, on the side chain's nectar
/// token, carrying no value.
fn is_withdrawal(decoded: &DecodedTx, chain: &Chain, side_chain_id: Option<u64>) -> bool {
	let Some(to) = decoded.tx.to else { return false };
	let input = decoded.tx.input.as_ref();
	if !input.starts_with(&TRANSFER_SELECTOR) {
		return false
	}

	let Ok(tokens) = abi::decode(&[ParamType::Address, ParamType::Uint(256)], &input[4..])
	else {
		return false
	};
	let (Token::Address(target), Token::Uint(amount)) = (&tokens[0], &tokens[1]) else {
		return false
	};

	to == chain.nectar_token.address &&
		decoded.tx.value.is_zero() &&
		Some(network_id(decoded, chain)) == side_chain_id &&
		*target == chain.erc20_relay.address &&
		!amount.is_zero()
}

/// Validate and submit a batch of signed transactions. Individual
/// failures never abort the batch; each entry reports its own outcome.
pub async fn relay_transactions(
	chain: &Chain,
	side_chain_id: Option<u64>,
	account: Option<H160>,
	withdrawal_only: bool,
	raw_transactions: &[String],
) -> Result<RelayOutcome, RelayRejection> {
	if withdrawal_only && raw_transactions.len() != 1 {
		return Err(RelayRejection::MultipleWithoutKey)
	}

	let mut results = Vec::with_capacity(raw_transactions.len());
	let mut errors = false;

	let mut decoded_txs = Vec::with_capacity(raw_transactions.len());
	for raw in raw_transactions {
		match decode_raw_transaction(raw) {
			Ok(decoded) => decoded_txs.push(decoded),
			Err(e) => {
				tracing::error!("undecodable transaction in relay batch: {e:#}");
				return Ok(RelayOutcome {
					results: vec![TxOutcome::err(format!("Invalid transaction: {e}"))],
					errors: true,
				})
			},
		}
	}

	let contract_addresses = chain.contract_addresses();

	for decoded in decoded_txs {
		let hash = decoded.hash;

		if withdrawal_only && !is_withdrawal(&decoded, chain, side_chain_id) {
			errors = true;
			results.push(TxOutcome::err(format!(
				"Invalid transaction for tx {hash:#x}: only withdrawals allowed without an API key",
			)));
			continue
		}

		if let Some(account) = account {
			if decoded.sender != account {
				errors = true;
				results.push(TxOutcome::err(format!(
					"Invalid transaction sender for tx {hash:#x}: expected {} got {}",
					to_checksum(&account, None),
					to_checksum(&decoded.sender, None),
				)));
				continue
			}
		}

		// Guard against contract deploys as well as unknown recipients.
		let recipient = decoded.tx.to.filter(|to| !to.is_zero());
		match recipient {
			Some(to) if contract_addresses.contains(&to) => {},
			_ => {
				errors = true;
				let to = decoded.tx.to.unwrap_or_default();
				results.push(TxOutcome::err(format!(
					"Invalid transaction recipient for tx {hash:#x}: {}",
					to_checksum(&to, None),
				)));
				continue
			},
		}

		tracing::info!(
			"relaying tx from {} to {:?} with nonce {}",
			to_checksum(&decoded.sender, None),
			decoded.tx.to,
			decoded.tx.nonce
		);

		match chain.rpc.send_raw_transaction(decoded.raw.clone().into()).await {
			Ok(submitted) => results.push(TxOutcome::ok(submitted)),
			Err(e) => {
				errors = true;
				results.push(TxOutcome::err(format!(
					"Invalid transaction error for tx {hash:#x}: {e}",
				)));
			},
		}
	}

	Ok(RelayOutcome { results, errors })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{test_utils::*, ChainName};
	use crate::eth::rpc::MockEthRpcApi;
	use ethers::{
		signers::{LocalWallet, Signer},
		types::{transaction::eip2718::TypedTransaction, TransactionRequest, U256},
	};
	use std::str::FromStr;

	const KEY: &str = "000000000000000000000000000000000000000000000000000000000000aaaa";
	const OTHER_KEY: &str = "000000000000000000000000000000000000000000000000000000000000bbbb";
	const SIDE_CHAIN_ID: u64 = 1338;

	fn wallet(key: &str, chain_id: u64) -> LocalWallet {
		LocalWallet::from_str(key).unwrap().with_chain_id(chain_id)
	}

	fn sign(wallet: &LocalWallet, request: TransactionRequest) -> String {
		let typed = TypedTransaction::Legacy(request.from(wallet.address()));
		let signature = wallet.sign_transaction_sync(&typed).unwrap();
		hex::encode(typed.rlp_signed(&signature))
	}

	fn withdrawal_request(chain: &crate::chain::Chain) -> TransactionRequest {
		let mut calldata = TRANSFER_SELECTOR.to_vec();
		calldata.extend(abi::encode(&[
			Token::Address(chain.erc20_relay.address),
			Token::Uint(U256::one()),
		]));
		TransactionRequest::new()
			.to(chain.nectar_token.address)
			.value(0)
			.gas(100_000)
			.gas_price(0)
			.nonce(0)
			.data(calldata)
	}

	async fn side_chain_accepting_txs() -> crate::chain::Chain {
		let mut rpc = MockEthRpcApi::new();
		expect_supported_versions(&mut rpc);
		rpc.expect_send_raw_transaction()
			.returning(|raw| Ok(keccak256(&raw).into()));
		test_chain_with_rpc(ChainName::Side, rpc).await
	}

	#[tokio::test]
	async fn accepts_a_valid_withdrawal_without_a_key() {
		let chain = side_chain_accepting_txs().await;
		let raw = sign(&wallet(KEY, SIDE_CHAIN_ID), withdrawal_request(&chain));

		let outcome =
			relay_transactions(&chain, Some(SIDE_CHAIN_ID), None, true, &[raw])
				.await
				.unwrap();

		assert!(!outcome.errors);
		assert_eq!(outcome.results.len(), 1);
		assert!(!outcome.results[0].is_error);
		assert!(outcome.results[0].message.starts_with("0x"));
	}

	#[tokio::test]
	async fn multiple_transactions_without_a_key_are_refused() {
		let chain = test_chain(ChainName::Side).await;
		let raw = sign(&wallet(KEY, SIDE_CHAIN_ID), withdrawal_request(&chain));

		let result = relay_transactions(
			&chain,
			Some(SIDE_CHAIN_ID),
			None,
			true,
			&[raw.clone(), raw],
		)
		.await;

		assert_eq!(result.unwrap_err(), RelayRejection::MultipleWithoutKey);
	}

	#[tokio::test]
	async fn home_chain_transfer_is_not_a_withdrawal() {
		// The same transfer shape signed for the home chain's network id
		// must be rejected when only withdrawals are allowed.
		let mut rpc = MockEthRpcApi::new();
		expect_supported_versions(&mut rpc);
		let chain = test_chain_with_rpc(ChainName::Home, rpc).await;
		let raw = sign(&wallet(KEY, 1337), withdrawal_request(&chain));

		let outcome =
			relay_transactions(&chain, Some(SIDE_CHAIN_ID), None, true, &[raw])
				.await
				.unwrap();

		assert!(outcome.errors);
		assert!(outcome.results[0].is_error);
		assert!(outcome.results[0]
			.message
			.contains("only withdrawals allowed without an API key"));
	}

	#[tokio::test]
	async fn sender_must_match_the_authenticated_account() {
		let chain = side_chain_accepting_txs().await;
		let signer = wallet(OTHER_KEY, SIDE_CHAIN_ID);
		let account = wallet(KEY, SIDE_CHAIN_ID).address();
		let raw = sign(&signer, withdrawal_request(&chain));

		let outcome = relay_transactions(
			&chain,
			Some(SIDE_CHAIN_ID),
			Some(account),
			false,
			&[raw],
		)
		.await
		.unwrap();

		assert!(outcome.errors);
		assert!(outcome.results[0].message.contains("Invalid transaction sender"));
	}

	#[tokio::test]
	async fn unknown_recipients_and_deploys_are_rejected() {
		let chain = side_chain_accepting_txs().await;
		let signer = wallet(KEY, SIDE_CHAIN_ID);

		let stranger = TransactionRequest::new()
			.to(H160::repeat_byte(0x99))
			.value(0)
			.gas(100_000)
			.gas_price(0)
			.nonce(0);
		let raw = sign(&signer, stranger);

		let outcome = relay_transactions(
			&chain,
			Some(SIDE_CHAIN_ID),
			Some(signer.address()),
			false,
			&[raw],
		)
		.await
		.unwrap();

		assert!(outcome.errors);
		assert!(outcome.results[0].message.contains("Invalid transaction recipient"));
	}

	#[tokio::test]
	async fn undecodable_batch_reports_a_single_error() {
		let chain = test_chain(ChainName::Side).await;

		let outcome = relay_transactions(
			&chain,
			Some(SIDE_CHAIN_ID),
			None,
			false,
			&["deadbeef".to_string()],
		)
		.await
		.unwrap();

		assert!(outcome.errors);
		assert_eq!(outcome.results.len(), 1);
		assert!(outcome.results[0].message.starts_with("Invalid transaction:"));
	}

	#[tokio::test]
	async fn node_rejection_is_a_per_transaction_error() {
		let mut rpc = MockEthRpcApi::new();
		expect_supported_versions(&mut rpc);
		rpc.expect_send_raw_transaction()
			.returning(|_| Err(anyhow::anyhow!("nonce too low")));
		let chain = test_chain_with_rpc(ChainName::Side, rpc).await;

		let signer = wallet(KEY, SIDE_CHAIN_ID);
		let raw = sign(&signer, withdrawal_request(&chain));

		let outcome = relay_transactions(
			&chain,
			Some(SIDE_CHAIN_ID),
			Some(signer.address()),
			false,
			&[raw],
		)
		.await
		.unwrap();

		assert!(outcome.errors);
		assert!(outcome.results[0].message.contains("nonce too low"));
	}
}
