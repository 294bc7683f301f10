//! Extraction of domain events from mined transactions, keyed by event
//! kind, for the `/transactions` routes.

use anyhow::Result;
use ethers::{
	abi::{self, ParamType, Token},
	types::{TransactionReceipt, H256, U64},
};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
	chain::Chain,
	constants::{ERROR_SELECTOR, MAX_GAS_LIMIT, RECEIPT_POLL_INTERVAL},
	events::messages::{extract_event_data, parse_raw_log, EventKind},
};

pub type ExtractedEvents = BTreeMap<&'static str, Vec<Value>>;

fn errors(messages: Vec<String>) -> ExtractedEvents {
	BTreeMap::from([("errors", messages.into_iter().map(Value::String).collect())])
}

/// Wait for `txhash` to be mined and extract its domain events from the
/// receipt logs. Failures are reported under an `errors` key rather
/// than raised; the caller renders them as a 400.
pub async fn events_from_transaction(
	chain: &Chain,
	txhash: H256,
	trace_enabled: bool,
) -> ExtractedEvents {
	let hex = hex::encode(txhash);

	let receipt =
		match tokio::time::timeout(chain.receipt_timeout(), wait_for_receipt(chain, txhash))
			.await
		{
			Err(_elapsed) => {
				tracing::error!("transaction {hex}: timeout waiting for receipt");
				return errors(vec![format!(
					"transaction {hex}: timeout during wait for receipt"
				)])
			},
			Ok(Err(e)) => {
				tracing::error!("transaction {hex}: error while fetching receipt: {e:#}");
				return errors(vec![format!(
					"transaction {hex}: unexpected error while fetching transaction receipt"
				)])
			},
			Ok(Ok(None)) => return errors(vec![format!("transaction {hex}: receipt not available")]),
			Ok(Ok(Some(receipt))) => receipt,
		};

	if receipt.gas_used == Some(MAX_GAS_LIMIT.into()) {
		return errors(vec![format!("transaction {hex}: out of gas")])
	}

	if receipt.status != Some(U64::one()) {
		let block = receipt.block_number.unwrap_or_default();
		return if trace_enabled {
			let reason = revert_reason(chain, txhash).await;
			tracing::error!("transaction {hex} failed with error message: {reason}");
			errors(vec![format!(
				"transaction {hex}: transaction failed at block {block}, error: {reason}"
			)])
		} else {
			errors(vec![format!(
				"transaction {hex}: transaction failed at block {block}, check parameters"
			)])
		}
	}

	extract_receipt_events(chain, &receipt)
}

/// Poll until the transaction is mined and at least one block deep, then
/// fetch its receipt. The caller bounds this with the chain's deadline.
async fn wait_for_receipt(chain: &Chain, txhash: H256) -> Result<Option<TransactionReceipt>> {
	loop {
		if let Some(tx) = chain.rpc.get_transaction(txhash).await? {
			if let Some(tx_block) = tx.block_number {
				// Receipts for the head block can still be reorganised
				// out; wait for one confirmation.
				while chain.rpc.block_number().await? < tx_block + 1 {
					tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
				}
				return chain.rpc.transaction_receipt(txhash).await
			}
		}
		tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
	}
}

/// Decode the revert reason out of a `debug_traceTransaction` response,
/// encoded as a call to `Error(string)`.
async fn revert_reason(chain: &Chain, txhash: H256) -> String {
	let trace = match chain.rpc.trace_transaction(txhash).await {
		Ok(trace) => trace,
		Err(e) => {
			tracing::error!("could not trace transaction {txhash:#x}: {e:#}");
			return "trace unavailable".to_string()
		},
	};

	if !trace.get("failed").and_then(Value::as_bool).unwrap_or(false) {
		tracing::error!("transaction receipt indicates failure but trace succeeded");
		return "Transaction receipt indicates failure but trace succeeded".to_string()
	}

	let return_value = trace.get("returnValue").and_then(Value::as_str).unwrap_or("");
	let bytes = match hex::decode(return_value.strip_prefix("0x").unwrap_or(return_value)) {
		Ok(bytes) => bytes,
		Err(_) => return "Invalid revert encoding".to_string(),
	};

	if !bytes.starts_with(&ERROR_SELECTOR) {
		tracing::error!(
			"expected revert encoding to begin with {}, actual is {}",
			hex::encode(ERROR_SELECTOR),
			hex::encode(&bytes[..bytes.len().min(4)])
		);
		return "Invalid revert encoding".to_string()
	}

	match abi::decode(&[ParamType::String], &bytes[4..]).map(|mut tokens| tokens.pop()) {
		Ok(Some(Token::String(reason))) => reason,
		_ => "Invalid revert encoding".to_string(),
	}
}

/// The (contract, event kind) pairs scanned out of receipts, and the
/// result key each lands under.
fn extraction_table(chain: &Chain) -> Vec<(&abi::Contract, Vec<(&'static str, EventKind)>)> {
	let mut table = vec![
		(&chain.nectar_token.abi, vec![("transfers", EventKind::Transfer)]),
		(
			&chain.bounty_registry.abi,
			vec![
				("bounties", EventKind::Bounty),
				("assertions", EventKind::Assertion),
				("votes", EventKind::Vote),
				("reveals", EventKind::Reveal),
			],
		),
		(
			&chain.arbiter_staking.abi,
			vec![
				("withdrawals", EventKind::Withdrawal),
				("deposits", EventKind::Deposit),
			],
		),
	];

	if let Some(offer_registry) = &chain.offer_registry {
		table.push((
			&offer_registry.abi,
			vec![("offers_initialized", EventKind::InitializedChannel)],
		));
	}
	if let Some(offer_multisig) = &chain.offer_multisig {
		table.push((
			offer_multisig,
			vec![
				("offers_opened", EventKind::OpenedAgreement),
				("offers_canceled", EventKind::CanceledAgreement),
				("offers_joined", EventKind::JoinedAgreement),
				("offers_closed", EventKind::ClosedAgreement),
				("offers_settled", EventKind::SettleStarted),
				("offers_challenged", EventKind::SettleChallenged),
			],
		));
	}

	table
}

fn extract_receipt_events(chain: &Chain, receipt: &TransactionReceipt) -> ExtractedEvents {
	let mut extracted = ExtractedEvents::new();

	for (contract, handlers) in extraction_table(chain) {
		for (key, kind) in handlers {
			let event = match crate::eth::contracts::SignatureAndEvent::new(
				contract,
				kind.contract_event_name(),
			) {
				Ok(event) => event,
				Err(e) => {
					tracing::warn!("no contract event for {}: {e}", kind.contract_event_name());
					continue
				},
			};

			for log in &receipt.logs {
				if log.topics.first() != Some(&event.signature) {
					continue
				}
				match parse_raw_log(&event, log.clone())
					.map_err(anyhow::Error::from)
					.and_then(|decoded| Ok(extract_event_data(kind, &decoded.log)?))
				{
					Ok(data) => extracted.entry(key).or_default().push(data),
					Err(e) => {
						tracing::warn!(
							"skipping receipt log matching {}: {e:#}",
							kind.contract_event_name()
						);
					},
				}
			}
		}
	}

	extracted
}
