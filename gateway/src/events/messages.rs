//! Translation of raw contract log records into the stable wire frames
//! delivered to websocket subscribers and transaction callers.

use ethers::{
	abi::{self, Token},
	types::{Log, H256, U256},
	utils::to_checksum,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::eth::contracts::SignatureAndEvent;

#[derive(Error, Debug)]
pub enum EventDecodeError {
	#[error("unexpected event signature in log: {0:?}")]
	UnexpectedSignature(H256),
	#[error("cannot decode missing parameter '{0}'")]
	MissingParam(String),
	#[error("parameter '{0}' has an unexpected type")]
	UnexpectedType(String),
	#[error("log is missing its {0}")]
	MissingLogField(&'static str),
	#[error("guid {0} does not fit a 128 bit identifier")]
	OversizedGuid(U256),
	#[error("unknown artifact type {0}")]
	UnknownArtifactType(U256),
	#[error(transparent)]
	Abi(#[from] abi::Error),
}

/// The closed set of contract events the gateway understands, each tied
/// to a wire name and the contract-side event it is decoded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
	Block,
	FeeUpdate,
	WindowUpdate,
	Bounty,
	Assertion,
	Reveal,
	Vote,
	Quorum,
	SettledBounty,
	Deprecated,
	Undeprecated,
	InitializedChannel,
	ClosedAgreement,
	SettleStarted,
	SettleChallenged,
	Transfer,
	Deposit,
	Withdrawal,
	OpenedAgreement,
	CanceledAgreement,
	JoinedAgreement,
}

impl EventKind {
	/// The `event` field of the outgoing frame.
	pub fn ws_event(self) -> &'static str {
		match self {
			EventKind::Block => "block",
			EventKind::FeeUpdate => "fee_update",
			EventKind::WindowUpdate => "window_update",
			EventKind::Bounty => "bounty",
			EventKind::Assertion => "assertion",
			EventKind::Reveal => "reveal",
			EventKind::Vote => "vote",
			EventKind::Quorum => "quorum",
			EventKind::SettledBounty => "settled_bounty",
			EventKind::Deprecated => "deprecated",
			EventKind::Undeprecated => "undeprecated",
			EventKind::InitializedChannel => "initialized_channel",
			EventKind::ClosedAgreement => "closed_agreement",
			EventKind::SettleStarted => "settle_started",
			EventKind::SettleChallenged => "settle_challenged",
			EventKind::Transfer => "transfer",
			EventKind::Deposit => "deposit",
			EventKind::Withdrawal => "withdrawal",
			EventKind::OpenedAgreement => "opened_agreement",
			EventKind::CanceledAgreement => "canceled_agreement",
			EventKind::JoinedAgreement => "joined_agreement",
		}
	}

	/// The event name in the contract ABI (e.g. `NewBounty`).
	pub fn contract_event_name(self) -> &'static str {
		match self {
			EventKind::Block => "latest",
			EventKind::FeeUpdate => "FeesUpdated",
			EventKind::WindowUpdate => "WindowsUpdated",
			EventKind::Bounty => "NewBounty",
			EventKind::Assertion => "NewAssertion",
			EventKind::Reveal => "RevealedAssertion",
			EventKind::Vote => "NewVote",
			EventKind::Quorum => "QuorumReached",
			EventKind::SettledBounty => "SettledBounty",
			EventKind::Deprecated => "Deprecated",
			EventKind::Undeprecated => "Undeprecated",
			EventKind::InitializedChannel => "InitializedChannel",
			EventKind::ClosedAgreement => "ClosedAgreement",
			EventKind::SettleStarted => "StartedSettle",
			EventKind::SettleChallenged => "SettleStateChallenged",
			EventKind::Transfer => "Transfer",
			EventKind::Deposit => "NewDeposit",
			EventKind::Withdrawal => "NewWithdrawal",
			EventKind::OpenedAgreement => "OpenedAgreement",
			EventKind::CanceledAgreement => "CanceledAgreement",
			EventKind::JoinedAgreement => "JoinedAgreement",
		}
	}

	/// Whether the payload references off-chain metadata that should be
	/// resolved before the frame goes out.
	pub fn needs_metadata(self) -> bool {
		matches!(self, EventKind::Bounty | EventKind::Reveal)
	}
}

/// The wire frame sent to subscribers. `block` ticks and the synthetic
/// `connected` frame omit the log provenance fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMessage {
	pub event: &'static str,
	pub data: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub block_number: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub txhash: Option<String>,
}

impl EventMessage {
	pub fn from_log(kind: EventKind, data: Value, log: &DecodedLog) -> Self {
		Self {
			event: kind.ws_event(),
			data,
			block_number: Some(log.block_number),
			txhash: Some(format!("{:#x}", log.txhash)),
		}
	}

	pub fn block(number: u64) -> Self {
		Self {
			event: EventKind::Block.ws_event(),
			data: json!({ "number": number }),
			block_number: None,
			txhash: None,
		}
	}

	pub fn connected(start_time: &str) -> Self {
		Self {
			event: "connected",
			data: json!({ "start_time": start_time }),
			block_number: None,
			txhash: None,
		}
	}
}

/// A log record successfully matched against an event definition, with
/// the provenance fields every non-`block` frame must carry.
#[derive(Debug)]
pub struct DecodedLog {
	pub block_number: u64,
	pub txhash: H256,
	pub log: abi::Log,
}

/// Match a raw node log against an event definition and decode its
/// parameters.
pub fn parse_raw_log(
	event: &SignatureAndEvent,
	log: Log,
) -> Result<DecodedLog, EventDecodeError> {
	let block_number = log
		.block_number
		.ok_or(EventDecodeError::MissingLogField("block number"))?
		.as_u64();
	let txhash = log
		.transaction_hash
		.ok_or(EventDecodeError::MissingLogField("transaction hash"))?;

	match log.topics.first() {
		Some(signature) if *signature == event.signature => {},
		Some(signature) => return Err(EventDecodeError::UnexpectedSignature(*signature)),
		None => return Err(EventDecodeError::MissingLogField("topics")),
	}

	let log = event
		.event
		.parse_log(abi::RawLog { topics: log.topics, data: log.data.to_vec() })?;

	Ok(DecodedLog { block_number, txhash, log })
}

/// Extract the per-event `data` payload from a decoded log. Pure: any
/// metadata substitution happens afterwards in the filter worker.
pub fn extract_event_data(kind: EventKind, log: &abi::Log) -> Result<Value, EventDecodeError> {
	Ok(match kind {
		EventKind::FeeUpdate => json!({
			"bounty_fee": uint_json(log, "bountyFee")?,
			"assertion_fee": uint_json(log, "assertionFee")?,
		}),
		EventKind::WindowUpdate => json!({
			"assertion_reveal_window": uint_json(log, "assertionRevealWindow")?,
			"arbiter_vote_window": uint_json(log, "arbiterVoteWindow")?,
		}),
		EventKind::Bounty => json!({
			"guid": guid_string(log, "guid")?,
			"artifact_type": artifact_type_string(uint(log, "artifactType")?)?,
			"author": address_string(log, "author")?,
			"amount": uint(log, "amount")?.to_string(),
			"uri": string(log, "artifactURI")?,
			"expiration": uint(log, "expirationBlock")?.to_string(),
			"metadata": string(log, "metadata")?,
		}),
		EventKind::Assertion => json!({
			"bounty_guid": guid_string(log, "bountyGuid")?,
			"author": address_string(log, "author")?,
			"index": uint_json(log, "index")?,
			"bid": uint_array(log, "bid")?.iter().map(U256::to_string).collect::<Vec<_>>(),
			"mask": bool_vector(log, "mask")?,
			"commitment": uint(log, "commitment")?.to_string(),
		}),
		EventKind::Reveal => json!({
			"bounty_guid": guid_string(log, "bountyGuid")?,
			"author": address_string(log, "author")?,
			"index": uint_json(log, "index")?,
			"nonce": uint(log, "nonce")?.to_string(),
			"verdicts": bool_vector(log, "verdicts")?,
			"metadata": string(log, "metadata")?,
		}),
		EventKind::Vote => json!({
			"bounty_guid": guid_string(log, "bountyGuid")?,
			"voter": address_string(log, "voter")?,
			"votes": bool_vector(log, "votes")?,
		}),
		EventKind::Quorum => json!({
			"bounty_guid": guid_string(log, "bountyGuid")?,
		}),
		EventKind::SettledBounty => json!({
			"bounty_guid": guid_string(log, "bountyGuid")?,
			"settler": address_string(log, "settler")?,
			"payout": uint_json(log, "payout")?,
		}),
		EventKind::Deprecated => json!({
			"rollover": boolean(log, "rollover")?,
		}),
		EventKind::Undeprecated => json!({}),
		EventKind::InitializedChannel => json!({
			"ambassador": address_string(log, "ambassador")?,
			"expert": address_string(log, "expert")?,
			"guid": guid_string(log, "guid")?,
			"multi_signature": address_string(log, "msig")?,
		}),
		EventKind::ClosedAgreement => json!({
			"ambassador": address_string(log, "_ambassador")?,
			"expert": address_string(log, "_expert")?,
		}),
		EventKind::SettleStarted => json!({
			"initiator": address_string(log, "initiator")?,
			"nonce": uint_json(log, "sequence")?,
			"settle_period_end": uint_json(log, "settlementPeriodEnd")?,
		}),
		EventKind::SettleChallenged => json!({
			"challenger": address_string(log, "challenger")?,
			"nonce": uint_json(log, "sequence")?,
			"settle_period_end": uint_json(log, "settlementPeriodEnd")?,
		}),
		EventKind::Transfer => json!({
			"from": address_string(log, "from")?,
			"to": address_string(log, "to")?,
			"value": uint(log, "value")?.to_string(),
		}),
		EventKind::Deposit => json!({
			"from": address_string(log, "from")?,
			"value": uint_json(log, "value")?,
		}),
		EventKind::Withdrawal => json!({
			"to": address_string(log, "to")?,
			"value": uint_json(log, "value")?,
		}),
		EventKind::OpenedAgreement |
		EventKind::CanceledAgreement |
		EventKind::JoinedAgreement => all_params(log),
		EventKind::Block => json!({}),
	})
}

/// Decode a packed boolean vector of width `numArtifacts`: index `i` of
/// the result is bit `i` of the packed value.
pub fn int_to_bool_list(packed: U256, width: usize) -> Vec<bool> {
	(0..width).map(|i| packed.bit(i)).collect()
}

pub fn bool_list_to_int(bools: &[bool]) -> U256 {
	bools
		.iter()
		.enumerate()
		.fold(U256::zero(), |acc, (i, set)| if *set { acc | (U256::one() << i) } else { acc })
}

/// Render a contract-side uint GUID in the canonical hyphenated form.
/// Values beyond 128 bits have no such form and are a decode error.
pub fn format_guid(value: U256) -> Result<String, EventDecodeError> {
	if value > U256::from(u128::MAX) {
		return Err(EventDecodeError::OversizedGuid(value))
	}
	Ok(Uuid::from_u128(value.as_u128()).to_string())
}

fn param<'a>(log: &'a abi::Log, name: &str) -> Result<&'a Token, EventDecodeError> {
	log.params
		.iter()
		.find(|p| p.name == name)
		.map(|p| &p.value)
		.ok_or_else(|| EventDecodeError::MissingParam(name.to_string()))
}

fn uint(log: &abi::Log, name: &str) -> Result<U256, EventDecodeError> {
	match param(log, name)? {
		Token::Uint(value) | Token::Int(value) => Ok(*value),
		_ => Err(EventDecodeError::UnexpectedType(name.to_string())),
	}
}

/// Render a uint as a JSON number where it fits, falling back to a
/// decimal string for values beyond 64 bits.
fn uint_json(log: &abi::Log, name: &str) -> Result<Value, EventDecodeError> {
	let value = uint(log, name)?;
	Ok(if value <= U256::from(u64::MAX) {
		json!(value.as_u64())
	} else {
		json!(value.to_string())
	})
}

fn uint_array(log: &abi::Log, name: &str) -> Result<Vec<U256>, EventDecodeError> {
	match param(log, name)? {
		Token::Array(tokens) | Token::FixedArray(tokens) => tokens
			.iter()
			.map(|token| match token {
				Token::Uint(value) | Token::Int(value) => Ok(*value),
				_ => Err(EventDecodeError::UnexpectedType(name.to_string())),
			})
			.collect(),
		_ => Err(EventDecodeError::UnexpectedType(name.to_string())),
	}
}

fn string(log: &abi::Log, name: &str) -> Result<String, EventDecodeError> {
	match param(log, name)? {
		Token::String(value) => Ok(value.clone()),
		_ => Err(EventDecodeError::UnexpectedType(name.to_string())),
	}
}

fn boolean(log: &abi::Log, name: &str) -> Result<bool, EventDecodeError> {
	match param(log, name)? {
		Token::Bool(value) => Ok(*value),
		_ => Err(EventDecodeError::UnexpectedType(name.to_string())),
	}
}

fn address_string(log: &abi::Log, name: &str) -> Result<String, EventDecodeError> {
	match param(log, name)? {
		Token::Address(address) => Ok(to_checksum(address, None)),
		_ => Err(EventDecodeError::UnexpectedType(name.to_string())),
	}
}

fn guid_string(log: &abi::Log, name: &str) -> Result<String, EventDecodeError> {
	format_guid(uint(log, name)?)
}

fn bool_vector(log: &abi::Log, name: &str) -> Result<Vec<bool>, EventDecodeError> {
	let width = uint(log, "numArtifacts")?;
	// Bounties are contract-limited to 256 artifacts; anything wider is
	// not a plausible width.
	if width > U256::from(256u64) {
		return Err(EventDecodeError::UnexpectedType("numArtifacts".to_string()))
	}
	Ok(int_to_bool_list(uint(log, name)?, width.as_usize()))
}

fn artifact_type_string(value: U256) -> Result<&'static str, EventDecodeError> {
	match value.as_u64() {
		0 => Ok("file"),
		1 => Ok("url"),
		_ => Err(EventDecodeError::UnknownArtifactType(value)),
	}
}

fn all_params(log: &abi::Log) -> Value {
	Value::Object(
		log.params
			.iter()
			.map(|p| (p.name.clone(), token_to_json(&p.value)))
			.collect(),
	)
}

fn token_to_json(token: &Token) -> Value {
	match token {
		Token::Address(address) => json!(to_checksum(address, None)),
		Token::Uint(value) | Token::Int(value) =>
			if *value <= U256::from(u64::MAX) {
				json!(value.as_u64())
			} else {
				json!(value.to_string())
			},
		Token::Bool(value) => json!(value),
		Token::String(value) => json!(value),
		Token::Bytes(bytes) | Token::FixedBytes(bytes) => json!(format!("0x{}", hex::encode(bytes))),
		Token::Array(tokens) | Token::FixedArray(tokens) | Token::Tuple(tokens) =>
			Value::Array(tokens.iter().map(token_to_json).collect()),
	}
}
