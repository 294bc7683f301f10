//! WebSocket routes: the per-chain event stream, per-channel offer
//! streams, and the bidirectional offer-message relay.

use anyhow::{bail, Context, Result};
use ethers::{
	abi::Token,
	types::{transaction::eip2718::TypedTransaction, Eip1559TransactionRequest, H160, U256},
	utils::to_checksum,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::{
	chain::Chain,
	constants::{OUTBOUND_QUEUE_CAPACITY, WS_CLOSE_SLOW_CONSUMER},
	events::{manager::FilterManager, messages::EventMessage},
};

/// The live event stream for one chain. Subscribes to the chain's hub,
/// drains its queue onto the socket and watches for client disconnect.
pub async fn events_stream(ws: WebSocket, chain: Arc<Chain>, start_time: String) {
	let (mut sink, mut stream) = ws.split();

	let connected = match serde_json::to_string(&EventMessage::connected(&start_time)) {
		Ok(connected) => connected,
		Err(e) => {
			tracing::error!("unserialisable connected frame: {e}");
			return
		},
	};
	if sink.send(Message::text(connected)).await.is_err() {
		return
	}

	let handle = match chain.hub.register().await {
		Ok(handle) => handle,
		Err(e) => {
			tracing::error!("could not start the {} event stream: {e:#}", chain.name);
			let _ = sink.send(Message::close_with(1011u16, "event stream unavailable")).await;
			return
		},
	};
	let subscriber = handle.id;
	let mut queue = handle.receiver;

	loop {
		tokio::select! {
			frame = queue.recv() => match frame {
				Some(frame) => {
					if sink.send(Message::text(frame.as_str().to_owned())).await.is_err() {
						break
					}
				},
				// The hub closed our queue without us unregistering: we
				// were dropped for falling behind.
				None => {
					let _ = sink
						.send(Message::close_with(WS_CLOSE_SLOW_CONSUMER, "slow consumer"))
						.await;
					break
				},
			},
			incoming = stream.next() => match incoming {
				Some(Ok(message)) if message.is_close() => break,
				Some(Ok(_)) => {},
				Some(Err(_)) | None => break,
			},
		}
	}

	chain.hub.unregister(subscriber).await;
}

/// A scoped stream over a single offer channel's multisig contract.
pub async fn channel_events_stream(ws: WebSocket, chain: Arc<Chain>, guid: Uuid) {
	let (mut sink, mut stream) = ws.split();

	let specs = match resolve_channel_msig(&chain, guid).await.and_then(|msig| {
		chain.offer_channel_specs(msig)
	}) {
		Ok(specs) => specs,
		Err(e) => {
			tracing::error!("could not resolve offer channel {guid}: {e:#}");
			let _ = sink.send(Message::close_with(1008u16, "unknown channel")).await;
			return
		},
	};

	let mut manager =
		FilterManager::new(chain.rpc.clone(), chain.resolver.clone(), specs);
	let (events, mut output) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
	if let Err(e) = manager.start(events).await {
		tracing::error!("could not install offer channel filters: {e:#}");
		let _ = sink.send(Message::close_with(1011u16, "event stream unavailable")).await;
		return
	}

	loop {
		tokio::select! {
			message = output.recv() => match message {
				Some(message) => {
					let frame = match serde_json::to_string(&message) {
						Ok(frame) => frame,
						Err(e) => {
							tracing::error!("unserialisable event message: {e}");
							continue
						},
					};
					if sink.send(Message::text(frame)).await.is_err() {
						break
					}
				},
				None => break,
			},
			incoming = stream.next() => match incoming {
				Some(Ok(message)) if message.is_close() => break,
				Some(Ok(_)) => {},
				Some(Err(_)) | None => break,
			},
		}
	}

	manager.stop().await;
}

async fn resolve_channel_msig(chain: &Chain, guid: Uuid) -> Result<H160> {
	let registry = chain
		.offer_registry
		.as_ref()
		.context("offer channels only exist on the home chain")?;
	let function = registry.abi.function("guidToChannel")?;
	let data = function.encode_input(&[Token::Uint(U256::from(guid.as_u128()))])?;
	let raw = chain
		.rpc
		.call(&TypedTransaction::Eip1559(
			Eip1559TransactionRequest::new().to(registry.address).data(data),
		))
		.await?;
	match function.decode_output(&raw)?.first() {
		Some(Token::Address(msig)) if !msig.is_zero() => Ok(*msig),
		Some(Token::Address(_)) => bail!("channel {guid} has no multisig"),
		_ => bail!("malformed guidToChannel response"),
	}
}

struct Group {
	members: HashMap<Uuid, mpsc::Sender<String>>,
	/// Socket labels advertised via `from_socket`, the namespace
	/// `to_socket` must point into.
	labels: HashSet<String>,
}

/// The registry of `/messages/<guid>` relay groups.
#[derive(Clone, Default)]
pub struct MessageGroups {
	groups: Arc<Mutex<HashMap<Uuid, Group>>>,
}

impl MessageGroups {
	fn join(&self, guid: Uuid, member: Uuid, sender: mpsc::Sender<String>) {
		let mut groups = self.groups.lock().expect("message group lock poisoned");
		let group = groups
			.entry(guid)
			.or_insert_with(|| Group { members: HashMap::new(), labels: HashSet::new() });
		group.members.insert(member, sender);
	}

	fn leave(&self, guid: Uuid, member: Uuid) {
		let mut groups = self.groups.lock().expect("message group lock poisoned");
		if let Some(group) = groups.get_mut(&guid) {
			group.members.remove(&member);
			if group.members.is_empty() {
				groups.remove(&guid);
			}
		}
	}

	/// Validate and rebroadcast one relay frame to the rest of `member`'s
	/// group. Frames the schema or membership checks reject are dropped.
	fn relay(&self, guid: Uuid, member: Uuid, text: &str) {
		let body: Value = match serde_json::from_str(text) {
			Ok(body) => body,
			Err(e) => {
				tracing::warn!("undecodable relay frame in channel {guid}: {e}");
				return
			},
		};
		if let Err(e) = validate_message_frame(&body) {
			tracing::warn!("invalid relay frame in channel {guid}: {e}");
			return
		}

		let outgoing = match build_relay_frame(&body, guid) {
			Ok(outgoing) => outgoing,
			Err(e) => {
				tracing::warn!("unrelayable frame in channel {guid}: {e}");
				return
			},
		};

		let mut groups = self.groups.lock().expect("message group lock poisoned");
		let Some(group) = groups.get_mut(&guid) else { return };

		if let Some(label) = body.get("from_socket").and_then(Value::as_str) {
			group.labels.insert(label.to_string());
		}
		if let Some(to_socket) = body.get("to_socket").and_then(Value::as_str) {
			if !group.labels.contains(to_socket) {
				tracing::warn!("relay frame addressed to unknown socket {to_socket:?}");
				return
			}
		}

		let frame = outgoing.to_string();
		for (id, sender) in &group.members {
			if *id != member {
				let _ = sender.try_send(frame.clone());
			}
		}
	}
}

/// Bidirectional relay between the subscribers of one channel GUID.
pub async fn messages_relay(ws: WebSocket, guid: Uuid, groups: MessageGroups) {
	let member = Uuid::new_v4();
	let (sender, mut queue) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
	groups.join(guid, member, sender);

	let (mut sink, mut stream) = ws.split();

	loop {
		tokio::select! {
			frame = queue.recv() => match frame {
				Some(frame) => {
					if sink.send(Message::text(frame)).await.is_err() {
						break
					}
				},
				None => break,
			},
			incoming = stream.next() => match incoming {
				Some(Ok(message)) if message.is_close() => break,
				Some(Ok(message)) => {
					if let Ok(text) = message.to_str() {
						groups.relay(guid, member, text);
					}
				},
				Some(Err(_)) | None => break,
			},
		}
	}

	groups.leave(guid, member);
}

/// Schema for incoming relay frames: `type` and `state` are required,
/// the rest optional with fixed types.
pub fn validate_message_frame(body: &Value) -> Result<(), String> {
	if !body.is_object() {
		return Err("frame is not an object".to_string())
	}
	for (key, required) in [("type", true), ("state", true)] {
		match body.get(key) {
			Some(Value::String(_)) => {},
			Some(_) => return Err(format!("'{key}' must be a string")),
			None if required => return Err(format!("'{key}' is required")),
			None => {},
		}
	}
	for key in ["from_socket", "to_socket", "artifact", "r", "s"] {
		if let Some(value) = body.get(key) {
			if !value.is_string() {
				return Err(format!("'{key}' must be a string"))
			}
		}
	}
	if let Some(v) = body.get("v") {
		if !v.is_u64() && !v.is_i64() {
			return Err("'v' must be an integer".to_string())
		}
	}
	Ok(())
}

/// Decode the packed offer-state blob and assemble the outgoing frame.
pub fn build_relay_frame(body: &Value, guid: Uuid) -> Result<Value> {
	let message_type = body["type"].as_str().expect("validated").to_string();
	let raw_state = body["state"].as_str().expect("validated");

	let mut state = decode_offer_state(raw_state)?;
	state.insert("guid".to_string(), json!(guid.to_string()));

	// Masks and verdicts stay private until the channel pays out.
	if message_type != "accept" && message_type != "payout" {
		state.remove("mask");
		state.remove("verdicts");
	}

	let mut outgoing = json!({
		"type": message_type,
		"raw_state": raw_state,
		"state": Value::Object(state),
	});
	for key in ["r", "v", "s", "artifact"] {
		if let Some(value) = body.get(key) {
			outgoing[key] = value.clone();
		}
	}

	Ok(outgoing)
}

/// The offer state blob is a sequence of 32-byte words. The first ten
/// are required, the rest optional.
pub fn decode_offer_state(state_hex: &str) -> Result<serde_json::Map<String, Value>> {
	let bytes = hex::decode(state_hex.strip_prefix("0x").unwrap_or(state_hex))
		.context("offer state is not hex")?;
	if bytes.len() % 32 != 0 || bytes.len() / 32 < 10 {
		bail!("offer state must be at least ten 32 byte words")
	}

	let word = |i: usize| U256::from_big_endian(&bytes[i * 32..(i + 1) * 32]);
	let address =
		|i: usize| to_checksum(&H160::from_slice(&bytes[i * 32 + 12..(i + 1) * 32]), None);
	let words = bytes.len() / 32;

	let mut state = serde_json::Map::new();
	state.insert("is_closed".to_string(), json!(!word(0).is_zero()));
	state.insert("nonce".to_string(), json!(word(1).as_u64()));
	state.insert("ambassador".to_string(), json!(address(2)));
	state.insert("expert".to_string(), json!(address(3)));
	state.insert("msig_address".to_string(), json!(address(4)));
	state.insert("ambassador_balance".to_string(), json!(word(5).to_string()));
	state.insert("expert_balance".to_string(), json!(word(6).to_string()));
	state.insert("token".to_string(), json!(address(7)));
	state.insert("channel_guid".to_string(), json!(word(8).to_string()));
	state.insert("offer_amount".to_string(), json!(word(9).to_string()));

	let optional: &[(usize, &str, fn(U256) -> Value)] = &[
		(10, "artifact_hash", |w| json!(format!("{w:#x}"))),
		(11, "ipfs_hash", |w| json!(format!("{w:#x}"))),
		(12, "engagement_deadline", |w| json!(w.as_u64())),
		(13, "assertion_deadline", |w| json!(w.as_u64())),
		(14, "current_commitment", |w| json!(w.to_string())),
		(15, "mask", |w| json!(w.to_string())),
		(16, "verdicts", |w| json!(w.to_string())),
	];
	for (index, key, convert) in optional {
		if *index < words {
			state.insert(key.to_string(), convert(word(*index)));
		}
	}

	Ok(state)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn state_hex(words: &[U256]) -> String {
		let mut bytes = Vec::with_capacity(words.len() * 32);
		for word in words {
			let mut buffer = [0u8; 32];
			word.to_big_endian(&mut buffer);
			bytes.extend_from_slice(&buffer);
		}
		format!("0x{}", hex::encode(bytes))
	}

	fn seventeen_word_state() -> String {
		let mut words = vec![U256::zero(); 17];
		words[0] = U256::one(); // closed
		words[1] = U256::from(9); // nonce
		words[5] = U256::from(100); // ambassador balance
		words[6] = U256::from(50); // expert balance
		words[8] = U256::from(82); // channel guid
		words[9] = U256::from(150); // offer amount
		words[15] = U256::from(5); // mask
		words[16] = U256::from(3); // verdicts
		state_hex(&words)
	}

	#[test]
	fn decodes_the_required_words() {
		let state = decode_offer_state(&state_hex(&[U256::zero(); 10])).unwrap();

		assert_eq!(state["is_closed"], json!(false));
		assert_eq!(state["nonce"], json!(0));
		assert_eq!(
			state["ambassador"],
			json!("0x0000000000000000000000000000000000000000")
		);
		assert!(!state.contains_key("mask"));
	}

	#[test]
	fn rejects_truncated_state() {
		assert!(decode_offer_state(&state_hex(&[U256::zero(); 9])).is_err());
		assert!(decode_offer_state("0xbad").is_err());
		assert!(decode_offer_state("not hex at all").is_err());
	}

	#[test]
	fn frame_validation() {
		assert!(validate_message_frame(&json!({ "type": "open", "state": "0x00" })).is_ok());
		assert!(validate_message_frame(&json!({ "type": "open" })).is_err());
		assert!(validate_message_frame(&json!({ "state": "0x00" })).is_err());
		assert!(validate_message_frame(&json!({ "type": 7, "state": "0x00" })).is_err());
		assert!(validate_message_frame(
			&json!({ "type": "open", "state": "0x00", "v": "not an int" })
		)
		.is_err());
		assert!(validate_message_frame(&json!("just a string")).is_err());
	}

	#[test]
	fn masks_and_verdicts_are_stripped_until_payout() {
		let guid = Uuid::nil();
		let body = json!({ "type": "offer", "state": seventeen_word_state() });

		let frame = build_relay_frame(&body, guid).unwrap();
		assert!(frame["state"].get("mask").is_none());
		assert!(frame["state"].get("verdicts").is_none());
		assert_eq!(frame["state"]["guid"], json!(guid.to_string()));
		assert_eq!(frame["type"], json!("offer"));
	}

	#[test]
	fn masks_and_verdicts_survive_accept_and_payout() {
		let guid = Uuid::nil();
		for message_type in ["accept", "payout"] {
			let body = json!({ "type": message_type, "state": seventeen_word_state() });

			let frame = build_relay_frame(&body, guid).unwrap();
			assert_eq!(frame["state"]["mask"], json!("5"));
			assert_eq!(frame["state"]["verdicts"], json!("3"));
		}
	}

	#[test]
	fn signature_fields_are_copied_through() {
		let body = json!({
			"type": "accept",
			"state": seventeen_word_state(),
			"r": "0x01",
			"s": "0x02",
			"v": 27,
			"artifact": "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG",
		});

		let frame = build_relay_frame(&body, Uuid::nil()).unwrap();
		assert_eq!(frame["r"], json!("0x01"));
		assert_eq!(frame["s"], json!("0x02"));
		assert_eq!(frame["v"], json!(27));
		assert_eq!(frame["raw_state"], body["state"]);
	}

	#[tokio::test]
	async fn frames_addressed_to_unknown_sockets_are_dropped() {
		let groups = MessageGroups::default();
		let guid = Uuid::nil();

		let (sender_a, _queue_a) = mpsc::channel(8);
		let (sender_b, mut queue_b) = mpsc::channel(8);
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		groups.join(guid, a, sender_a);
		groups.join(guid, b, sender_b);

		let state = seventeen_word_state();

		// Nobody has advertised the "expert" label yet.
		groups.relay(
			guid,
			a,
			&json!({ "type": "open", "state": state, "to_socket": "expert" }).to_string(),
		);
		assert!(queue_b.try_recv().is_err());

		// B advertises itself, after which addressed frames flow.
		groups.relay(
			guid,
			b,
			&json!({ "type": "open", "state": state, "from_socket": "expert" }).to_string(),
		);
		groups.relay(
			guid,
			a,
			&json!({ "type": "open", "state": state, "to_socket": "expert" }).to_string(),
		);
		let received = queue_b.try_recv().unwrap();
		assert!(received.contains("\"type\""));
	}

	#[tokio::test]
	async fn relay_skips_the_sender() {
		let groups = MessageGroups::default();
		let guid = Uuid::nil();

		let (sender_a, mut queue_a) = mpsc::channel(8);
		let (sender_b, mut queue_b) = mpsc::channel(8);
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		groups.join(guid, a, sender_a);
		groups.join(guid, b, sender_b);

		groups.relay(
			guid,
			a,
			&json!({ "type": "open", "state": seventeen_word_state() }).to_string(),
		);

		assert!(queue_b.try_recv().is_ok());
		assert!(queue_a.try_recv().is_err());
	}

	#[tokio::test]
	async fn empty_groups_are_cleaned_up() {
		let groups = MessageGroups::default();
		let guid = Uuid::nil();
		let member = Uuid::new_v4();

		let (sender, _queue) = mpsc::channel(8);
		groups.join(guid, member, sender);
		assert_eq!(groups.groups.lock().unwrap().len(), 1);

		groups.leave(guid, member);
		assert!(groups.groups.lock().unwrap().is_empty());
	}
}
