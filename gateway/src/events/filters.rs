//! Installed contract-log filters and the per-filter polling workers.

use anyhow::Result;
use ethers::types::{Filter, H160, U256};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

use crate::{
	constants::{
		FILTER_POLL_TIMEOUT, MAX_POLL_WAIT, MIN_POLL_WAIT, POLL_WAIT_JITTER,
	},
	eth::{contracts::SignatureAndEvent, rpc::EthRpcApi},
	events::{
		messages::{extract_event_data, parse_raw_log, EventKind, EventMessage},
		metadata::{validate_bounty_metadata, MetadataResolver},
	},
};

/// What a filter watches: the latest-block pseudo filter, or one event
/// signature on one contract.
#[derive(Clone)]
pub enum FilterQuery {
	Latest,
	Contract { address: H160, event: SignatureAndEvent },
}

#[derive(Clone)]
pub struct FilterSpec {
	pub kind: EventKind,
	pub query: FilterQuery,
	pub backoff: bool,
}

impl FilterSpec {
	pub fn latest() -> Self {
		Self { kind: EventKind::Block, query: FilterQuery::Latest, backoff: false }
	}

	pub fn contract_event(
		kind: EventKind,
		address: H160,
		event: SignatureAndEvent,
		backoff: bool,
	) -> Self {
		Self { kind, query: FilterQuery::Contract { address, event }, backoff }
	}
}

/// A filter installed on the node. The id stays installed exactly as
/// long as the wrapper lives; `uninstall` is consumed on teardown.
pub struct FilterWrapper {
	pub filter_id: U256,
	spec: FilterSpec,
	rpc: Arc<dyn EthRpcApi>,
}

impl FilterWrapper {
	pub async fn install(spec: FilterSpec, rpc: Arc<dyn EthRpcApi>) -> Result<Self> {
		let filter_id = match &spec.query {
			FilterQuery::Latest => rpc.new_block_filter().await?,
			FilterQuery::Contract { address, event } =>
				rpc.new_log_filter(Filter::new().address(*address).topic0(event.signature))
					.await?,
		};
		tracing::debug!(
			"installed {} filter {filter_id}",
			spec.kind.contract_event_name()
		);
		Ok(Self { filter_id, spec, rpc })
	}

	pub fn kind(&self) -> EventKind {
		self.spec.kind
	}

	/// Fetch and decode this filter's new entries. Transport failures
	/// surface as errors; entries that fail to decode are logged and
	/// skipped without dropping the filter.
	pub async fn poll_once(&self, resolver: &MetadataResolver) -> Result<Vec<EventMessage>> {
		match &self.spec.query {
			FilterQuery::Latest => {
				let hashes = self.rpc.block_filter_changes(self.filter_id).await?;
				if hashes.is_empty() {
					return Ok(vec![])
				}
				let number = self.rpc.block_number().await?.as_u64();
				Ok(hashes.iter().map(|_| EventMessage::block(number)).collect())
			},
			FilterQuery::Contract { event, .. } => {
				let logs = self.rpc.log_filter_changes(self.filter_id).await?;
				let mut messages = Vec::with_capacity(logs.len());
				for log in logs {
					let decoded = match parse_raw_log(event, log) {
						Ok(decoded) => decoded,
						Err(e) => {
							tracing::warn!(
								"skipping undecodable {} log: {e}",
								self.spec.kind.contract_event_name()
							);
							continue
						},
					};
					let mut data = match extract_event_data(self.spec.kind, &decoded.log) {
						Ok(data) => data,
						Err(e) => {
							tracing::warn!(
								"skipping {} log with bad payload: {e}",
								self.spec.kind.contract_event_name()
							);
							continue
						},
					};

					if self.spec.kind.needs_metadata() {
						if let Some(uri) =
							data.get("metadata").and_then(|v| v.as_str()).map(str::to_string)
						{
							data["metadata"] =
								resolver.resolve(&uri, validate_bounty_metadata).await;
						}
					}

					messages.push(EventMessage::from_log(self.spec.kind, data, &decoded));
				}
				Ok(messages)
			},
		}
	}

	/// Best-effort removal of the filter from the node. Failure leaves a
	/// stale filter behind on the node, which it will eventually expire;
	/// it is not worth failing shutdown over.
	pub async fn uninstall(self) {
		match self.rpc.uninstall_filter(self.filter_id).await {
			Ok(true) => tracing::debug!("uninstalled filter {}", self.filter_id),
			Ok(false) => tracing::warn!("could not uninstall filter {}", self.filter_id),
			Err(e) => tracing::warn!("error uninstalling filter {}: {e:#}", self.filter_id),
		}
	}

	/// The wait before the next poll, derived from how many consecutive
	/// polls came back empty, with jitter so workers spread out.
	pub fn compute_wait(&self, empty_polls: u32) -> f64 {
		let target = if self.spec.backoff {
			let doublings = empty_polls.saturating_sub(2).min(32);
			(((1u64 << doublings) - 1) as f64).clamp(MIN_POLL_WAIT, MAX_POLL_WAIT)
		} else {
			MIN_POLL_WAIT
		};
		gauss(target, POLL_WAIT_JITTER).abs()
	}
}

/// Poll one filter forever, forwarding decoded messages to `sink`, until
/// cancelled. Uninstalls the filter on the way out.
pub async fn run_polling_worker(
	wrapper: FilterWrapper,
	resolver: MetadataResolver,
	sink: mpsc::Sender<EventMessage>,
	mut cancel: watch::Receiver<bool>,
) {
	let mut empty_polls: u32 = 0;
	let mut wait: f64 = 0.0;

	loop {
		tokio::select! {
			_ = cancel.changed() => break,
			_ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {},
		}

		let poll = tokio::time::timeout(FILTER_POLL_TIMEOUT, wrapper.poll_once(&resolver));
		let result = tokio::select! {
			_ = cancel.changed() => break,
			result = poll => result,
		};

		match result {
			Err(_elapsed) => {
				empty_polls += 2;
				tracing::warn!(
					"{} filter poll timed out",
					wrapper.kind().contract_event_name()
				);
			},
			Ok(Err(e)) => {
				empty_polls += 2;
				tracing::warn!(
					"{} filter poll failed: {e:#}",
					wrapper.kind().contract_event_name()
				);
			},
			Ok(Ok(messages)) =>
				if messages.is_empty() {
					empty_polls += 1;
				} else {
					empty_polls = 0;
					for message in messages {
						if sink.send(message).await.is_err() {
							// Output side is gone; we are shutting down.
							wrapper.uninstall().await;
							return
						}
					}
				},
		}

		wait = wrapper.compute_wait(empty_polls);
	}

	wrapper.uninstall().await;
}

fn gauss(mean: f64, stddev: f64) -> f64 {
	use rand::Rng;
	let mut rng = rand::thread_rng();
	let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
	let u2: f64 = rng.gen();
	mean + stddev * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
