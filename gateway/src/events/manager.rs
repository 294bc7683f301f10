//! Ownership of one chain's installed filters and their polling workers.

use anyhow::Result;
use std::sync::Arc;
use tokio::{
	sync::{mpsc, watch},
	task::JoinHandle,
};

use crate::{
	eth::rpc::EthRpcApi,
	events::{
		filters::{run_polling_worker, FilterSpec, FilterWrapper},
		messages::EventMessage,
		metadata::MetadataResolver,
	},
};

/// Owns a set of filter wrappers and one polling worker per wrapper.
/// `start` installs every filter and spawns the workers; `stop` cancels
/// them and uninstalls every filter exactly once. Both take `&mut self`,
/// so a manager shared behind a lock serialises its lifecycle
/// transitions.
pub struct FilterManager {
	rpc: Arc<dyn EthRpcApi>,
	resolver: MetadataResolver,
	specs: Vec<FilterSpec>,
	workers: Vec<JoinHandle<()>>,
	cancel: Option<watch::Sender<bool>>,
}

impl FilterManager {
	pub fn new(
		rpc: Arc<dyn EthRpcApi>,
		resolver: MetadataResolver,
		specs: Vec<FilterSpec>,
	) -> Self {
		Self { rpc, resolver, specs, workers: Vec::new(), cancel: None }
	}

	pub fn is_running(&self) -> bool {
		self.cancel.is_some()
	}

	/// Install all filters and start forwarding their decoded messages to
	/// `sink`. A second `start` on a running manager is a no-op.
	pub async fn start(&mut self, sink: mpsc::Sender<EventMessage>) -> Result<()> {
		if self.is_running() {
			return Ok(())
		}

		let mut wrappers = Vec::with_capacity(self.specs.len());
		for spec in &self.specs {
			match FilterWrapper::install(spec.clone(), self.rpc.clone()).await {
				Ok(wrapper) => wrappers.push(wrapper),
				Err(e) => {
					// Leave nothing half-installed behind.
					for wrapper in wrappers {
						wrapper.uninstall().await;
					}
					return Err(e)
				},
			}
		}

		let (cancel_sender, cancel_receiver) = watch::channel(false);
		for wrapper in wrappers {
			self.workers.push(tokio::spawn(run_polling_worker(
				wrapper,
				self.resolver.clone(),
				sink.clone(),
				cancel_receiver.clone(),
			)));
		}
		self.cancel = Some(cancel_sender);

		tracing::info!("started {} filter workers", self.workers.len());
		Ok(())
	}

	/// Cancel every worker and wait for each to uninstall its filter.
	/// Idempotent: a stopped manager makes no further node calls.
	pub async fn stop(&mut self) {
		let Some(cancel) = self.cancel.take() else { return };
		let _ = cancel.send(true);

		for worker in self.workers.drain(..) {
			if let Err(e) = worker.await {
				tracing::error!("filter worker did not shut down cleanly: {e}");
			}
		}
		tracing::info!("stopped all filter workers");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		artifacts::ArtifactClient,
		eth::{
			contracts::{ContractBinding, BOUNTY_REGISTRY_ABI},
			rpc::MockEthRpcApi,
		},
		events::messages::EventKind,
	};
	use ethers::types::U256;

	fn resolver() -> MetadataResolver {
		MetadataResolver::new(ArtifactClient::new("http://127.0.0.1:1"))
	}

	fn test_specs() -> Vec<FilterSpec> {
		let registry = ContractBinding::new(
			"BountyRegistry",
			"0xCfEB869F69431e42cdB54A4F4f8f41e46fd3a837",
			BOUNTY_REGISTRY_ABI,
		)
		.unwrap();
		vec![
			FilterSpec::latest(),
			FilterSpec::contract_event(
				EventKind::Bounty,
				registry.address,
				registry.event("NewBounty").unwrap(),
				false,
			),
			FilterSpec::contract_event(
				EventKind::Quorum,
				registry.address,
				registry.event("QuorumReached").unwrap(),
				true,
			),
		]
	}

	fn idle_rpc() -> MockEthRpcApi {
		let mut rpc = MockEthRpcApi::new();
		rpc.expect_new_block_filter().returning(|| Ok(U256::from(1)));
		rpc.expect_new_log_filter().returning(|_| Ok(U256::from(2)));
		rpc.expect_block_filter_changes().returning(|_| Ok(vec![]));
		rpc.expect_log_filter_changes().returning(|_| Ok(vec![]));
		rpc
	}

	#[tokio::test(start_paused = true)]
	async fn stop_uninstalls_every_filter_once() {
		let mut rpc = idle_rpc();
		// Three filters, three uninstalls, and a second stop() adds none.
		rpc.expect_uninstall_filter().times(3).returning(|_| Ok(true));

		let mut manager = FilterManager::new(Arc::new(rpc), resolver(), test_specs());
		let (sink, _output) = mpsc::channel(16);

		manager.start(sink).await.unwrap();
		assert!(manager.is_running());

		manager.stop().await;
		assert!(!manager.is_running());
		manager.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn start_twice_is_a_no_op() {
		let mut rpc = idle_rpc();
		rpc.expect_uninstall_filter().times(3).returning(|_| Ok(true));

		let mut manager = FilterManager::new(Arc::new(rpc), resolver(), test_specs());
		let (sink, _output) = mpsc::channel(16);

		manager.start(sink.clone()).await.unwrap();
		let workers = manager.workers.len();
		manager.start(sink).await.unwrap();
		assert_eq!(manager.workers.len(), workers);

		manager.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn failed_install_rolls_back_installed_filters() {
		let mut rpc = MockEthRpcApi::new();
		rpc.expect_new_block_filter().returning(|| Ok(U256::from(1)));
		rpc.expect_new_log_filter()
			.returning(|_| Err(anyhow::anyhow!("node unreachable")));
		// The block filter made it in and must come back out.
		rpc.expect_uninstall_filter().times(1).returning(|_| Ok(true));

		let mut manager = FilterManager::new(Arc::new(rpc), resolver(), test_specs());
		let (sink, _output) = mpsc::channel(16);

		assert!(manager.start(sink).await.is_err());
		assert!(!manager.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn transport_errors_do_not_kill_workers() {
		let mut rpc = MockEthRpcApi::new();
		rpc.expect_new_block_filter().returning(|| Ok(U256::from(1)));
		rpc.expect_new_log_filter().returning(|_| Ok(U256::from(2)));
		rpc.expect_block_filter_changes()
			.returning(|_| Err(anyhow::anyhow!("connection reset")));
		rpc.expect_log_filter_changes()
			.returning(|_| Err(anyhow::anyhow!("connection reset")));
		rpc.expect_uninstall_filter().times(3).returning(|_| Ok(true));

		let mut manager = FilterManager::new(Arc::new(rpc), resolver(), test_specs());
		let (sink, _output) = mpsc::channel(16);

		manager.start(sink).await.unwrap();
		// Let every worker hit the failing node repeatedly.
		tokio::time::sleep(std::time::Duration::from_secs(30)).await;

		assert!(manager.workers.iter().all(|worker| !worker.is_finished()));
		manager.stop().await;
	}
}
