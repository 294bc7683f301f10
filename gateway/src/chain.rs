//! Per-chain state: the node client, contract bindings and the event
//! hub. Everything a request handler needs travels through one of these
//! values; there is no process-global chain state.

use anyhow::{Context, Result};
use ethers::{abi, types::H160};
use std::{str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
	constants::{HOME_RECEIPT_TIMEOUT, SIDE_RECEIPT_TIMEOUT},
	eth::{
		contracts::{
			ContractBinding, SignatureAndEvent, ARBITER_STAKING_ABI, BOUNTY_REGISTRY_ABI,
			ERC20_RELAY_ABI, NECTAR_TOKEN_ABI, OFFER_MULTISIG_ABI, OFFER_REGISTRY_ABI,
		},
		rpc::{EthRpcApi, EthRpcClient},
	},
	events::{
		filters::FilterSpec,
		hub::EventHub,
		messages::EventKind,
		metadata::MetadataResolver,
	},
	settings,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainName {
	Home,
	Side,
}

impl ChainName {
	pub fn as_str(self) -> &'static str {
		match self {
			ChainName::Home => "home",
			ChainName::Side => "side",
		}
	}
}

impl std::fmt::Display for ChainName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Error, Debug)]
#[error("Chain must be either home or side")]
pub struct UnknownChain;

impl FromStr for ChainName {
	type Err = UnknownChain;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"home" => Ok(ChainName::Home),
			"side" => Ok(ChainName::Side),
			_ => Err(UnknownChain),
		}
	}
}

pub struct Chain {
	pub name: ChainName,
	pub chain_id: u64,
	pub free: bool,
	pub rpc: Arc<dyn EthRpcApi>,
	pub nectar_token: ContractBinding,
	pub bounty_registry: ContractBinding,
	pub arbiter_staking: ContractBinding,
	pub erc20_relay: ContractBinding,
	pub offer_registry: Option<ContractBinding>,
	pub offer_multisig: Option<abi::Contract>,
	pub resolver: MetadataResolver,
	pub hub: EventHub,
}

impl Chain {
	pub async fn connect(
		name: ChainName,
		config: &settings::ChainConfig,
		resolver: MetadataResolver,
	) -> Result<Self> {
		let rpc: Arc<dyn EthRpcApi> = Arc::new(
			EthRpcClient::connect(&config.eth_uri, config.chain_id, name.as_str()).await?,
		);
		Self::from_parts(name, config, rpc, resolver).await
	}

	/// Bind and version-check the chain's contracts over an established
	/// node connection.
	pub async fn from_parts(
		name: ChainName,
		config: &settings::ChainConfig,
		rpc: Arc<dyn EthRpcApi>,
		resolver: MetadataResolver,
	) -> Result<Self> {
		let nectar_token =
			ContractBinding::new("NectarToken", &config.nectar_token_address, NECTAR_TOKEN_ABI)?;
		let bounty_registry = ContractBinding::new(
			"BountyRegistry",
			&config.bounty_registry_address,
			BOUNTY_REGISTRY_ABI,
		)?;
		let arbiter_staking = ContractBinding::new(
			"ArbiterStaking",
			&config.arbiter_staking_address,
			ARBITER_STAKING_ABI,
		)?;
		let erc20_relay =
			ContractBinding::new("ERC20Relay", &config.erc20_relay_address, ERC20_RELAY_ABI)?;

		// The offer ecosystem only exists on the home chain.
		let offer_registry = match (&name, &config.offer_registry_address) {
			(ChainName::Home, Some(address)) =>
				Some(ContractBinding::new("OfferRegistry", address, OFFER_REGISTRY_ABI)?),
			_ => None,
		};
		let offer_multisig = match name {
			ChainName::Home => Some(
				abi::Contract::load(OFFER_MULTISIG_ABI)
					.context("could not load OfferMultiSig ABI")?,
			),
			ChainName::Side => None,
		};

		for binding in [&nectar_token, &bounty_registry, &arbiter_staking, &erc20_relay]
			.into_iter()
			.chain(offer_registry.as_ref())
		{
			binding
				.check_version(rpc.as_ref())
				.await
				.with_context(|| format!("{name} chain failed contract validation"))?;
		}

		let specs = standard_filter_specs(&bounty_registry, offer_registry.as_ref())?;
		let hub = EventHub::new(rpc.clone(), resolver.clone(), specs);

		Ok(Self {
			name,
			chain_id: config.chain_id,
			free: config.free,
			rpc,
			nectar_token,
			bounty_registry,
			arbiter_staking,
			erc20_relay,
			offer_registry,
			offer_multisig,
			resolver,
			hub,
		})
	}

	/// Contract addresses that signed transactions may target.
	pub fn contract_addresses(&self) -> Vec<H160> {
		[&self.nectar_token, &self.bounty_registry, &self.arbiter_staking, &self.erc20_relay]
			.into_iter()
			.chain(self.offer_registry.as_ref())
			.map(|binding| binding.address)
			.collect()
	}

	/// How long the event extractor waits for a receipt on this chain.
	pub fn receipt_timeout(&self) -> Duration {
		match self.name {
			ChainName::Home => HOME_RECEIPT_TIMEOUT,
			ChainName::Side => SIDE_RECEIPT_TIMEOUT,
		}
	}

	/// Filters for a single offer channel's multisig contract, used by
	/// the scoped `/events/<guid>` stream.
	pub fn offer_channel_specs(&self, msig: H160) -> Result<Vec<FilterSpec>> {
		let multisig = self
			.offer_multisig
			.as_ref()
			.context("offer channels only exist on the home chain")?;

		[EventKind::ClosedAgreement, EventKind::SettleStarted, EventKind::SettleChallenged]
			.into_iter()
			.map(|kind| {
				Ok(FilterSpec::contract_event(
					kind,
					msig,
					SignatureAndEvent::new(multisig, kind.contract_event_name())?,
					true,
				))
			})
			.collect()
	}
}

/// The filter set every chain streams to its subscribers: the latest
/// block tick and `NewBounty` at full poll rate, the rest with backoff,
/// and channel initialisations when the offer registry is bound.
pub fn standard_filter_specs(
	bounty_registry: &ContractBinding,
	offer_registry: Option<&ContractBinding>,
) -> Result<Vec<FilterSpec>> {
	let mut specs = vec![
		FilterSpec::latest(),
		FilterSpec::contract_event(
			EventKind::Bounty,
			bounty_registry.address,
			bounty_registry.event(EventKind::Bounty.contract_event_name())?,
			// New bounties want low latency; never back off.
			false,
		),
	];

	for kind in [
		EventKind::FeeUpdate,
		EventKind::WindowUpdate,
		EventKind::Assertion,
		EventKind::Vote,
		EventKind::Quorum,
		EventKind::SettledBounty,
		EventKind::Reveal,
		EventKind::Deprecated,
		EventKind::Undeprecated,
	] {
		specs.push(FilterSpec::contract_event(
			kind,
			bounty_registry.address,
			bounty_registry.event(kind.contract_event_name())?,
			true,
		));
	}

	if let Some(offer_registry) = offer_registry {
		specs.push(FilterSpec::contract_event(
			EventKind::InitializedChannel,
			offer_registry.address,
			offer_registry.event(EventKind::InitializedChannel.contract_event_name())?,
			true,
		));
	}

	Ok(specs)
}

#[derive(Error, Debug)]
pub enum ChainSelectError {
	#[error("Chain must be either home or side")]
	Unknown,
	#[error("Side chain not supported in this instance of polyswarmd")]
	SideUnconfigured,
}

pub struct Chains {
	pub home: Arc<Chain>,
	pub side: Option<Arc<Chain>>,
}

impl Chains {
	pub async fn connect(
		settings: &settings::Settings,
		resolver: MetadataResolver,
	) -> Result<Self> {
		let home =
			Arc::new(Chain::connect(ChainName::Home, &settings.chains.home, resolver.clone()).await?);
		let side = match &settings.chains.side {
			Some(config) =>
				Some(Arc::new(Chain::connect(ChainName::Side, config, resolver).await?)),
			None => None,
		};
		Ok(Self { home, side })
	}

	pub fn get(&self, name: ChainName) -> Result<&Arc<Chain>, ChainSelectError> {
		match name {
			ChainName::Home => Ok(&self.home),
			ChainName::Side => self.side.as_ref().ok_or(ChainSelectError::SideUnconfigured),
		}
	}

	/// Select a chain from the `chain` query parameter, defaulting to
	/// home.
	pub fn select(&self, query: Option<&str>) -> Result<&Arc<Chain>, ChainSelectError> {
		let name = match query {
			None => ChainName::Home,
			Some(raw) => raw.parse().map_err(|_| ChainSelectError::Unknown)?,
		};
		self.get(name)
	}
}


#[cfg(test)]
mod tests {
	use super::test_utils::*;
	use super::*;
	use crate::eth::rpc::MockEthRpcApi;
	use ethers::abi::AbiEncode;
	use ethers::types::Bytes;

	#[tokio::test]
	async fn home_chain_binds_the_offer_ecosystem() {
		let chain = test_chain(ChainName::Home).await;

		assert!(chain.offer_registry.is_some());
		assert!(chain.offer_multisig.is_some());
		assert_eq!(chain.contract_addresses().len(), 5);
		assert!(chain.offer_channel_specs(Default::default()).is_ok());
	}

	#[tokio::test]
	async fn side_chain_has_no_offers() {
		let chain = test_chain(ChainName::Side).await;

		assert!(chain.offer_registry.is_none());
		assert_eq!(chain.contract_addresses().len(), 4);
		assert!(chain.offer_channel_specs(Default::default()).is_err());
	}

	#[tokio::test]
	async fn unsupported_contract_version_fails_startup() {
		let mut rpc = MockEthRpcApi::new();
		rpc.expect_call()
			.returning(|_| Ok(Bytes::from(AbiEncode::encode("0.9.0".to_string()))));

		let resolver =
			MetadataResolver::new(crate::artifacts::ArtifactClient::new("http://127.0.0.1:1"));
		let result = Chain::from_parts(
			ChainName::Home,
			&test_chain_config(ChainName::Home),
			Arc::new(rpc),
			resolver,
		)
		.await;

		assert!(result.is_err());
	}

	#[tokio::test]
	async fn standard_filter_set_matches_the_chain() {
		let home = test_chain(ChainName::Home).await;
		let side = test_chain(ChainName::Side).await;

		let home_specs =
			standard_filter_specs(&home.bounty_registry, home.offer_registry.as_ref()).unwrap();
		let side_specs =
			standard_filter_specs(&side.bounty_registry, side.offer_registry.as_ref()).unwrap();

		// latest + NewBounty + nine backed-off events, plus
		// InitializedChannel where the offer registry exists.
		assert_eq!(home_specs.len(), 12);
		assert_eq!(side_specs.len(), 11);
	}

	#[test]
	fn chain_name_parsing() {
		assert_eq!("home".parse::<ChainName>().unwrap(), ChainName::Home);
		assert_eq!("side".parse::<ChainName>().unwrap(), ChainName::Side);
		assert!("mainnet".parse::<ChainName>().is_err());
	}
}
