use anyhow::{anyhow, bail, Context, Result};
use ethers::{
	abi::{self, Contract, Token},
	types::{transaction::eip2718::TypedTransaction, Eip1559TransactionRequest, H160, H256},
};
use std::str::FromStr;

use crate::eth::rpc::EthRpcApi;

/// Contract versions the gateway can interface with, as `[min, max)`
/// semver ranges checked against each binding's on-chain `VERSION()`.
pub const SUPPORTED_CONTRACT_VERSIONS: &[(&str, (u64, u64, u64), (u64, u64, u64))] = &[
	("ArbiterStaking", (1, 2, 0), (1, 3, 0)),
	("BountyRegistry", (1, 6, 0), (1, 7, 0)),
	("ERC20Relay", (1, 2, 0), (1, 4, 0)),
	("OfferRegistry", (1, 2, 0), (1, 3, 0)),
];

/// An event's topic is recalculated on every `Event::signature()` call,
/// so cache it next to the definition.
#[derive(Clone)]
pub struct SignatureAndEvent {
	pub signature: H256,
	pub event: abi::Event,
}

impl SignatureAndEvent {
	pub fn new(contract: &Contract, name: &str) -> Result<Self> {
		let event = contract.event(name)?;
		Ok(Self { signature: event.signature(), event: event.clone() })
	}
}

/// A deployed contract the gateway interacts with: its checksum address
/// plus the loaded ABI.
pub struct ContractBinding {
	pub name: &'static str,
	pub address: H160,
	pub abi: Contract,
}

impl ContractBinding {
	pub fn new(name: &'static str, address: &str, abi_bytes: &[u8]) -> Result<Self> {
		Ok(Self {
			name,
			address: parse_address(address)
				.with_context(|| format!("invalid {name} address {address}"))?,
			abi: Contract::load(abi_bytes)
				.with_context(|| format!("could not load {name} ABI"))?,
		})
	}

	pub fn event(&self, name: &str) -> Result<SignatureAndEvent> {
		SignatureAndEvent::new(&self.abi, name)
	}

	/// Encode a call to a view function taking no arguments.
	pub fn view_call(&self, function: &str) -> Result<TypedTransaction> {
		let data = self.abi.function(function)?.encode_input(&[])?;
		Ok(TypedTransaction::Eip1559(
			Eip1559TransactionRequest::new().to(self.address).data(data),
		))
	}

	/// Validate the on-chain `VERSION()` against the supported range for
	/// this contract. Contracts without an entry in the table are not
	/// versioned and pass unchecked.
	pub async fn check_version(&self, rpc: &dyn EthRpcApi) -> Result<()> {
		let Some((_, min, max)) = SUPPORTED_CONTRACT_VERSIONS
			.iter()
			.find(|(name, _, _)| *name == self.name)
		else {
			return Ok(())
		};

		let raw = rpc
			.call(&self.view_call("VERSION")?)
			.await
			.with_context(|| format!("no contract version reported by {}", self.name))?;
		let tokens = self
			.abi
			.function("VERSION")?
			.decode_output(&raw)
			.with_context(|| format!("no contract version reported by {}", self.name))?;
		let version = match tokens.first() {
			Some(Token::String(version)) => version.clone(),
			_ => bail!("no contract version reported by {}", self.name),
		};

		let parsed = parse_version(&version).with_context(|| {
			format!("invalid version {version:?} reported by {}, require major.minor.patch", self.name)
		})?;

		if !(*min <= parsed && parsed < *max) {
			bail!(
				"{} reports version {version}, expected a version between {}.{}.{} and {}.{}.{}",
				self.name,
				min.0,
				min.1,
				min.2,
				max.0,
				max.1,
				max.2,
			)
		}

		Ok(())
	}
}

pub fn parse_address(address: &str) -> Result<H160> {
	let stripped = address.strip_prefix("0x").unwrap_or(address);
	H160::from_str(stripped).map_err(|e| anyhow!("{e}"))
}

fn parse_version(version: &str) -> Result<(u64, u64, u64)> {
	let components = version
		.split('.')
		.map(|part| part.parse::<u64>().map_err(|e| anyhow!("{e}")))
		.collect::<Result<Vec<_>>>()?;
	match components[..] {
		[major, minor, patch] => Ok((major, minor, patch)),
		_ => Err(anyhow!("expected three version components, got {}", components.len())),
	}
}

pub const NECTAR_TOKEN_ABI: &[u8] = include_bytes!("abis/NectarToken.json");
pub const BOUNTY_REGISTRY_ABI: &[u8] = include_bytes!("abis/BountyRegistry.json");
pub const ARBITER_STAKING_ABI: &[u8] = include_bytes!("abis/ArbiterStaking.json");
pub const ERC20_RELAY_ABI: &[u8] = include_bytes!("abis/ERC20Relay.json");
pub const OFFER_REGISTRY_ABI: &[u8] = include_bytes!("abis/OfferRegistry.json");
pub const OFFER_MULTISIG_ABI: &[u8] = include_bytes!("abis/OfferMultiSig.json");
