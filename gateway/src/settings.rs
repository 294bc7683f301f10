use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;
use std::collections::HashMap;

/// Default artifact size cap when neither configuration nor the
/// `MAX_ARTIFACT_SIZE` environment variable says otherwise.
pub const DEFAULT_FALLBACK_SIZE: u64 = 10 * 1024 * 1024;

pub const DEFAULT_CONFIG_PATHS: &[&str] =
	&["/etc/polyswarmd/polyswarmd", "~/.config/polyswarmd/polyswarmd"];

#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about = "polyswarmd gateway daemon")]
pub struct CommandLineOptions {
	/// Path to a settings file, overriding the default search locations.
	#[clap(short = 'c', long = "config")]
	pub config_path: Option<String>,
	#[clap(long = "community")]
	community: Option<String>,
	#[clap(long = "bind.host")]
	bind_host: Option<String>,
	#[clap(long = "bind.port")]
	bind_port: Option<u16>,
	#[clap(long = "auth.uri")]
	auth_uri: Option<String>,
	#[clap(long = "artifact.uri")]
	artifact_uri: Option<String>,
	#[clap(long = "chains.home.eth_uri")]
	home_eth_uri: Option<String>,
	#[clap(long = "chains.side.eth_uri")]
	side_eth_uri: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Bind {
	pub host: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Auth {
	pub uri: Option<String>,
}

impl Auth {
	pub fn require_api_key(&self) -> bool {
		self.uri.is_some()
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct Artifact {
	pub uri: String,
	pub limit: u32,
	pub max_size: u64,
	pub fallback_max_size: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Eth {
	pub trace_transactions: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Websocket {
	pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
	pub eth_uri: String,
	pub chain_id: u64,
	pub free: bool,
	pub nectar_token_address: String,
	pub bounty_registry_address: String,
	pub arbiter_staking_address: String,
	pub erc20_relay_address: String,
	pub offer_registry_address: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainsConfig {
	pub home: ChainConfig,
	pub side: Option<ChainConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub community: String,
	pub bind: Bind,
	#[serde(default)]
	pub auth: Auth,
	pub artifact: Artifact,
	#[serde(default)]
	pub eth: Eth,
	pub chains: ChainsConfig,
	pub websocket: Websocket,
}

impl Settings {
	/// Load settings from, in increasing priority: built-in defaults, the
	/// settings file, `POLYSWARMD__`-prefixed environment variables keyed
	/// by double-underscore-separated config path, and command line
	/// options.
	pub fn load(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let mut builder = Self::set_defaults(Config::builder())?;

		if let Some(path) = &opts.config_path {
			builder = builder.add_source(File::with_name(path));
		} else {
			for path in DEFAULT_CONFIG_PATHS {
				builder = builder.add_source(File::with_name(path).required(false));
			}
		}

		let mut settings: Settings = builder
			.add_source(Environment::with_prefix("POLYSWARMD").separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;

		settings.validate()?;
		Ok(settings)
	}

	fn set_defaults(
		builder: ConfigBuilder<config::builder::DefaultState>,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		let max_artifact_size = std::env::var("MAX_ARTIFACT_SIZE")
			.ok()
			.and_then(|size| size.parse::<u64>().ok())
			.unwrap_or(DEFAULT_FALLBACK_SIZE);

		builder
			.set_default("bind.host", "0.0.0.0")?
			.set_default("bind.port", 31337)?
			.set_default("artifact.limit", 256)?
			.set_default("artifact.max_size", max_artifact_size)?
			.set_default("artifact.fallback_max_size", DEFAULT_FALLBACK_SIZE)?
			.set_default("eth.trace_transactions", false)?
			.set_default("websocket.enabled", true)
	}

	fn validate(&mut self) -> Result<(), ConfigError> {
		if self.artifact.limit < 1 || self.artifact.limit > 256 {
			return Err(ConfigError::Message(
				"artifact limit must be greater than 0 and cannot exceed the contract limit of 256"
					.to_string(),
			))
		}

		if self.artifact.fallback_max_size < 1 {
			return Err(ConfigError::Message(
				"fallback max artifact size must be above 0".to_string(),
			))
		}

		for uri in [Some(&self.chains.home.eth_uri), self.chains.side.as_ref().map(|side| &side.eth_uri)]
			.into_iter()
			.flatten()
		{
			url::Url::parse(uri).map_err(|e| {
				ConfigError::Message(format!("invalid ethereum endpoint {uri}: {e}"))
			})?;
		}

		Ok(())
	}

	/// Maximum accepted request body: the per-artifact cap times the
	/// contract-side maximum artifact count.
	pub fn max_content_length(&self) -> u64 {
		self.artifact.max_size * u64::from(self.artifact.limit)
	}
}

fn insert_command_line_option<T>(map: &mut HashMap<String, Value>, key: &str, option: &Option<T>)
where
	T: Clone + Into<Value>,
{
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "community", &self.community);
		insert_command_line_option(&mut map, "bind.host", &self.bind_host);
		insert_command_line_option(&mut map, "bind.port", &self.bind_port.map(i64::from));
		insert_command_line_option(&mut map, "auth.uri", &self.auth_uri);
		insert_command_line_option(&mut map, "artifact.uri", &self.artifact_uri);
		insert_command_line_option(&mut map, "chains.home.eth_uri", &self.home_eth_uri);
		insert_command_line_option(&mut map, "chains.side.eth_uri", &self.side_eth_uri);

		Ok(map)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	const TEST_CONFIG: &str = r#"
community = "gamma"

[bind]
host = "127.0.0.1"
port = 31337

[artifact]
uri = "http://localhost:5001"

[websocket]
enabled = true

[chains.home]
eth_uri = "http://localhost:8545"
chain_id = 1337
free = false
nectar_token_address = "0x9561C133DD8580860B6b7E504bC5Aa500f0f06a7"
bounty_registry_address = "0xCfEB869F69431e42cdB54A4F4f8f41e46fd3a837"
arbiter_staking_address = "0xe982E462b094850F12AF94d21D470e21bE9D0E9C"
erc20_relay_address = "0xD833215cBcc3f914bD1C9ece3EE7BF8B14f841bb"
offer_registry_address = "0x254dffcd3277C0b1660F6d42EFbB754edaBAbC2B"

[chains.side]
eth_uri = "http://localhost:7545"
chain_id = 1338
free = true
nectar_token_address = "0x9561C133DD8580860B6b7E504bC5Aa500f0f06a7"
bounty_registry_address = "0xCfEB869F69431e42cdB54A4F4f8f41e46fd3a837"
arbiter_staking_address = "0xe982E462b094850F12AF94d21D470e21bE9D0E9C"
erc20_relay_address = "0xD833215cBcc3f914bD1C9ece3EE7BF8B14f841bb"
"#;

	// Tests here read and mutate the process environment, which is shared
	// across the test binary's threads.
	static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

	fn write_test_config() -> tempfile::NamedTempFile {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		file.write_all(TEST_CONFIG.as_bytes()).unwrap();
		file
	}

	fn load_test_settings(file: &tempfile::NamedTempFile) -> Result<Settings, ConfigError> {
		Settings::load(CommandLineOptions {
			config_path: Some(file.path().to_str().unwrap().to_string()),
			..Default::default()
		})
	}

	#[test]
	fn init_settings_from_file() {
		let _guard = ENV_LOCK.lock().unwrap();
		let file = write_test_config();
		let settings = load_test_settings(&file).unwrap();

		assert_eq!(settings.community, "gamma");
		assert_eq!(settings.chains.home.chain_id, 1337);
		assert!(settings.chains.side.as_ref().unwrap().free);
		assert!(!settings.auth.require_api_key());
		assert_eq!(settings.artifact.limit, 256);
		assert_eq!(settings.max_content_length(), DEFAULT_FALLBACK_SIZE * 256);
	}

	#[test]
	fn environment_overlays_file_values() {
		let _guard = ENV_LOCK.lock().unwrap();
		let file = write_test_config();

		// config::Environment reads the process environment at collect
		// time, so this test mutates and restores it.
		std::env::set_var("POLYSWARMD__COMMUNITY", "delta");
		std::env::set_var("POLYSWARMD__ETH__TRACE_TRANSACTIONS", "true");
		let settings = load_test_settings(&file).unwrap();
		std::env::remove_var("POLYSWARMD__COMMUNITY");
		std::env::remove_var("POLYSWARMD__ETH__TRACE_TRANSACTIONS");

		assert_eq!(settings.community, "delta");
		assert!(settings.eth.trace_transactions);
	}

	#[test]
	fn command_line_overrides_all() {
		let _guard = ENV_LOCK.lock().unwrap();
		let file = write_test_config();
		let settings = Settings::load(CommandLineOptions {
			config_path: Some(file.path().to_str().unwrap().to_string()),
			community: Some("epsilon".to_string()),
			bind_port: Some(8080),
			..Default::default()
		})
		.unwrap();

		assert_eq!(settings.community, "epsilon");
		assert_eq!(settings.bind.port, 8080);
	}

	#[test]
	fn rejects_out_of_range_artifact_limit() {
		let _guard = ENV_LOCK.lock().unwrap();
		let file = write_test_config();

		std::env::set_var("POLYSWARMD__ARTIFACT__LIMIT", "512");
		let result = load_test_settings(&file);
		std::env::remove_var("POLYSWARMD__ARTIFACT__LIMIT");

		assert!(result.is_err());
	}
}
