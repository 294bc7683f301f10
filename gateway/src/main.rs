use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, process::ExitCode, sync::Arc};

use polyswarmd::{
	artifacts::ArtifactClient,
	chain::Chains,
	events::metadata::MetadataResolver,
	logging,
	server::{self, auth::AuthClient, AppContext},
	settings::{CommandLineOptions, Settings},
};

const EXIT_FAILURE: u8 = 1;
const EXIT_BAD_LOG_LEVEL: u8 = 10;

fn main() -> ExitCode {
	let options = CommandLineOptions::parse();

	let settings = match Settings::load(options) {
		Ok(settings) => settings,
		Err(e) => {
			eprintln!("error reading settings: {e}");
			return ExitCode::from(EXIT_FAILURE)
		},
	};

	if let Err(e) = logging::init_from_env() {
		eprintln!("{e}");
		return ExitCode::from(EXIT_BAD_LOG_LEVEL)
	}

	match run(settings) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{e:#}");
			ExitCode::from(EXIT_FAILURE)
		},
	}
}

#[tokio::main]
async fn run(settings: Settings) -> anyhow::Result<()> {
	tracing::info!("starting polyswarmd for community {}", settings.community);

	let artifact = ArtifactClient::new(&settings.artifact.uri);
	let resolver = MetadataResolver::new(artifact.clone());
	let chains = Arc::new(Chains::connect(&settings, resolver).await?);
	let auth = AuthClient::new(&settings);

	let address: SocketAddr = format!("{}:{}", settings.bind.host, settings.bind.port)
		.parse()
		.with_context(|| {
			format!("invalid bind address {}:{}", settings.bind.host, settings.bind.port)
		})?;

	let ctx = AppContext::new(&settings, chains, artifact, auth);
	server::run(ctx, address, async {
		let _ = tokio::signal::ctrl_c().await;
		tracing::info!("shutting down");
	})
	.await;

	Ok(())
}
