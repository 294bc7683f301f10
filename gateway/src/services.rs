//! Reachability reporting for the gateway's upstream collaborators,
//! served by `GET /status`.

use ethers::types::SyncingStatus;
use serde_json::{json, Value};

use crate::{artifacts::ArtifactClient, chain::Chain, server::auth::AuthClient};

async fn chain_status(chain: &Chain) -> Value {
	let syncing = chain.rpc.syncing().await;
	let block = chain.rpc.block_number().await;

	match (syncing, block) {
		(Ok(syncing), Ok(block)) => json!({
			"reachable": true,
			"syncing": !matches!(syncing, SyncingStatus::IsFalse),
			"block": block.as_u64(),
		}),
		_ => json!({ "reachable": false }),
	}
}

pub async fn status_report(
	community: &str,
	home: &Chain,
	side: Option<&Chain>,
	artifact: &ArtifactClient,
	auth: &AuthClient,
) -> Value {
	let mut report = json!({
		"community": community,
		"home": chain_status(home).await,
		"artifact": { "reachable": artifact.reachable().await },
	});

	if let Some(side) = side {
		report["side"] = chain_status(side).await;
	}
	if let Some(reachable) = auth.reachable().await {
		report["auth"] = json!({ "reachable": reachable });
	}

	report
}
