//! HTTP and websocket surface of the gateway.

pub mod auth;
pub mod response;
pub mod ws;

use ethers::types::{BlockId, BlockNumber, H160, H256, U256};
use serde_json::{json, Value};
use std::{
	collections::HashMap,
	convert::Infallible,
	net::SocketAddr,
	sync::Arc,
	time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;
use warp::{filters::BoxedFilter, http::StatusCode, reply, Filter, Reply};

use crate::{
	artifacts::ArtifactClient,
	chain::{Chain, ChainName, ChainSelectError, Chains},
	constants::MAX_TRANSACTION_BATCH,
	eth::{
		contracts::parse_address,
		extractor::events_from_transaction,
		relay::{relay_transactions, RelayRejection},
		tx::{build_transaction, transfer_calldata},
	},
	server::{
		auth::{api_key_from_header, whitelisted, AuthClient, User},
		response::{failure, success},
	},
	services::status_report,
	settings::Settings,
};

type Query = HashMap<String, String>;
type HandlerResult = Result<reply::Response, reply::Response>;

#[derive(Clone)]
pub struct AppContext {
	pub chains: Arc<Chains>,
	pub auth: AuthClient,
	pub artifact: ArtifactClient,
	pub community: String,
	pub trace_transactions: bool,
	pub websocket_enabled: bool,
	pub max_content_length: u64,
	pub start_time: String,
	pub groups: ws::MessageGroups,
}

impl AppContext {
	pub fn new(
		settings: &Settings,
		chains: Arc<Chains>,
		artifact: ArtifactClient,
		auth: AuthClient,
	) -> Self {
		let start_time = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.expect("the clock is set after 1970")
			.as_secs()
			.to_string();
		Self {
			chains,
			auth,
			artifact,
			community: settings.community.clone(),
			trace_transactions: settings.eth.trace_transactions,
			websocket_enabled: settings.websocket.enabled,
			max_content_length: settings.max_content_length(),
			start_time,
			groups: ws::MessageGroups::default(),
		}
	}
}

/// Check the caller's API key. Routes on the whitelist stay reachable
/// without one even when the deployment requires keys.
async fn authenticate(
	ctx: &AppContext,
	auth_header: Option<String>,
	path: &str,
) -> Result<User, reply::Response> {
	let user = ctx.auth.authenticate(api_key_from_header(auth_header.as_deref())).await;
	if ctx.auth.require_api_key() && !user.authorized && !whitelisted(path) {
		return Err(failure("Unauthorized", StatusCode::UNAUTHORIZED))
	}
	Ok(user)
}

fn select_chain<'a>(ctx: &'a AppContext, query: &Query) -> Result<&'a Arc<Chain>, reply::Response> {
	ctx.chains.select(query.get("chain").map(String::as_str)).map_err(|e| {
		let status = match e {
			ChainSelectError::Unknown | ChainSelectError::SideUnconfigured =>
				StatusCode::BAD_REQUEST,
		};
		failure(e.to_string(), status)
	})
}

/// The caller's Ethereum address: bound by the auth service, or given
/// explicitly in keyless deployments.
fn eth_address(user: &User, query: &Query) -> Result<H160, reply::Response> {
	user.eth_address
		.or_else(|| query.get("account").and_then(|account| parse_address(account).ok()))
		.ok_or_else(|| failure("Source account required", StatusCode::UNAUTHORIZED))
}

fn upstream_failure(chain: &Chain) -> reply::Response {
	failure(
		format!("{} chain node unreachable", chain.name),
		StatusCode::INTERNAL_SERVER_ERROR,
	)
}

async fn handle_status(ctx: AppContext) -> reply::Response {
	success(
		status_report(
			&ctx.community,
			&ctx.chains.home,
			ctx.chains.side.as_deref(),
			&ctx.artifact,
			&ctx.auth,
		)
		.await,
	)
}

async fn nonce_inner(ctx: AppContext, query: Query, auth_header: Option<String>) -> HandlerResult {
	let user = authenticate(&ctx, auth_header, "/nonce").await?;
	let chain = select_chain(&ctx, &query)?;
	let account = eth_address(&user, &query)?;

	let block: Option<BlockId> = if query.contains_key("ignore_pending") {
		None
	} else {
		Some(BlockNumber::Pending.into())
	};

	match chain.rpc.transaction_count(account, block).await {
		Ok(nonce) => Ok(success(json!(nonce.as_u64()))),
		Err(e) => {
			tracing::error!("could not read nonce: {e:#}");
			Err(upstream_failure(chain))
		},
	}
}

async fn pending_inner(
	ctx: AppContext,
	query: Query,
	auth_header: Option<String>,
) -> HandlerResult {
	let user = authenticate(&ctx, auth_header, "/pending").await?;
	let chain = select_chain(&ctx, &query)?;
	let account = eth_address(&user, &query)?;

	let txpool = match chain.rpc.txpool_inspect().await {
		Ok(txpool) => txpool,
		Err(e) => {
			tracing::error!("could not inspect the txpool: {e:#}");
			return Err(upstream_failure(chain))
		},
	};

	let nonces: Vec<String> = [txpool.pending, txpool.queued]
		.into_iter()
		.flat_map(|category| category.get(&account).cloned().unwrap_or_default())
		.map(|(nonce, _)| nonce)
		.collect();

	Ok(success(json!(nonces)))
}

/// Parse and bound the `{transactions: […]}` request body shared by the
/// two transaction routes.
fn transactions_from_body(body: &Value) -> Result<Vec<String>, String> {
	let transactions = body
		.get("transactions")
		.and_then(Value::as_array)
		.ok_or("'transactions' is required and must be an array")?;
	if transactions.len() > MAX_TRANSACTION_BATCH {
		return Err(format!("at most {MAX_TRANSACTION_BATCH} transactions per request"))
	}
	transactions
		.iter()
		.map(|entry| {
			entry
				.as_str()
				.map(str::to_string)
				.ok_or_else(|| "transactions must be hex strings".to_string())
		})
		.collect()
}

async fn get_transactions_inner(
	ctx: AppContext,
	query: Query,
	auth_header: Option<String>,
	body: Value,
) -> HandlerResult {
	let _user = authenticate(&ctx, auth_header, "/transactions").await?;
	let chain = select_chain(&ctx, &query)?;

	let hashes: Vec<H256> = transactions_from_body(&body)
		.and_then(|transactions| {
			transactions
				.iter()
				.map(|raw| {
					raw.strip_prefix("0x")
						.unwrap_or(raw)
						.parse::<H256>()
						.map_err(|_| format!("invalid transaction hash {raw:?}"))
				})
				.collect()
		})
		.map_err(|e| failure(format!("Invalid JSON: {e}"), StatusCode::BAD_REQUEST))?;

	let mut merged: std::collections::BTreeMap<&'static str, Vec<Value>> = Default::default();
	for hash in hashes {
		for (key, values) in
			events_from_transaction(chain, hash, ctx.trace_transactions).await
		{
			merged.entry(key).or_default().extend(values);
		}
	}

	if merged.get("errors").is_some_and(|errors| !errors.is_empty()) {
		tracing::error!("transaction lookup errors: {:?}", merged["errors"]);
		return Err(failure(json!(merged), StatusCode::BAD_REQUEST))
	}
	Ok(success(json!(merged)))
}

async fn post_transactions_inner(
	ctx: AppContext,
	query: Query,
	auth_header: Option<String>,
	body: Value,
) -> HandlerResult {
	let user = authenticate(&ctx, auth_header, "/transactions").await?;
	let chain = select_chain(&ctx, &query)?;

	let transactions = transactions_from_body(&body)
		.map_err(|e| failure(format!("Invalid JSON: {e}"), StatusCode::BAD_REQUEST))?;

	let withdrawal_only = ctx.auth.require_api_key() && !user.authorized;
	let account = user
		.eth_address
		.or_else(|| query.get("account").and_then(|account| parse_address(account).ok()));
	let side_chain_id = ctx.chains.side.as_ref().map(|side| side.chain_id);

	let outcome = relay_transactions(
		chain,
		side_chain_id,
		account,
		withdrawal_only,
		&transactions,
	)
	.await
	.map_err(|e| match e {
		RelayRejection::MultipleWithoutKey => failure(e.to_string(), StatusCode::FORBIDDEN),
	})?;

	if outcome.errors {
		Err(failure(json!(outcome.results), StatusCode::BAD_REQUEST))
	} else {
		Ok(success(json!(outcome.results)))
	}
}

async fn relay_fees_inner(
	ctx: AppContext,
	query: Query,
	auth_header: Option<String>,
) -> HandlerResult {
	let _user = authenticate(&ctx, auth_header, "/relay/fees").await?;
	let chain = select_chain(&ctx, &query)?;

	let call = chain
		.erc20_relay
		.view_call("fees")
		.map_err(|_| failure("fees unavailable", StatusCode::INTERNAL_SERVER_ERROR))?;
	let fees = match chain.rpc.call(&call).await {
		Ok(raw) if raw.len() >= 32 => U256::from_big_endian(&raw[raw.len() - 32..]),
		Ok(_) => return Err(failure("fees unavailable", StatusCode::INTERNAL_SERVER_ERROR)),
		Err(e) => {
			tracing::error!("could not read relay fees: {e:#}");
			return Err(upstream_failure(chain))
		},
	};

	Ok(success(json!({ "fees": fees.as_u64() })))
}

/// Build the single nectar-token transfer moving funds over the relay.
/// Deposits run home -> side, withdrawals side -> home.
async fn relay_funds_inner(
	ctx: AppContext,
	chain_name: ChainName,
	path: &'static str,
	query: Query,
	auth_header: Option<String>,
	body: Value,
) -> HandlerResult {
	let user = authenticate(&ctx, auth_header, path).await?;
	let chain = ctx.chains.get(chain_name).map_err(|e| {
		failure(e.to_string(), StatusCode::BAD_REQUEST)
	})?;
	let account = eth_address(&user, &query)?;

	let amount = body
		.get("amount")
		.and_then(Value::as_str)
		.and_then(|amount| U256::from_dec_str(amount).ok())
		.ok_or_else(|| {
			failure(
				"Invalid JSON: 'amount' is required and must be a decimal string",
				StatusCode::BAD_REQUEST,
			)
		})?;

	let base_nonce = match query.get("base_nonce").and_then(|nonce| nonce.parse::<u64>().ok()) {
		Some(nonce) => U256::from(nonce),
		None => chain
			.rpc
			.transaction_count(account, Some(BlockNumber::Pending.into()))
			.await
			.map_err(|e| {
				tracing::error!("could not read nonce: {e:#}");
				upstream_failure(chain)
			})?,
	};

	let calldata = transfer_calldata(chain, chain.erc20_relay.address, amount)
		.map_err(|_| failure("could not encode transfer", StatusCode::INTERNAL_SERVER_ERROR))?;
	let transaction = build_transaction(
		chain,
		account,
		chain.nectar_token.address,
		calldata,
		base_nonce,
	)
	.await
	.map_err(|e| {
		tracing::error!("could not build relay transaction: {e:#}");
		upstream_failure(chain)
	})?;

	Ok(success(json!({ "transactions": [transaction] })))
}

fn unwrap(result: HandlerResult) -> reply::Response {
	result.unwrap_or_else(|response| response)
}

pub fn routes(ctx: AppContext) -> BoxedFilter<(impl Reply,)> {
	let with_ctx = {
		let ctx = ctx.clone();
		warp::any().map(move || ctx.clone())
	};
	let query = warp::query::<Query>();
	let auth_header = warp::header::optional::<String>("authorization");
	let json_body = {
		let limit = ctx.max_content_length;
		warp::body::content_length_limit(limit).and(warp::body::json::<Value>())
	};

	let status = warp::path!("status")
		.and(warp::get())
		.and(with_ctx.clone())
		.then(handle_status);

	let nonce = warp::path!("nonce")
		.and(warp::get())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.then(|ctx, query, header| async move { unwrap(nonce_inner(ctx, query, header).await) });

	let pending = warp::path!("pending")
		.and(warp::get())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.then(|ctx, query, header| async move {
			unwrap(pending_inner(ctx, query, header).await)
		});

	let get_transactions = warp::path!("transactions")
		.and(warp::get())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.and(json_body.clone())
		.then(|ctx, query, header, body| async move {
			unwrap(get_transactions_inner(ctx, query, header, body).await)
		});

	let post_transactions = warp::path!("transactions")
		.and(warp::post())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.and(json_body.clone())
		.then(|ctx, query, header, body| async move {
			unwrap(post_transactions_inner(ctx, query, header, body).await)
		});

	let relay_fees = warp::path!("relay" / "fees")
		.and(warp::get())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.then(|ctx, query, header| async move {
			unwrap(relay_fees_inner(ctx, query, header).await)
		});

	let relay_deposit = warp::path!("relay" / "deposit")
		.and(warp::post())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.and(json_body.clone())
		.then(|ctx, query, header, body| async move {
			unwrap(
				relay_funds_inner(ctx, ChainName::Home, "/relay/deposit", query, header, body)
					.await,
			)
		});

	let relay_withdrawal = warp::path!("relay" / "withdrawal")
		.and(warp::post())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.and(json_body)
		.then(|ctx, query, header, body| async move {
			unwrap(
				relay_funds_inner(
					ctx,
					ChainName::Side,
					"/relay/withdrawal",
					query,
					header,
					body,
				)
				.await,
			)
		});

	let ws_events = warp::path!("events")
		.and(warp::ws())
		.and(with_ctx.clone())
		.and(query)
		.and(auth_header)
		.then(
			|upgrade: warp::ws::Ws, ctx: AppContext, query: Query, header| async move {
				if !ctx.websocket_enabled {
					return failure("websockets disabled", StatusCode::NOT_FOUND)
				}
				if let Err(response) = authenticate(&ctx, header, "/events").await {
					return response
				}
				match select_chain(&ctx, &query) {
					Ok(chain) => {
						let chain = chain.clone();
						let start_time = ctx.start_time.clone();
						upgrade
							.on_upgrade(move |socket| {
								ws::events_stream(socket, chain, start_time)
							})
							.into_response()
					},
					Err(response) => response,
				}
			},
		);

	let ws_channel_events = warp::path!("events" / Uuid)
		.and(warp::ws())
		.and(with_ctx.clone())
		.and(auth_header)
		.then(|guid: Uuid, upgrade: warp::ws::Ws, ctx: AppContext, header| async move {
			if !ctx.websocket_enabled {
				return failure("websockets disabled", StatusCode::NOT_FOUND)
			}
			if let Err(response) = authenticate(&ctx, header, "/events").await {
				return response
			}
			let chain = ctx.chains.home.clone();
			upgrade
				.on_upgrade(move |socket| ws::channel_events_stream(socket, chain, guid))
				.into_response()
		});

	let ws_messages = warp::path!("messages" / Uuid)
		.and(warp::ws())
		.and(with_ctx)
		.and(auth_header)
		.then(|guid: Uuid, upgrade: warp::ws::Ws, ctx: AppContext, header| async move {
			if !ctx.websocket_enabled {
				return failure("websockets disabled", StatusCode::NOT_FOUND)
			}
			if let Err(response) = authenticate(&ctx, header, "/messages").await {
				return response
			}
			let groups = ctx.groups.clone();
			upgrade
				.on_upgrade(move |socket| ws::messages_relay(socket, guid, groups))
				.into_response()
		});

	status
		.or(nonce)
		.or(pending)
		.or(get_transactions)
		.or(post_transactions)
		.or(relay_fees)
		.or(relay_deposit)
		.or(relay_withdrawal)
		.or(ws_events)
		.or(ws_channel_events)
		.or(ws_messages)
		.recover(handle_rejection)
		.boxed()
}

async fn handle_rejection(err: warp::Rejection) -> Result<reply::Response, Infallible> {
	let response = if err.is_not_found() {
		failure("Not found", StatusCode::NOT_FOUND)
	} else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
		failure("Payload too large", StatusCode::PAYLOAD_TOO_LARGE)
	} else if err.find::<warp::body::BodyDeserializeError>().is_some() {
		failure("Invalid JSON: could not parse request body", StatusCode::BAD_REQUEST)
	} else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
		failure("Method not allowed", StatusCode::METHOD_NOT_ALLOWED)
	} else {
		tracing::error!("unhandled rejection: {err:?}");
		failure("Internal server error", StatusCode::INTERNAL_SERVER_ERROR)
	};
	Ok(response)
}

/// Serve the API until `shutdown` resolves.
pub async fn run(ctx: AppContext, address: SocketAddr, shutdown: impl std::future::Future<Output = ()> + Send + 'static) {
	let (bound, serving) =
		warp::serve(routes(ctx)).bind_with_graceful_shutdown(address, shutdown);
	tracing::info!("listening on {bound}");
	serving.await;
}
