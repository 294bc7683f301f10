use std::time::Duration;

/// Per-call timeout on a filter poll against the node.
pub const FILTER_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounds on the adaptive wait between filter polls, in seconds.
pub const MIN_POLL_WAIT: f64 = 0.5;
pub const MAX_POLL_WAIT: f64 = 8.0;

/// Std deviation of the jitter applied to poll waits so that a fleet of
/// workers doesn't hit the node in lockstep.
pub const POLL_WAIT_JITTER: f64 = 0.1;

pub const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(1);
pub const METADATA_CACHE_TTL: Duration = Duration::from_secs(30);
pub const METADATA_CACHE_SIZE: usize = 15;

pub const AUTH_CACHE_TTL: Duration = Duration::from_secs(30);
pub const AUTH_CACHE_SIZE: usize = 64;

/// Capacity of each websocket subscriber's outbound queue. A subscriber
/// that falls this far behind is dropped rather than stalling the rest.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Close code sent to a subscriber dropped for not draining its queue.
pub const WS_CLOSE_SLOW_CONSUMER: u16 = 4408;

/// How long the subscriber loop waits on an empty queue before probing
/// the socket for a client-initiated close.
pub const SOCKET_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Hard cap on gas, also used to detect out-of-gas receipts.
pub const MAX_GAS_LIMIT: u64 = 50_000_000;

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// `Error(string)`, the solidity revert-reason encoding.
pub const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Receipt-wait deadlines per chain.
pub const HOME_RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);
pub const SIDE_RECEIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between mined-transaction polls while waiting for a receipt.
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum number of entries accepted by the transaction relay.
pub const MAX_TRANSACTION_BATCH: usize = 10;
