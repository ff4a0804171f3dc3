//! Constant variables.

/// Width of ring identifiers in bits.
pub const KEY_BITS: usize = 160;
/// Max entries tracked by a successor list.
pub const SUCCESSOR_LIST_MAX: u8 = 3;
/// How many reroutes a single lookup may attempt around unreachable hops.
pub const UNDERSHOOT_RETRY_BUDGET: usize = 2;
/// default stabilize interval in ms
pub const DEFAULT_STABILIZE_INTERVAL_MS: u64 = 3000;
/// default finger repair interval in ms
pub const DEFAULT_FIX_FINGERS_INTERVAL_MS: u64 = 1000;
/// default predecessor liveness check interval in ms
pub const DEFAULT_CHECK_PREDECESSOR_INTERVAL_MS: u64 = 5000;
/// default per-call transport deadline in ms
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 3000;
/// 64k, upper bound for one rpc frame on the wire
pub const MAX_FRAME_LEN: usize = 64 * 1024;
/// Abort the process when ring bookkeeping turns out inconsistent.
/// Routing through dangling entries silently mis-delivers, so default is on.
pub const ABORT_ON_BROKEN_RING: bool = true;
